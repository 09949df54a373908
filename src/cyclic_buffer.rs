//! Fixed-duration byte ring used to feed non-streaming keyword spotters a
//! rolling window of audio.

/// A ring buffer of a fixed byte capacity, initialized with silence.
#[derive(Debug, Clone)]
pub struct CyclicBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl CyclicBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            capacity,
        }
    }

    /// Slides `bytes` in, evicting the oldest bytes of the same count.
    /// If `bytes` is longer than the buffer, only its tail is kept.
    pub fn append(&mut self, bytes: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        if bytes.len() >= self.capacity {
            let start = bytes.len() - self.capacity;
            self.data.copy_from_slice(&bytes[start..]);
            return;
        }
        let keep = self.capacity - bytes.len();
        self.data.copy_within(bytes.len().., 0);
        self.data[keep..].copy_from_slice(bytes);
    }

    pub fn get(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|b| *b = 0);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_slide_oldest_out() {
        let mut buf = CyclicBuffer::new(4);
        buf.append(&[1, 2]);
        assert_eq!(buf.get(), &[0, 0, 1, 2]);
        buf.append(&[3, 4]);
        assert_eq!(buf.get(), &[1, 2, 3, 4]);
        buf.append(&[5]);
        assert_eq!(buf.get(), &[2, 3, 4, 5]);
    }

    #[test]
    fn oversized_append_keeps_tail() {
        let mut buf = CyclicBuffer::new(3);
        buf.append(&[1, 2, 3, 4, 5]);
        assert_eq!(buf.get(), &[3, 4, 5]);
    }

    #[test]
    fn clear_restores_silence() {
        let mut buf = CyclicBuffer::new(3);
        buf.append(&[9, 9, 9]);
        buf.clear();
        assert_eq!(buf.get(), &[0, 0, 0]);
    }
}
