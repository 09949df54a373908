//! Fixed-size PCM audio chunk, the unit every detector/transformer/STT
//! boundary in this crate speaks.

use std::sync::Arc;

/// An immutable block of PCM audio of exactly `chunk_size` bytes.
///
/// Cheap to clone: the byte payload is reference-counted so pushing the
/// same chunk into the rewind deque, the hotword-save deque, and the STT
/// accumulator never copies audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    data: Arc<[u8]>,
    sample_rate: u32,
    sample_width: u8,
    sample_channels: u8,
}

impl Chunk {
    pub fn new(data: impl Into<Arc<[u8]>>, sample_rate: u32, sample_width: u8, sample_channels: u8) -> Self {
        Self {
            data: data.into(),
            sample_rate,
            sample_width,
            sample_channels,
        }
    }

    /// A chunk of `len` silent bytes, used for the muted substitution path.
    pub fn silence(len: usize, sample_rate: u32, sample_width: u8, sample_channels: u8) -> Self {
        Self::new(vec![0u8; len], sample_rate, sample_width, sample_channels)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sample_width(&self) -> u8 {
        self.sample_width
    }

    pub fn sample_channels(&self) -> u8 {
        self.sample_channels
    }

    /// `seconds_per_chunk = chunk_size / (sample_rate * sample_width * sample_channels)`
    pub fn seconds_per_chunk(&self) -> f32 {
        let denom = self.sample_rate as f32 * self.sample_width as f32 * self.sample_channels as f32;
        if denom == 0.0 {
            0.0
        } else {
            self.len() as f32 / denom
        }
    }

    /// Debiased RMS energy: the RMS of the samples after subtracting the
    /// signed RMS re-broadcast as a little-endian integer of `sample_width`.
    /// Used as a numerically stable loudness proxy for the chunk callback.
    pub fn debiased_energy(&self) -> f32 {
        let width = self.sample_width as usize;
        if width == 0 || width > 8 || self.data.len() < width {
            return 0.0;
        }
        let samples: Vec<i64> = self
            .data
            .chunks_exact(width)
            .map(|bytes| le_signed(bytes))
            .collect();
        if samples.is_empty() {
            return 0.0;
        }
        let mean_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / samples.len() as f64;
        let rms = mean_sq.sqrt();
        let bias = -rms;
        let bias_int = bias.round() as i64;
        let debiased_mean_sq: f64 = samples
            .iter()
            .map(|&s| {
                let v = (s + bias_int) as f64;
                v * v
            })
            .sum::<f64>()
            / samples.len() as f64;
        debiased_mean_sq.sqrt() as f32
    }
}

fn le_signed(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    let unsigned = u64::from_le_bytes(buf);
    let shift = (8 - bytes.len()) * 8;
    ((unsigned << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_has_zero_energy() {
        let chunk = Chunk::silence(3200, 16_000, 2, 1);
        assert_eq!(chunk.debiased_energy(), 0.0);
    }

    #[test]
    fn seconds_per_chunk_matches_formula() {
        let chunk = Chunk::new(vec![0u8; 3200], 16_000, 2, 1);
        assert!((chunk.seconds_per_chunk() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn louder_chunk_has_higher_energy() {
        let quiet = Chunk::new(vec![1, 0, 1, 0, 1, 0, 1, 0], 16_000, 2, 1);
        let mut loud_bytes = Vec::new();
        for _ in 0..4 {
            loud_bytes.extend_from_slice(&8000i16.to_le_bytes());
        }
        let loud = Chunk::new(loud_bytes, 16_000, 2, 1);
        assert!(loud.debiased_energy() > quiet.debiased_energy());
    }
}
