//! Audio capture boundary. Concrete microphone drivers are external
//! collaborators; the loop only depends on this contract.

use std::time::Duration;

use crate::chunk::Chunk;
use crate::error::AudioSourceError;

pub trait AudioSource: Send {
    fn start(&mut self) -> Result<(), AudioSourceError>;
    fn stop(&mut self) -> Result<(), AudioSourceError>;

    /// Blocks until a full chunk is available or times out. `Ok(None)`
    /// signals transient unavailability — the loop continues and this is
    /// not fatal.
    fn read_chunk(&mut self) -> Result<Option<Chunk>, AudioSourceError>;

    fn sample_rate(&self) -> u32;
    fn sample_width(&self) -> u8;
    fn sample_channels(&self) -> u8;
    fn chunk_size(&self) -> usize;
}

/// Wraps a bounded mpsc queue fed by a capture thread, the shape every
/// concrete `AudioSource` in this crate uses: capture happens on its own
/// thread and delivers chunks to the loop thread via a channel.
pub struct ChannelAudioSource {
    rx: std::sync::mpsc::Receiver<Vec<u8>>,
    timeout: Duration,
    sample_rate: u32,
    sample_width: u8,
    sample_channels: u8,
    chunk_size: usize,
}

impl ChannelAudioSource {
    pub fn new(
        rx: std::sync::mpsc::Receiver<Vec<u8>>,
        timeout: Duration,
        sample_rate: u32,
        sample_width: u8,
        sample_channels: u8,
        chunk_size: usize,
    ) -> Self {
        Self {
            rx,
            timeout,
            sample_rate,
            sample_width,
            sample_channels,
            chunk_size,
        }
    }
}

impl AudioSource for ChannelAudioSource {
    fn start(&mut self) -> Result<(), AudioSourceError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioSourceError> {
        Ok(())
    }

    fn read_chunk(&mut self) -> Result<Option<Chunk>, AudioSourceError> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(bytes) => Ok(Some(Chunk::new(
                bytes,
                self.sample_rate,
                self.sample_width,
                self.sample_channels,
            ))),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                Err(AudioSourceError::DeviceUnavailable("capture thread disconnected".into()))
            }
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn sample_width(&self) -> u8 {
        self.sample_width
    }

    fn sample_channels(&self) -> u8 {
        self.sample_channels
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_timeout_is_transient_not_fatal() {
        let (_tx, rx) = std::sync::mpsc::channel();
        let mut source = ChannelAudioSource::new(rx, Duration::from_millis(5), 16_000, 2, 1, 3200);
        assert!(matches!(source.read_chunk(), Ok(None)));
    }

    #[test]
    fn disconnected_channel_is_an_error() {
        let (tx, rx) = std::sync::mpsc::channel();
        drop(tx);
        let mut source = ChannelAudioSource::new(rx, Duration::from_millis(5), 16_000, 2, 1, 3200);
        assert!(source.read_chunk().is_err());
    }
}
