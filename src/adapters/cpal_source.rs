//! `cpal`-backed `AudioSource`: a cpal input stream feeds raw samples to a
//! resampler, which packs them into fixed-size PCM chunks delivered to the
//! loop thread over a channel.

use std::sync::mpsc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};

use crate::audio_source::{AudioSource, ChannelAudioSource};
use crate::error::AudioSourceError;

/// Linear-interpolation resampler that packs arbitrary-rate f32 samples
/// into exactly `chunk_size`-byte, 16-bit little-endian mono chunks at
/// `output_rate`, emitting bytes instead of `Vec<f32>` frames since that's
/// what `Chunk` carries.
struct Resampler {
    input_rate: u32,
    output_rate: u32,
    input_channels: u16,
    chunk_size: usize,
    carry: Vec<f32>,
    out_buf: Vec<u8>,
}

impl Resampler {
    fn new(input_rate: u32, output_rate: u32, input_channels: u16, chunk_size: usize) -> Self {
        Self {
            input_rate,
            output_rate,
            input_channels,
            chunk_size,
            carry: Vec::new(),
            out_buf: Vec::new(),
        }
    }

    /// Downmixes to mono, resamples, and returns any number of complete
    /// `chunk_size` byte chunks now available; partial data stays buffered.
    fn push(&mut self, input: &[f32]) -> Vec<Vec<u8>> {
        let channels = self.input_channels.max(1) as usize;
        let mono: Vec<f32> = input
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        self.carry.extend_from_slice(&mono);

        if self.input_rate != self.output_rate && !self.carry.is_empty() {
            let ratio = self.output_rate as f64 / self.input_rate as f64;
            let out_len = ((self.carry.len() as f64 - 1.0).max(0.0) * ratio) as usize;
            let mut resampled = Vec::with_capacity(out_len);
            for i in 0..out_len {
                let src = i as f64 / ratio;
                let lo = src.floor() as usize;
                let hi = (lo + 1).min(self.carry.len() - 1);
                let frac = (src - lo as f64) as f32;
                resampled.push(self.carry[lo] * (1.0 - frac) + self.carry[hi] * frac);
            }
            let consumed = (out_len as f64 / ratio).floor() as usize;
            self.carry.drain(..consumed.min(self.carry.len().saturating_sub(1)));
            for sample in resampled {
                self.out_buf.extend_from_slice(&i16_sample(sample).to_le_bytes());
            }
        } else {
            for sample in self.carry.drain(..) {
                self.out_buf.extend_from_slice(&i16_sample(sample).to_le_bytes());
            }
        }

        let mut chunks = Vec::new();
        while self.out_buf.len() >= self.chunk_size {
            chunks.push(self.out_buf.drain(..self.chunk_size).collect());
        }
        chunks
    }
}

fn i16_sample(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

pub struct CpalAudioSource {
    inner: ChannelAudioSource,
    _stream: Stream,
}

impl CpalAudioSource {
    /// Opens `device_name` (or the host default input device) and starts
    /// capture immediately; chunks become available to `read_chunk` once
    /// the stream begins delivering callbacks.
    pub fn new(
        device_name: Option<&str>,
        target_sample_rate: u32,
        target_sample_channels: u8,
        chunk_size: usize,
        read_timeout: Duration,
    ) -> Result<Self, AudioSourceError> {
        let host = cpal::default_host();
        let device = find_device(&host, device_name)?;
        let supported = device
            .default_input_config()
            .map_err(|e| AudioSourceError::DeviceUnavailable(e.to_string()))?;
        let input_rate = supported.sample_rate().0;
        let input_channels = supported.channels();
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let mut resampler = Resampler::new(input_rate, target_sample_rate, input_channels, chunk_size);

        let err_fn = |err| tracing::warn!(error = %err, "cpal input stream error");
        let stream = match sample_format {
            SampleFormat::F32 => device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        for chunk in resampler.push(data) {
                            let _ = tx.send(chunk);
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| AudioSourceError::DeviceUnavailable(e.to_string()))?,
            other => {
                return Err(AudioSourceError::DeviceUnavailable(format!(
                    "unsupported sample format {other:?}, expected f32"
                )));
            }
        };
        stream.play().map_err(|e| AudioSourceError::DeviceUnavailable(e.to_string()))?;

        let inner = ChannelAudioSource::new(rx, read_timeout, target_sample_rate, 2, target_sample_channels, chunk_size);
        Ok(Self { inner, _stream: stream })
    }
}

fn find_device(host: &cpal::Host, device_name: Option<&str>) -> Result<Device, AudioSourceError> {
    match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| AudioSourceError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioSourceError::DeviceUnavailable(format!("no input device named {name}"))),
        None => host
            .default_input_device()
            .ok_or_else(|| AudioSourceError::DeviceUnavailable("no default input device".to_string())),
    }
}

impl AudioSource for CpalAudioSource {
    fn start(&mut self) -> Result<(), AudioSourceError> {
        self._stream.play().map_err(|e| AudioSourceError::DeviceUnavailable(e.to_string()))
    }

    fn stop(&mut self) -> Result<(), AudioSourceError> {
        self._stream.pause().map_err(|e| AudioSourceError::DeviceUnavailable(e.to_string()))
    }

    fn read_chunk(&mut self) -> Result<Option<crate::chunk::Chunk>, AudioSourceError> {
        self.inner.read_chunk()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn sample_width(&self) -> u8 {
        self.inner.sample_width()
    }

    fn sample_channels(&self) -> u8 {
        self.inner.sample_channels()
    }

    fn chunk_size(&self) -> usize {
        self.inner.chunk_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resampler_emits_complete_chunks_only() {
        let mut resampler = Resampler::new(16_000, 16_000, 1, 8);
        let chunks = resampler.push(&[0.0; 3]);
        assert!(chunks.is_empty());
        let chunks = resampler.push(&[0.0; 1]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 8);
    }

    #[test]
    fn downmixes_stereo_to_mono() {
        let mut resampler = Resampler::new(16_000, 16_000, 2, 4);
        let chunks = resampler.push(&[1.0, -1.0, 1.0, -1.0]);
        assert_eq!(chunks.len(), 1);
        for sample in chunks[0].chunks_exact(2) {
            assert_eq!(i16::from_le_bytes([sample[0], sample[1]]), 0);
        }
    }
}
