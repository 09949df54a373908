//! `voice_activity_detector`-backed `VoiceActivityDetector`: a neural VAD
//! (Silero, via the `voice_activity_detector` crate) scores each chunk
//! with a speech probability, thresholded into the silence/speech bool
//! the core expects.

use voice_activity_detector::VoiceActivityDetector as SileroVad;

use crate::error::VadError;
use crate::vad::VoiceActivityDetector;

pub struct NeuralVad {
    vad: SileroVad,
    threshold: f32,
}

impl NeuralVad {
    pub fn new(sample_rate: u32, chunk_size: usize, threshold: f32) -> Result<Self, VadError> {
        let vad = SileroVad::builder()
            .sample_rate(sample_rate)
            .chunk_size(chunk_size)
            .build()
            .map_err(|e| VadError::Detection(format!("failed to build VAD: {e}")))?;
        Ok(Self { vad, threshold })
    }
}

impl VoiceActivityDetector for NeuralVad {
    fn is_silence(&mut self, chunk: &[u8]) -> Result<bool, VadError> {
        let samples: Vec<f32> = chunk.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32).collect();
        let probability = self.vad.predict(samples);
        Ok(probability <= self.threshold)
    }

    fn reset(&mut self) {
        self.vad.reset();
    }
}
