//! Voice-activity detection boundary. Concrete models (WebRTC VAD, Silero,
//! energy-threshold) are external collaborators; only this trait lives here.

use crate::error::VadError;

pub trait VoiceActivityDetector: Send {
    /// Classifies a chunk as speech (`false`) or silence (`true`).
    fn is_silence(&mut self, chunk: &[u8]) -> Result<bool, VadError>;

    /// Optional silence trimming over a full utterance buffer.
    fn extract_speech(&mut self, _audio: &[u8]) -> Option<Vec<u8>> {
        None
    }

    /// Clears internal state so a long silent span doesn't leave the
    /// detector permanently reporting silence.
    fn reset(&mut self) {}
}

/// Baseline threshold-on-energy detector, usable with no external model:
/// reuses `Chunk::debiased_energy` (the same loudness proxy the loop's
/// `Event::Chunk` callback reports) so a crate built with no VAD feature
/// enabled still has a working, if unsophisticated, detector.
pub struct EnergyVad {
    threshold: f32,
    sample_width: u8,
}

impl EnergyVad {
    pub fn new(threshold: f32, sample_width: u8) -> Self {
        Self { threshold, sample_width }
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn is_silence(&mut self, chunk: &[u8]) -> Result<bool, VadError> {
        let probe = crate::chunk::Chunk::new(chunk.to_vec(), 0, self.sample_width, 1);
        Ok(probe.debiased_energy() <= self.threshold)
    }
}

/// Runs `extract_speech`, refusing to shorten audio below one second of
/// playback so a noisy detector can't truncate a real utterance.
pub fn trim_silence(
    vad: &mut dyn VoiceActivityDetector,
    audio: &[u8],
    bytes_per_second: usize,
) -> Vec<u8> {
    let min_len = bytes_per_second;
    match vad.extract_speech(audio) {
        Some(trimmed) if trimmed.len() >= min_len => trimmed,
        _ => audio.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedVad(bool);
    impl VoiceActivityDetector for FixedVad {
        fn is_silence(&mut self, _chunk: &[u8]) -> Result<bool, VadError> {
            Ok(self.0)
        }

        fn extract_speech(&mut self, audio: &[u8]) -> Option<Vec<u8>> {
            Some(audio[..audio.len() / 2].to_vec())
        }
    }

    #[test]
    fn trim_silence_refuses_short_result() {
        let mut vad = FixedVad(false);
        let audio = vec![1u8; 3200];
        let trimmed = trim_silence(&mut vad, &audio, 16_000 * 2);
        assert_eq!(trimmed.len(), audio.len());
    }

    #[test]
    fn trim_silence_accepts_result_above_floor() {
        let mut vad = FixedVad(false);
        let audio = vec![1u8; 64_000];
        let trimmed = trim_silence(&mut vad, &audio, 16_000);
        assert_eq!(trimmed.len(), 32_000);
    }

    #[test]
    fn energy_vad_flags_loud_chunk_as_speech() {
        let mut vad = EnergyVad::new(1000.0, 2);
        let mut loud = Vec::new();
        for _ in 0..100 {
            loud.extend_from_slice(&8000i16.to_le_bytes());
        }
        assert!(!vad.is_silence(&loud).unwrap());
        assert!(vad.is_silence(&vec![0u8; 200]).unwrap());
    }
}
