//! `whisper-rs`-backed `StreamingStt`: audio is accumulated as f32 samples
//! and transcribed in one `WhisperState::full` call per utterance, since
//! whisper.cpp has no true incremental streaming mode. `stream_data`
//! therefore just buffers; the real work happens in `transcribe`.

use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperState};

use crate::error::SttError;
use crate::stt::{StreamingStt, Transcript};

pub struct WhisperStt {
    state: WhisperState,
    sampling_strategy: SamplingStrategy,
    audio: Vec<f32>,
    lang: String,
}

impl WhisperStt {
    pub fn new(model_path: &str) -> Result<Self, SttError> {
        let ctx = WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
            .map_err(|e| SttError::Transcription(format!("failed to load whisper model {model_path}: {e}")))?;
        let state = ctx
            .create_state()
            .map_err(|e| SttError::Transcription(format!("failed to create whisper state: {e}")))?;
        Ok(Self {
            state,
            sampling_strategy: SamplingStrategy::BeamSearch { beam_size: 5, patience: -1.0 },
            audio: Vec::new(),
            lang: "en".to_string(),
        })
    }
}

impl StreamingStt for WhisperStt {
    fn stream_start(&mut self, lang: &str) -> Result<(), SttError> {
        self.audio.clear();
        self.lang = lang.split('-').next().unwrap_or(lang).to_string();
        Ok(())
    }

    fn stream_data(&mut self, chunk: &[u8]) -> Result<(), SttError> {
        self.audio.extend(chunk.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32));
        Ok(())
    }

    fn transcribe(&mut self) -> Result<Vec<Transcript>, SttError> {
        if self.audio.is_empty() {
            return Ok(Vec::new());
        }
        let mut params = FullParams::new(self.sampling_strategy.clone());
        params.set_language(Some(&self.lang));
        params.set_print_progress(false);
        params.set_print_special(false);
        params.set_print_realtime(false);

        self.state
            .full(params, &self.audio)
            .map_err(|e| SttError::Transcription(e.to_string()))?;

        let num_segments = self.state.full_n_segments().map_err(|e| SttError::Transcription(e.to_string()))?;
        let mut text = String::new();
        for i in 0..num_segments {
            if let Ok(segment) = self.state.full_get_segment_text(i) {
                text.push_str(&segment);
            }
        }
        self.audio.clear();
        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Transcript::from_bare_string(text)])
    }
}
