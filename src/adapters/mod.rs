//! Reference adapters wiring the core's trait boundaries to concrete
//! crates, gated behind cargo features so the core itself never pulls in
//! a microphone driver, STT engine, or VAD model.

#[cfg(feature = "cpal-source")]
pub mod cpal_source;

#[cfg(feature = "whisper-stt")]
pub mod whisper_stt;

#[cfg(feature = "webrtc-vad")]
pub mod webrtc_vad;
