//! Error taxonomy for the voice-input front-end.
//!
//! Mirrors the transient/recoverable/fatal split described by the loop:
//! transient failures are logged and skipped, recoverable ones surface as
//! a distinguished variant the `Service` may retry against, and fatal ones
//! stop `VoiceLoop::run`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioSourceError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("audio source timed out after {0:?} without producing a chunk")]
    Starved(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum VadError {
    #[error("voice activity detector failed: {0}")]
    Detection(String),
}

#[derive(Debug, Error)]
pub enum SttError {
    #[error("speech-to-text engine failed: {0}")]
    Transcription(String),
}

/// Raised when a `HotwordSet::found` query is made against an empty
/// role-subset.
#[derive(Debug, Error)]
pub enum HotwordError {
    #[error("no hot-word engines available for role-subset {0:?}")]
    EmptySubset(crate::hotwords::HotwordSetState),
    #[error("hot-word engine {name} failed: {source}")]
    Engine { name: String, source: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unrecognized language tag: {0}")]
    InvalidLang(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to write audio artifact {path:?}: {source}")]
    Wav {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },
    #[error("failed to write sidecar metadata {path:?}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("filename template referenced unknown key(s): {0:?}")]
    UnknownTemplateKeys(Vec<String>),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("dataset upload request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid upload URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Top-level failures `VoiceLoop::run` can surface through its status
/// callback. Fatal variants stop the loop; the rest are logged in place.
#[derive(Debug, Error)]
pub enum VoiceLoopError {
    #[error("audio source: {0}")]
    Audio(#[from] AudioSourceError),
    #[error(transparent)]
    Hotword(#[from] HotwordError),
    #[error(transparent)]
    Stt(#[from] SttError),
    #[error("configuration reload failed: {0}")]
    ReloadFailed(String),
}

impl VoiceLoopError {
    /// Only a handful of conditions actually stop the loop: the source
    /// going away for good, or a hot-word condition the service declined
    /// to recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VoiceLoopError::Audio(AudioSourceError::Starved(_)))
    }
}
