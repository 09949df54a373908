//! Typed configuration mirroring the recognized option table, loaded from
//! TOML with serde defaults, and split into four independently-hashable
//! slices so the supervisor can rebuild only what changed on reload.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_sample_rate() -> u32 {
    16_000
}
fn default_sample_width() -> u8 {
    2
}
fn default_sample_channels() -> u8 {
    1
}
fn default_chunk_size() -> usize {
    4096
}
fn default_period_size() -> usize {
    1024
}
fn default_multiplier() -> u32 {
    1
}
fn default_audio_timeout() -> f32 {
    5.0
}
fn default_audio_retries() -> u32 {
    3
}
fn default_audio_retry_delay() -> f32 {
    1.0
}
fn default_wake_word() -> String {
    "hey_mycroft".to_string()
}
fn default_stand_up_word() -> String {
    "wake_up".to_string()
}
fn default_speech_begin() -> f32 {
    0.3
}
fn default_silence_end() -> f32 {
    0.7
}
fn default_recording_timeout() -> f32 {
    10.0
}
fn default_recording_timeout_with_silence() -> f32 {
    5.0
}
fn default_recording_mode_max_silence_seconds() -> f32 {
    30.0
}
fn default_utterance_chunks_to_rewind() -> usize {
    2
}
fn default_wakeword_chunks_to_save() -> usize {
    15
}
fn default_confirmation_seconds() -> f32 {
    0.5
}
fn default_min_stt_confidence() -> f32 {
    0.6
}
fn default_max_transcripts() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_utterance_filename() -> String {
    "{md5}-{uuid4}".to_string()
}
fn default_lang() -> String {
    "en-us".to_string()
}
fn default_hallucination_list() -> Vec<String> {
    vec![
        "thanks for watching!".to_string(),
        "thank you for watching!".to_string(),
        "so".to_string(),
        "beep!".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadConfig {
    pub url: Option<String>,
    #[serde(default)]
    pub disable: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            url: None,
            disable: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_sample_width")]
    pub sample_width: u8,
    #[serde(default = "default_sample_channels")]
    pub sample_channels: u8,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_period_size")]
    pub period_size: usize,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_audio_timeout")]
    pub audio_timeout: f32,
    #[serde(default = "default_audio_retries")]
    pub audio_retries: u32,
    #[serde(default = "default_audio_retry_delay")]
    pub audio_retry_delay: f32,
    pub device_name: Option<String>,
    #[serde(default = "default_wake_word")]
    pub wake_word: String,
    #[serde(default = "default_stand_up_word")]
    pub stand_up_word: String,
    #[serde(default = "default_speech_begin")]
    pub speech_begin: f32,
    #[serde(default = "default_silence_end")]
    pub silence_end: f32,
    #[serde(default = "default_recording_timeout")]
    pub recording_timeout: f32,
    #[serde(default = "default_recording_timeout_with_silence")]
    pub recording_timeout_with_silence: f32,
    #[serde(default = "default_recording_mode_max_silence_seconds")]
    pub recording_mode_max_silence_seconds: f32,
    #[serde(default = "default_utterance_chunks_to_rewind")]
    pub utterance_chunks_to_rewind: usize,
    #[serde(default = "default_wakeword_chunks_to_save")]
    pub wakeword_chunks_to_save: usize,
    #[serde(default)]
    pub continuous_listen: bool,
    #[serde(default)]
    pub hybrid_listen: bool,
    #[serde(default = "default_true")]
    pub instant_listen: bool,
    #[serde(default)]
    pub remove_silence: bool,
    #[serde(default = "default_true")]
    pub mute_during_output: bool,
    #[serde(default)]
    pub record_wake_words: bool,
    #[serde(default)]
    pub save_utterances: bool,
    pub save_path: Option<String>,
    #[serde(default = "default_utterance_filename")]
    pub utterance_filename: String,
    #[serde(default)]
    pub wake_word_upload: UploadConfig,
    #[serde(default)]
    pub stt_upload: UploadConfig,
    #[serde(default)]
    pub fake_barge_in: bool,
    #[serde(default)]
    pub barge_in_volume: Option<f32>,
    #[serde(default = "default_min_stt_confidence")]
    pub min_stt_confidence: f32,
    #[serde(default = "default_max_transcripts")]
    pub max_transcripts: usize,
    #[serde(default = "default_confirmation_seconds")]
    pub confirmation_seconds: f32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty table deserializes with all defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HotwordConfigEntry {
    pub module: Option<String>,
    pub active: Option<bool>,
    #[serde(default)]
    pub listen: bool,
    #[serde(default)]
    pub wakeup: bool,
    #[serde(default)]
    pub stopword: bool,
    #[serde(default)]
    pub trigger: bool,
    pub sound: Option<String>,
    pub utterance: Option<String>,
    pub bus_event: Option<String>,
    pub stt_lang: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SttConfig {
    pub module: Option<String>,
    pub fallback_module: Option<String>,
    #[serde(flatten)]
    pub module_settings: HashMap<String, toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SoundsConfig {
    pub start_listening: Option<String>,
    pub end_listening: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub hotwords: HashMap<String, HotwordConfigEntry>,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub confirm_listening: bool,
    #[serde(default)]
    pub sounds: SoundsConfig,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub secondary_langs: Vec<String>,
    #[serde(default = "default_hallucination_list")]
    pub hallucination_list: Vec<String>,
    #[serde(default = "default_true")]
    pub filter_hallucinations: bool,
    #[serde(default)]
    pub opt_in: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty table deserializes with all defaults")
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Every BCP-47 language the core accepts a transformer's `stt_lang`
    /// hint against: the primary `lang` plus `secondary_langs`.
    pub fn accepted_languages(&self) -> Vec<&str> {
        std::iter::once(self.lang.as_str())
            .chain(self.secondary_langs.iter().map(String::as_str))
            .collect()
    }

    pub fn config_hash(&self) -> ConfigHash {
        ConfigHash {
            stt: hash_value(&self.stt),
            fallback: hash_value(&self.stt.fallback_module),
            hotwords: hash_value(&self.hotwords),
            loop_: hash_value(&(&self.listener, &self.lang, &self.secondary_langs)),
        }
    }
}

/// The four independent config-slice hashes the supervisor diffs on
/// reload to decide which components to rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigHash {
    pub stt: u64,
    pub fallback: u64,
    pub hotwords: u64,
    pub loop_: u64,
}

impl ConfigHash {
    pub fn diff(&self, other: &ConfigHash) -> ChangedSlices {
        ChangedSlices {
            stt: self.stt != other.stt,
            fallback: self.fallback != other.fallback,
            hotwords: self.hotwords != other.hotwords,
            loop_: self.loop_ != other.loop_,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangedSlices {
    pub stt: bool,
    pub fallback: bool,
    pub hotwords: bool,
    pub loop_: bool,
}

impl ChangedSlices {
    pub fn any(&self) -> bool {
        self.stt || self.fallback || self.hotwords || self.loop_
    }
}

fn hash_value<T: Serialize>(value: &T) -> u64 {
    let canonical = serde_json::to_string(value).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    hasher.finish()
}

/// Validates that `lang`'s BCP-47 primary subtag is among the accepted
/// set, per the language-validation design note.
pub fn validate_lang(lang: &str, accepted: &[&str]) -> bool {
    let primary = |tag: &str| tag.split('-').next().unwrap_or(tag).to_ascii_lowercase();
    let wanted = primary(lang);
    accepted.iter().any(|candidate| primary(candidate) == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.listener.speech_begin, 0.3);
        assert_eq!(cfg.listener.silence_end, 0.7);
        assert_eq!(cfg.listener.recording_timeout, 10.0);
        assert_eq!(cfg.listener.recording_timeout_with_silence, 5.0);
        assert_eq!(cfg.listener.utterance_chunks_to_rewind, 2);
        assert_eq!(cfg.listener.wakeword_chunks_to_save, 15);
        assert_eq!(cfg.listener.min_stt_confidence, 0.6);
        assert_eq!(cfg.listener.max_transcripts, 1);
        assert!(cfg.listener.instant_listen);
    }

    #[test]
    fn hash_changes_only_for_touched_slice() {
        let mut cfg = AppConfig::default();
        let before = cfg.config_hash();
        cfg.listener.wake_word = "hey custom".to_string();
        let after = cfg.config_hash();
        let diff = before.diff(&after);
        assert!(diff.loop_);
        assert!(!diff.stt);
        assert!(!diff.hotwords);
    }

    #[test]
    fn validate_lang_matches_primary_subtag_only() {
        assert!(validate_lang("en-GB", &["en-us", "fr-fr"]));
        assert!(!validate_lang("fr-CA", &["en-us"]));
    }
}
