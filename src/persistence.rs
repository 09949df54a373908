//! WAV + JSON artifact persistence for wake-word, utterance, and free
//! recording audio, plus a small templated-filename builder for naming
//! the saved files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::PersistenceError;

/// Minimal port of `_TemplateFilenameFormatter`: substitutes `{now}`,
/// `{utcnow}`, `{uuid4}` and any caller-registered keys (here, `{md5}`)
/// into a user-supplied filename template.
pub struct TemplateFilenameFormatter {
    builders: HashMap<String, Box<dyn Fn() -> String + Send + Sync>>,
}

impl Default for TemplateFilenameFormatter {
    fn default() -> Self {
        let mut builders: HashMap<String, Box<dyn Fn() -> String + Send + Sync>> = HashMap::new();
        builders.insert("now".to_string(), Box::new(now_utc_millis));
        builders.insert("utcnow".to_string(), Box::new(now_utc_millis));
        builders.insert("uuid4".to_string(), Box::new(|| uuid::Uuid::new_v4().to_string()));
        Self { builders }
    }
}

impl TemplateFilenameFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or overrides) a builder for `key`, e.g. `{uuid4}` or
    /// `{md5}` computed from the first transcription text.
    pub fn register(&mut self, key: impl Into<String>, builder: impl Fn() -> String + Send + Sync + 'static) {
        self.builders.insert(key.into(), Box::new(builder));
    }

    pub fn format(&self, template: &str) -> Result<String, PersistenceError> {
        let mut result = String::with_capacity(template.len());
        let mut missing = Vec::new();
        let mut chars = template.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if c == '{' {
                let mut key = String::new();
                for (_, c2) in chars.by_ref() {
                    if c2 == '}' {
                        break;
                    }
                    key.push(c2);
                }
                match self.builders.get(&key) {
                    Some(builder) => result.push_str(&builder()),
                    None => missing.push(key),
                }
            } else {
                result.push(c);
            }
        }
        if !missing.is_empty() {
            return Err(PersistenceError::UnknownTemplateKeys(missing));
        }
        Ok(result)
    }
}

/// md5 hex digest, used both as the default `{md5}` utterance-filename
/// builder (over the first transcription's text) and to compute
/// `WakewordContext::engine` (md5 of the owning engine's module name).
pub fn md5_hex(input: &str) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

fn now_utc_millis() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_millis())
}

/// WAV encoding parameters every persisted artifact shares: mono (or
/// configured channels), 16-bit little-endian PCM, 16 kHz by default.
#[derive(Debug, Clone, Copy)]
pub struct WavSpec {
    pub sample_rate: u32,
    pub sample_width: u8,
    pub channels: u8,
}

impl Default for WavSpec {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            sample_width: 2,
            channels: 1,
        }
    }
}

fn write_wav(path: &Path, audio: &[u8], spec: WavSpec) -> Result<(), PersistenceError> {
    let hound_spec = hound::WavSpec {
        channels: spec.channels as u16,
        sample_rate: spec.sample_rate,
        bits_per_sample: spec.sample_width as u16 * 8,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, hound_spec).map_err(|source| PersistenceError::Wav {
        path: path.to_path_buf(),
        source,
    })?;
    for sample in audio.chunks_exact(spec.sample_width as usize) {
        let mut buf = [0u8; 4];
        buf[..sample.len()].copy_from_slice(sample);
        let value = i32::from_le_bytes(buf);
        writer.write_sample(value).map_err(|source| PersistenceError::Wav {
            path: path.to_path_buf(),
            source,
        })?;
    }
    writer.finalize().map_err(|source| PersistenceError::Wav {
        path: path.to_path_buf(),
        source,
    })
}

fn write_sidecar(path: &Path, meta: &Value) -> Result<(), PersistenceError> {
    let text = serde_json::to_string_pretty(meta).unwrap_or_default();
    std::fs::write(path, text).map_err(|source| PersistenceError::Metadata {
        path: path.to_path_buf(),
        source,
    })
}

/// Root directory for persisted artifacts, resolved from the configured
/// `save_path` or an XDG-default data directory when unset.
pub fn resolve_save_path(configured: Option<&str>) -> PathBuf {
    match configured {
        Some(p) => PathBuf::from(p),
        None => dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("hearth-listener")
            .join("listener"),
    }
}

pub struct ArtifactWriter {
    save_path: PathBuf,
    spec: WavSpec,
}

impl ArtifactWriter {
    pub fn new(save_path: PathBuf, spec: WavSpec) -> Self {
        Self { save_path, spec }
    }

    fn ensure_dir(&self, sub: &str) -> std::io::Result<PathBuf> {
        let dir = self.save_path.join(sub);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Persists wake-word audio under `wake_words/`, filename built from
    /// `{name, engine, time, sessionId, accountId, model}`.
    pub fn save_wake_word(&self, audio: &[u8], context: &WakewordContext) -> Result<(PathBuf, PathBuf), PersistenceError> {
        let dir = self.ensure_dir("wake_words").map_err(|source| PersistenceError::Metadata {
            path: self.save_path.join("wake_words"),
            source,
        })?;
        let stem = format!(
            "{}_{}_{}",
            context.name, context.engine, context.time_ms
        );
        let wav_path = dir.join(format!("{stem}.wav"));
        let json_path = dir.join(format!("{stem}.json"));
        write_wav(&wav_path, audio, self.spec)?;
        write_sidecar(&json_path, &serde_json::to_value(context).unwrap_or(Value::Null))?;
        Ok((wav_path, json_path))
    }

    /// Persists an STT utterance under `utterances/`, filename from a
    /// user template (default `{md5}-{uuid4}`).
    pub fn save_utterance(
        &self,
        audio: &[u8],
        meta: &Value,
        formatter: &TemplateFilenameFormatter,
        template: &str,
    ) -> Result<(PathBuf, PathBuf), PersistenceError> {
        let dir = self.ensure_dir("utterances").map_err(|source| PersistenceError::Metadata {
            path: self.save_path.join("utterances"),
            source,
        })?;
        let stem = formatter.format(template)?;
        let wav_path = dir.join(format!("{stem}.wav"));
        let json_path = dir.join(format!("{stem}.json"));
        write_wav(&wav_path, audio, self.spec)?;
        write_sidecar(&json_path, meta)?;
        Ok((wav_path, json_path))
    }

    /// Persists a free recording under `recordings/{recording_name}.wav`.
    pub fn save_recording(&self, audio: &[u8], recording_name: &str, meta: &Value) -> Result<(PathBuf, PathBuf), PersistenceError> {
        let dir = self.ensure_dir("recordings").map_err(|source| PersistenceError::Metadata {
            path: self.save_path.join("recordings"),
            source,
        })?;
        let wav_path = dir.join(format!("{recording_name}.wav"));
        let json_path = dir.join(format!("{recording_name}.json"));
        write_wav(&wav_path, audio, self.spec)?;
        write_sidecar(&json_path, meta)?;
        Ok((wav_path, json_path))
    }
}

/// The legacy wake-word metadata schema saved alongside each recording.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WakewordContext {
    pub name: String,
    /// md5 hex digest of the owning engine's module name.
    pub engine: String,
    pub time_ms: String,
    pub session_id: String,
    pub account_id: String,
    pub model: Option<String>,
}

impl WakewordContext {
    /// `engine` is the md5 hex digest of the owning module name; `account_id`
    /// defaults to the literal `"Anon"` for anonymous/local sessions.
    pub fn new(name: impl Into<String>, module_name: &str, session_id: impl Into<String>, model: Option<String>) -> Self {
        let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
        Self {
            name: name.into(),
            engine: md5_hex(module_name),
            time_ms: now.as_millis().to_string(),
            session_id: session_id.into(),
            account_id: "Anon".to_string(),
            model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_hex_matches_known_digest() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn formatter_default_uuid4_is_not_missing() {
        let formatter = TemplateFilenameFormatter::new();
        assert!(formatter.format("{uuid4}").is_ok());
    }

    #[test]
    fn formatter_substitutes_builtin_keys() {
        let mut formatter = TemplateFilenameFormatter::new();
        formatter.register("md5", || "deadbeef".to_string());
        formatter.register("uuid4", || "fixed-uuid".to_string());
        let name = formatter.format("{md5}-{uuid4}").unwrap();
        assert_eq!(name, "deadbeef-fixed-uuid");
    }

    #[test]
    fn formatter_rejects_unknown_keys() {
        let formatter = TemplateFilenameFormatter::new();
        let result = formatter.format("{doesnotexist}");
        assert!(matches!(result, Err(PersistenceError::UnknownTemplateKeys(keys)) if keys == vec!["doesnotexist".to_string()]));
    }

    #[test]
    fn resolve_save_path_falls_back_to_xdg_default() {
        let path = resolve_save_path(None);
        assert!(path.ends_with("listener"));
    }
}
