//! Priority-ordered audio transformer pipeline, grounded on
//! `AudioTransformersService`: plugins see tagged chunks as they stream in
//! and, at command end, may rewrite the captured audio and attach metadata
//! (e.g. a detected language hint).

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::chunk::Chunk;

pub trait AudioTransformer: Send {
    fn name(&self) -> &str;

    /// Higher runs first and its metadata wins on key collisions.
    fn priority(&self) -> i32 {
        50
    }

    fn feed_audio_chunk(&mut self, _chunk: &Chunk) {}
    fn feed_hotword_chunk(&mut self, _chunk: &Chunk) {}
    fn feed_speech_chunk(&mut self, _chunk: &Chunk) {}

    /// Called once per drained speech chunk before `transform`, mirroring
    /// `feed_speech_utterance`; returns a possibly-rewritten chunk.
    fn feed_speech_utterance(&mut self, chunk: Chunk) -> Chunk {
        chunk
    }

    /// Runs at command end. Returns the (possibly rewritten) audio plus
    /// any metadata this plugin contributes.
    fn transform(&mut self, audio: Vec<u8>) -> (Vec<u8>, BTreeMap<String, Value>);

    fn shutdown(&mut self) {}
}

pub struct AudioTransformerChain {
    plugins: Vec<Box<dyn AudioTransformer>>,
}

impl AudioTransformerChain {
    pub fn new(mut plugins: Vec<Box<dyn AudioTransformer>>) -> Self {
        plugins.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        Self { plugins }
    }

    pub fn feed_audio(&mut self, chunk: &Chunk) {
        for plugin in &mut self.plugins {
            plugin.feed_audio_chunk(chunk);
        }
    }

    pub fn feed_hotword(&mut self, chunk: &Chunk) {
        for plugin in &mut self.plugins {
            plugin.feed_hotword_chunk(chunk);
        }
    }

    pub fn feed_speech(&mut self, chunk: &Chunk) {
        for plugin in &mut self.plugins {
            plugin.feed_speech_chunk(chunk);
        }
    }

    /// `context` starts with the default client/source/destination keys,
    /// then each plugin's metadata is folded in without overwriting a key
    /// a higher-priority plugin already set.
    pub fn transform(&mut self, mut audio: Vec<u8>) -> (Vec<u8>, BTreeMap<String, Value>) {
        let mut context = BTreeMap::new();
        context.insert("client_name".to_string(), Value::String("hearth_listener".to_string()));
        context.insert("source".to_string(), Value::String("audio".to_string()));
        context.insert(
            "destination".to_string(),
            Value::Array(vec![Value::String("skills".to_string())]),
        );

        for plugin in &mut self.plugins {
            debug!(plugin = plugin.name(), "running audio transformer");
            let (new_audio, data) = plugin.transform(audio);
            audio = new_audio;
            for (key, value) in data {
                context.entry(key).or_insert(value);
            }
        }
        (audio, context)
    }

    pub fn shutdown(&mut self) {
        for plugin in &mut self.plugins {
            plugin.shutdown();
        }
    }
}

/// Wraps a plugin call so one plugin's panic-free error doesn't halt the
/// rest of the chain. Plugins here report failures as `Result`; this
/// adapter logs and substitutes a no-op outcome.
pub fn isolate<T>(plugin_name: &str, result: Result<T, String>, fallback: T) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            warn!(plugin = plugin_name, error = %err, "audio transformer failed");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tagger {
        name: &'static str,
        priority: i32,
        key: &'static str,
        value: &'static str,
    }

    impl AudioTransformer for Tagger {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn transform(&mut self, audio: Vec<u8>) -> (Vec<u8>, BTreeMap<String, Value>) {
            let mut m = BTreeMap::new();
            m.insert(self.key.to_string(), Value::String(self.value.to_string()));
            (audio, m)
        }
    }

    #[test]
    fn higher_priority_plugin_wins_on_key_collision() {
        let mut chain = AudioTransformerChain::new(vec![
            Box::new(Tagger {
                name: "high",
                priority: 90,
                key: "lang",
                value: "en-us",
            }),
            Box::new(Tagger {
                name: "low",
                priority: 10,
                key: "lang",
                value: "fr-fr",
            }),
        ]);
        let (_, ctx) = chain.transform(vec![]);
        assert_eq!(ctx.get("lang"), Some(&Value::String("en-us".to_string())));
    }

    #[test]
    fn default_context_keys_are_present() {
        let mut chain = AudioTransformerChain::new(vec![]);
        let (_, ctx) = chain.transform(vec![1, 2, 3]);
        assert_eq!(ctx.get("source"), Some(&Value::String("audio".to_string())));
    }
}
