//! Keyword-spotting engine registry: the `HotwordSet` owns every configured
//! wake/wake-up/stop/hot-word engine and exposes a state-filtered `found()`
//! query, mirroring the role split a listening session steps through.

use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::chunk::Chunk;
use crate::config::AppConfig;
use crate::cyclic_buffer::CyclicBuffer;
use crate::error::HotwordError;

/// Engine-facing trait for a single keyword spotter. Concrete wake-word
/// models (ONNX, DNN, template-matching) are external collaborators —
/// only this boundary lives in the core.
pub trait HotwordEngine: Send {
    /// Non-streaming engines inspect `audio_data` (the rolling cyclic
    /// buffer); streaming engines may ignore it and rely on `update`.
    fn found_wake_word(&mut self, audio_data: &[u8]) -> bool;

    /// Streaming engines accumulate state here; non-streaming engines
    /// may no-op.
    fn update(&mut self, _chunk: &[u8]) {}

    /// Clears internal state. Default no-op covers engines with no
    /// resettable state of their own.
    fn reset(&mut self) {}

    fn shutdown(&mut self) {}
}

/// Selects which subset of records the next `found`/`update` call
/// considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HotwordSetState {
    Hotword,
    Listen,
    Recording,
    Wakeup,
}

/// Declared role of a hot-word record. A record may in principle carry
/// more than one role flag; `Role` reports the most specific match for
/// display purposes (`stop` > `wakeup` > `listen` > `hot`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listen,
    Wakeup,
    Stop,
    Hot,
}

/// Static configuration for one hot-word record, keyed by normalized name.
#[derive(Debug, Clone, Default)]
pub struct HotwordRecordConfig {
    pub listen: bool,
    pub wakeup: bool,
    pub stopword: bool,
    pub trigger: bool,
    pub sound: Option<String>,
    pub bus_event: Option<String>,
    pub utterance: Option<String>,
    pub stt_lang: Option<String>,
    /// `None` means "default enabled only if this is the main listen or
    /// wake-up word" — an explicit tri-state rather than a plain bool.
    pub active: Option<bool>,
}

struct HotwordRecord {
    engine: Box<dyn HotwordEngine>,
    config: HotwordRecordConfig,
}

impl HotwordRecord {
    fn role(&self) -> Role {
        if self.config.stopword {
            Role::Stop
        } else if self.config.wakeup {
            Role::Wakeup
        } else if self.config.listen {
            Role::Listen
        } else {
            Role::Hot
        }
    }
}

/// Normalizes a configured hot-word name: internal whitespace becomes `_`.
pub fn normalize_name(name: &str) -> String {
    name.replace(' ', "_")
}

/// Builds a `HotwordSet` from the `hotwords.<name>` config table,
/// instantiating each entry's engine via `engine_factory` (the concrete
/// keyword-spotting model is an external collaborator, per §4.3's
/// `load_from_config`). A factory returning `None` skips that entry
/// entirely — e.g. an unknown `module` name.
pub fn load_from_config(
    config: &AppConfig,
    engine_factory: &dyn Fn(&str, &crate::config::HotwordConfigEntry) -> Option<Box<dyn HotwordEngine>>,
) -> HotwordSet {
    let mut set = HotwordSet::new(3.0, config.listener.sample_rate, config.listener.sample_width);
    for (name, entry) in &config.hotwords {
        let Some(engine) = engine_factory(name, entry) else {
            continue;
        };
        let record_config = HotwordRecordConfig {
            listen: entry.listen,
            wakeup: entry.wakeup,
            stopword: entry.stopword,
            trigger: entry.trigger,
            sound: entry.sound.clone(),
            bus_event: entry.bus_event.clone(),
            utterance: entry.utterance.clone(),
            stt_lang: entry.stt_lang.clone(),
            active: entry.active,
        };
        set.register(
            name,
            engine,
            record_config,
            &config.listener.wake_word,
            &config.listener.stand_up_word,
            config.confirm_listening,
            config.sounds.start_listening.as_deref(),
        );
    }
    set.finish_loading();
    set
}

pub struct HotwordSet {
    records: HashMap<String, HotwordRecord>,
    pub state: HotwordSetState,
    audio_buffer: CyclicBuffer,
    reload_on_failure: bool,
}

impl HotwordSet {
    pub fn new(expected_duration_secs: f32, sample_rate: u32, sample_width: u8) -> Self {
        let capacity = (expected_duration_secs * sample_rate as f32) as usize * sample_width as usize;
        Self {
            records: HashMap::new(),
            state: HotwordSetState::Hotword,
            audio_buffer: CyclicBuffer::new(capacity),
            reload_on_failure: false,
        }
    }

    /// Registers a loaded engine under `name` if it is enabled: either its
    /// `active` flag is true, or `active` is unset and `name` equals the
    /// configured main-listen or wake-up word.
    pub fn register(
        &mut self,
        name: &str,
        engine: Box<dyn HotwordEngine>,
        mut config: HotwordRecordConfig,
        main_listen_word: &str,
        wake_up_word: &str,
        global_confirm_listening: bool,
        global_start_listening_sound: Option<&str>,
    ) {
        let name = normalize_name(name);
        config.listen = config.listen || name == normalize_name(main_listen_word);

        let enabled = match config.active {
            Some(flag) => flag,
            None => name == normalize_name(main_listen_word) || name == normalize_name(wake_up_word),
        };
        if !enabled {
            return;
        }
        if config.sound.is_none() && config.listen && global_confirm_listening {
            config.sound = global_start_listening_sound.map(|s| s.to_string());
        }

        self.records.insert(name, HotwordRecord { engine, config });
    }

    pub fn finish_loading(&mut self) {
        if self.listen_subset().is_empty() {
            error!("no listen words loaded");
        } else {
            self.reload_on_failure = true;
        }
        if self.wakeup_subset().is_empty() {
            warn!("no wakeup words loaded");
        }
        if self.stop_subset().is_empty() {
            warn!("no stop words loaded");
        }
    }

    pub fn reload_on_failure(&self) -> bool {
        self.reload_on_failure
    }

    fn subset(&self, role_filter: impl Fn(&HotwordRecordConfig) -> bool) -> Vec<&str> {
        self.records
            .iter()
            .filter(|(_, r)| role_filter(&r.config))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn listen_subset(&self) -> Vec<&str> {
        self.subset(|c| c.listen)
    }

    pub fn wakeup_subset(&self) -> Vec<&str> {
        self.subset(|c| c.wakeup)
    }

    pub fn stop_subset(&self) -> Vec<&str> {
        self.subset(|c| c.stopword)
    }

    pub fn hot_subset(&self) -> Vec<&str> {
        self.subset(|c| !c.stopword && !c.wakeup && !c.listen)
    }

    fn active_subset(&self) -> Vec<&str> {
        match self.state {
            HotwordSetState::Listen => self.listen_subset(),
            HotwordSetState::Wakeup => self.wakeup_subset(),
            HotwordSetState::Recording => self.stop_subset(),
            HotwordSetState::Hotword => self.hot_subset(),
        }
    }

    /// Appends `chunk` to the rolling buffer and forwards it to every
    /// engine in the role-subset implied by `state`.
    pub fn update(&mut self, chunk: &Chunk) {
        self.audio_buffer.append(chunk.bytes());
        let names: Vec<String> = self.active_subset().into_iter().map(String::from).collect();
        for name in names {
            if let Some(record) = self.records.get_mut(&name) {
                record.engine.update(chunk.bytes());
            }
        }
    }

    /// Returns the first engine in the active role-subset reporting
    /// detection. Engine errors are logged and skipped. In `Listen` state
    /// an empty subset is a recoverable "hot-word condition".
    pub fn found(&mut self) -> Result<Option<String>, HotwordError> {
        let names: Vec<String> = self.active_subset().into_iter().map(String::from).collect();
        if names.is_empty() && self.state == HotwordSetState::Listen {
            return Err(HotwordError::EmptySubset(self.state));
        }
        let audio = self.audio_buffer.get().to_vec();
        for name in names {
            if let Some(record) = self.records.get_mut(&name) {
                if record.engine.found_wake_word(&audio) {
                    debug!(hotword = %name, "detected wake word");
                    return Ok(Some(name));
                }
            }
        }
        Ok(None)
    }

    pub fn role_of(&self, name: &str) -> Option<Role> {
        self.records.get(name).map(|r| r.role())
    }

    pub fn config_of(&self, name: &str) -> Option<&HotwordRecordConfig> {
        self.records.get(name).map(|r| &r.config)
    }

    pub fn names(&self) -> Vec<&str> {
        self.records.keys().map(String::as_str).collect()
    }

    pub fn reset(&mut self) {
        self.audio_buffer.clear();
        for record in self.records.values_mut() {
            record.engine.reset();
        }
    }

    pub fn shutdown(&mut self) {
        for record in self.records.values_mut() {
            record.engine.shutdown();
        }
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_from_config_registers_only_factory_hits() {
        let mut config = AppConfig::default();
        config.hotwords.insert(
            "hey computer".to_string(),
            crate::config::HotwordConfigEntry {
                module: Some("known".to_string()),
                listen: true,
                ..Default::default()
            },
        );
        config.hotwords.insert(
            "unsupported".to_string(),
            crate::config::HotwordConfigEntry {
                module: Some("missing".to_string()),
                active: Some(true),
                ..Default::default()
            },
        );
        let set = load_from_config(&config, &|_name, entry| {
            if entry.module.as_deref() == Some("known") {
                Some(Box::new(AlwaysFound) as Box<dyn HotwordEngine>)
            } else {
                None
            }
        });
        assert_eq!(set.names(), vec!["hey_computer"]);
    }

    struct AlwaysFound;
    impl HotwordEngine for AlwaysFound {
        fn found_wake_word(&mut self, _audio_data: &[u8]) -> bool {
            true
        }
    }

    struct NeverFound;
    impl HotwordEngine for NeverFound {
        fn found_wake_word(&mut self, _audio_data: &[u8]) -> bool {
            false
        }
    }

    fn make_set() -> HotwordSet {
        HotwordSet::new(3.0, 16_000, 2)
    }

    #[test]
    fn main_listen_word_is_auto_enabled() {
        let mut set = make_set();
        set.register(
            "hey computer",
            Box::new(AlwaysFound),
            HotwordRecordConfig::default(),
            "hey computer",
            "wake up",
            false,
            None,
        );
        assert_eq!(set.listen_subset(), vec!["hey_computer"]);
    }

    #[test]
    fn non_default_word_is_disabled_without_active_flag() {
        let mut set = make_set();
        set.register(
            "extra word",
            Box::new(AlwaysFound),
            HotwordRecordConfig::default(),
            "hey computer",
            "wake up",
            false,
            None,
        );
        assert!(set.names().is_empty());
    }

    #[test]
    fn found_in_listen_state_errors_on_empty_subset() {
        let mut set = make_set();
        set.state = HotwordSetState::Listen;
        assert!(matches!(set.found(), Err(HotwordError::EmptySubset(_))));
    }

    #[test]
    fn found_returns_first_detecting_engine() {
        let mut set = make_set();
        set.state = HotwordSetState::Listen;
        set.register(
            "hey computer",
            Box::new(AlwaysFound),
            HotwordRecordConfig {
                listen: true,
                ..Default::default()
            },
            "hey computer",
            "wake up",
            false,
            None,
        );
        set.register(
            "stop",
            Box::new(NeverFound),
            HotwordRecordConfig {
                stopword: true,
                active: Some(true),
                ..Default::default()
            },
            "hey computer",
            "wake up",
            false,
            None,
        );
        assert_eq!(set.found().unwrap(), Some("hey_computer".to_string()));
    }
}
