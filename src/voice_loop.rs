//! The voice-interaction state machine. Owns timing counters, the rewind
//! deque, the STT accumulator, and dispatch to detectors/VAD/STT/
//! transformers/callbacks. Single-threaded and cooperative: one chunk is
//! processed to completion before the next is read.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::warn;

use crate::audio_source::AudioSource;
use crate::chunk::Chunk;
use crate::config::validate_lang;
use crate::error::{HotwordError, VoiceLoopError};
use crate::hotwords::{HotwordSet, HotwordSetState, Role};
use crate::stt::{transcribe_with_fallback, StreamingStt, Transcript};
use crate::transformers::AudioTransformerChain;
use crate::vad::VoiceActivityDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Wakeword,
    Continuous,
    Hybrid,
    Sleeping,
}

/// Sub-state-owned timing counters. Exactly one is "live" at a time, per
/// the invariant that every other counter is reset at entry of its state.
#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    timeout_seconds_left: f32,
    timeout_seconds_with_silence_left: f32,
    speech_seconds_left: f32,
    silence_seconds_left: f32,
    confirmation_seconds_left: f32,
    recording_seconds_with_silence_left: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    DetectWakeword,
    WaitingCmd,
    Recording { recording_name: Option<String> },
    Sleeping,
    CheckWakeUp,
    Confirmation,
    BeforeCommand,
    InCommand,
    AfterCommand,
}

#[derive(Debug, Clone, Copy)]
pub struct TimingParams {
    pub speech_seconds: f32,
    pub silence_seconds: f32,
    pub timeout_seconds: f32,
    pub timeout_seconds_with_silence: f32,
    pub confirmation_seconds: f32,
    pub recording_mode_max_silence_seconds: f32,
    pub num_stt_rewind_chunks: usize,
    pub num_hotword_keep_chunks: usize,
    pub instant_listen: bool,
    pub remove_silence: bool,
    pub min_stt_confidence: f32,
    pub max_transcripts: usize,
    pub hallucination_list: Vec<String>,
    pub filter_hallucinations: bool,
    pub accepted_languages: Vec<String>,
    pub sleeping_wake_timeout_seconds: f32,
}

impl TimingParams {
    /// Builds timing parameters from the "loop" config slice, the same
    /// grouping `AppConfig::config_hash` hashes together.
    pub fn from_config(cfg: &crate::config::AppConfig) -> Self {
        let l = &cfg.listener;
        Self {
            speech_seconds: l.speech_begin,
            silence_seconds: l.silence_end,
            timeout_seconds: l.recording_timeout,
            timeout_seconds_with_silence: l.recording_timeout_with_silence,
            confirmation_seconds: l.confirmation_seconds,
            recording_mode_max_silence_seconds: l.recording_mode_max_silence_seconds,
            num_stt_rewind_chunks: l.utterance_chunks_to_rewind,
            num_hotword_keep_chunks: l.wakeword_chunks_to_save,
            instant_listen: l.instant_listen,
            remove_silence: l.remove_silence,
            min_stt_confidence: l.min_stt_confidence,
            max_transcripts: l.max_transcripts,
            hallucination_list: cfg.hallucination_list.clone(),
            filter_hallucinations: cfg.filter_hallucinations,
            accepted_languages: cfg.accepted_languages().into_iter().map(String::from).collect(),
            sleeping_wake_timeout_seconds: 10.0,
        }
    }
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            speech_seconds: 0.3,
            silence_seconds: 0.7,
            timeout_seconds: 10.0,
            timeout_seconds_with_silence: 5.0,
            confirmation_seconds: 0.5,
            recording_mode_max_silence_seconds: 30.0,
            num_stt_rewind_chunks: 2,
            num_hotword_keep_chunks: 15,
            instant_listen: true,
            remove_silence: false,
            min_stt_confidence: 0.6,
            max_transcripts: 1,
            hallucination_list: vec![
                "thanks for watching!".to_string(),
                "thank you for watching!".to_string(),
                "so".to_string(),
                "beep!".to_string(),
            ],
            filter_hallucinations: true,
            accepted_languages: vec!["en-us".to_string()],
            sleeping_wake_timeout_seconds: 10.0,
        }
    }
}

/// Events fired by the loop, consumed by a `Service`/supervisor to
/// translate into bus messages and persisted artifacts. Synchronous,
/// non-blocking: any I/O a subscriber needs must be fired-and-forgotten
/// on a background worker.
pub enum Event {
    ListenwordAudio { audio: Vec<u8>, name: String },
    WakeCallback { name: String },
    WakeupwordAudio { audio: Vec<u8> },
    Wakeup,
    Hotword { name: String, bus_event: Option<String>, utterance: Option<String> },
    Stopword { name: String },
    SttAudio { audio: Vec<u8>, meta: Value },
    RecordEnd,
    Text { transcripts: Vec<Transcript>, meta: Value },
    SpeechRecognitionUnknown,
    RecordingAudio { audio: Vec<u8>, recording_name: String },
    Chunk { energy: f32 },
    ReloadEligible(HotwordError),
}

pub trait EventSink {
    fn handle(&mut self, event: Event);
}

impl<F: FnMut(Event)> EventSink for F {
    fn handle(&mut self, event: Event) {
        self(event)
    }
}

pub struct VoiceLoop {
    pub state: State,
    pub mode: Mode,
    audio_source: Box<dyn AudioSource>,
    hotwords: HotwordSet,
    vad: Box<dyn VoiceActivityDetector>,
    transformers: AudioTransformerChain,
    primary_stt: Box<dyn StreamingStt>,
    fallback_stt: Option<Box<dyn StreamingStt>>,
    params: TimingParams,
    counters: Counters,
    stt_chunks: VecDeque<Chunk>,
    hotword_chunks: VecDeque<Chunk>,
    stt_audio_bytes: Vec<u8>,
    pub is_muted: bool,
    pub skip_next_wake: bool,
    elapsed_seconds: f32,
    last_ww: f32,
    running: bool,
    wake_fired_this_utterance: bool,
    /// The mode active before `go_to_sleep()`, restored on wake so the
    /// loop doesn't get stuck permanently in `Mode::Sleeping`.
    pre_sleep_mode: Option<Mode>,
}

impl VoiceLoop {
    pub fn new(
        audio_source: Box<dyn AudioSource>,
        hotwords: HotwordSet,
        vad: Box<dyn VoiceActivityDetector>,
        transformers: AudioTransformerChain,
        primary_stt: Box<dyn StreamingStt>,
        fallback_stt: Option<Box<dyn StreamingStt>>,
        params: TimingParams,
        mode: Mode,
    ) -> Self {
        Self {
            state: State::DetectWakeword,
            mode,
            audio_source,
            hotwords,
            vad,
            transformers,
            primary_stt,
            fallback_stt,
            params,
            counters: Counters::default(),
            stt_chunks: VecDeque::new(),
            hotword_chunks: VecDeque::new(),
            stt_audio_bytes: Vec::new(),
            is_muted: false,
            skip_next_wake: false,
            elapsed_seconds: 0.0,
            last_ww: 0.0,
            running: true,
            wake_fired_this_utterance: false,
            pre_sleep_mode: None,
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Forces a state transition from outside the loop, e.g. the
    /// supervisor's `state.set` bus handler. Clears utterance state and
    /// timers exactly as a normal transition into the target state would.
    pub fn force_state(&mut self, state: State) {
        self.clear_utterance_state();
        self.reset_counters();
        if let State::Recording { .. } = &state {
            self.counters.recording_seconds_with_silence_left = self.params.recording_mode_max_silence_seconds;
        }
        self.state = state;
    }

    /// Ends free-recording mode on external request (`record_stop` bus
    /// event), flushing whatever audio was captured so far.
    pub fn stop_recording(&mut self, sink: &mut dyn EventSink) {
        if let State::Recording { recording_name } = self.state.clone() {
            sink.handle(Event::RecordingAudio {
                audio: self.stt_audio_bytes.clone(),
                recording_name: recording_name.unwrap_or_default(),
            });
            sink.handle(Event::RecordEnd);
            self.clear_utterance_state();
            self.state = State::DetectWakeword;
        }
    }

    /// Extends the hybrid-mode listening window, as the `skills.activated`
    /// bus event does.
    pub fn extend_hybrid_window(&mut self) {
        self.last_ww = self.elapsed_seconds;
    }

    pub fn last_ww(&self) -> f32 {
        self.last_ww
    }

    /// Swaps the primary STT engine, used by the supervisor when the `stt`
    /// config slice changes on reload.
    pub fn replace_primary_stt(&mut self, stt: Box<dyn StreamingStt>) {
        self.primary_stt = stt;
    }

    /// Swaps the fallback STT engine, used when the `fallback` config
    /// slice changes on reload.
    pub fn replace_fallback_stt(&mut self, stt: Option<Box<dyn StreamingStt>>) {
        self.fallback_stt = stt;
    }

    /// Swaps the hot-word registry, used when the `hotwords` config slice
    /// changes on reload.
    pub fn replace_hotwords(&mut self, hotwords: HotwordSet) {
        self.hotwords = hotwords;
    }

    /// Swaps the timing parameters, used when the `loop` config slice
    /// changes on reload.
    pub fn replace_timing(&mut self, params: TimingParams) {
        self.params = params;
    }

    /// Swaps the VAD implementation, bundled with the `loop` config slice.
    pub fn replace_vad(&mut self, vad: Box<dyn VoiceActivityDetector>) {
        self.vad = vad;
    }

    /// Swaps the audio source, bundled with the `loop` config slice (mic
    /// settings live alongside timing in `ListenerConfig`).
    pub fn replace_audio_source(&mut self, source: Box<dyn AudioSource>) {
        self.audio_source = source;
    }

    fn rewind_capacity(&self) -> usize {
        let base = self.params.num_stt_rewind_chunks + 1;
        match self.mode {
            Mode::Continuous => base * 3,
            _ => base,
        }
    }

    fn push_rewind(&mut self, chunk: Chunk) {
        self.stt_chunks.push_back(chunk);
        while self.stt_chunks.len() > self.rewind_capacity() {
            self.stt_chunks.pop_front();
        }
    }

    fn push_hotword_keep(&mut self, chunk: Chunk) {
        self.hotword_chunks.push_back(chunk);
        while self.hotword_chunks.len() > self.params.num_hotword_keep_chunks {
            self.hotword_chunks.pop_front();
        }
    }

    /// Clears deques and accumulator; called at transitions into
    /// `DetectWakeword`/`WaitingCmd` per the documented lifecycle.
    fn clear_utterance_state(&mut self) {
        self.stt_chunks.clear();
        self.hotword_chunks.clear();
        self.stt_audio_bytes.clear();
        self.wake_fired_this_utterance = false;
    }

    /// Resets all timing counters; called at entry of any sub-state.
    fn reset_counters(&mut self) {
        self.counters = Counters::default();
    }

    pub fn reset_state(&mut self) {
        self.state = State::DetectWakeword;
        self.clear_utterance_state();
        self.reset_counters();
        self.hotwords.reset();
        self.vad.reset();
    }

    /// Re-arms the loop after an external `stop()`, e.g. when a supervisor
    /// resumes it post-reload.
    pub fn resume(&mut self) {
        self.running = true;
    }

    /// Reads and processes exactly one chunk. `Ok(())` covers both a
    /// successfully processed chunk and a transient `None` read (source
    /// starvation the caller should just retry on the next tick).
    pub fn tick(&mut self, sink: &mut dyn EventSink) -> Result<(), VoiceLoopError> {
        let chunk = match self.audio_source.read_chunk() {
            Ok(Some(c)) => c,
            Ok(None) => return Ok(()),
            Err(err) => return Err(VoiceLoopError::Audio(err)),
        };
        if !self.running {
            return Ok(());
        }
        self.step(chunk, sink)
    }

    /// Runs the loop until `stop()` is called or a fatal error occurs.
    pub fn run(&mut self, sink: &mut dyn EventSink) -> Result<(), VoiceLoopError> {
        while self.running {
            if let Err(err) = self.tick(sink) {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(error = %err, "voice loop step error");
            }
        }
        Ok(())
    }

    /// Processes exactly one chunk. Public so tests can drive the loop
    /// deterministically without a real audio source.
    pub fn step(&mut self, raw_chunk: Chunk, sink: &mut dyn EventSink) -> Result<(), VoiceLoopError> {
        let chunk = if self.is_muted {
            Chunk::silence(raw_chunk.len(), raw_chunk.sample_rate(), raw_chunk.sample_width(), raw_chunk.sample_channels())
        } else {
            raw_chunk
        };
        self.elapsed_seconds += chunk.seconds_per_chunk();

        match self.state.clone() {
            State::DetectWakeword => self.on_detect_wakeword(chunk, sink)?,
            State::WaitingCmd => self.on_waiting_cmd(chunk, sink)?,
            State::Sleeping => self.on_sleeping(chunk),
            State::CheckWakeUp => self.on_check_wake_up(chunk, sink),
            State::Confirmation => self.on_confirmation(chunk),
            State::BeforeCommand => self.on_before_command(chunk),
            State::InCommand => self.on_in_command(chunk),
            State::AfterCommand => self.on_after_command(chunk, sink),
            State::Recording { ref recording_name } => {
                let name = recording_name.clone();
                self.on_recording(chunk, name, sink);
            }
        }

        let energy = chunk.debiased_energy();
        sink.handle(Event::Chunk { energy });
        Ok(())
    }

    fn on_detect_wakeword(&mut self, chunk: Chunk, sink: &mut dyn EventSink) -> Result<(), VoiceLoopError> {
        if self.mode == Mode::Continuous {
            self.state = State::WaitingCmd;
            self.clear_utterance_state();
            self.reset_counters();
            self.counters.speech_seconds_left = self.params.speech_seconds;
            return Ok(());
        }
        let detected = self.detect_ww(&chunk, sink)?;
        if !detected {
            let hot = self.detect_hot(&chunk, sink)?;
            if !hot {
                self.transformers.feed_audio(&chunk);
            }
        }
        Ok(())
    }

    fn on_waiting_cmd(&mut self, chunk: Chunk, sink: &mut dyn EventSink) -> Result<(), VoiceLoopError> {
        self.detect_hot(&chunk, sink)?;
        let is_silence = self.vad.is_silence(chunk.bytes()).unwrap_or(true);
        if self.mode == Mode::Continuous {
            self.push_rewind(chunk.clone());
            self.stt_audio_bytes.extend_from_slice(chunk.bytes());
        }
        if !is_silence {
            self.counters.speech_seconds_left -= chunk.seconds_per_chunk();
        } else {
            self.counters.speech_seconds_left = self.params.speech_seconds;
        }
        if self.counters.speech_seconds_left <= 0.0 {
            match self.mode {
                Mode::Continuous => {
                    self.primary_stt.stream_start(&self.params.accepted_languages[0])?;
                    if let Some(fb) = &mut self.fallback_stt {
                        fb.stream_start(&self.params.accepted_languages[0])?;
                    }
                    // Chunks accumulated in `stt_chunks` so far are left
                    // untouched here; `on_in_command`'s `drain_stt()` feeds
                    // them to STT exactly once on the next tick.
                    self.state = State::InCommand;
                    self.reset_counters();
                    self.counters.silence_seconds_left = self.params.silence_seconds;
                }
                _ => {
                    self.state = State::BeforeCommand;
                    self.reset_counters();
                }
            }
        }
        Ok(())
    }

    fn on_sleeping(&mut self, chunk: Chunk) {
        self.hotwords.state = HotwordSetState::Listen;
        self.hotwords.update(&chunk);
        if let Ok(Some(_name)) = self.hotwords.found() {
            self.state = State::CheckWakeUp;
        }
    }

    fn on_check_wake_up(&mut self, chunk: Chunk, sink: &mut dyn EventSink) {
        self.hotwords.state = HotwordSetState::Wakeup;
        self.hotwords.update(&chunk);
        match self.hotwords.found() {
            Ok(Some(name)) => {
                sink.handle(Event::Wakeup);
                self.mode = self.pre_sleep_mode.take().unwrap_or(Mode::Wakeword);
                self.state = State::DetectWakeword;
                self.last_ww = self.elapsed_seconds;
                let _ = name;
            }
            _ => {
                if self.elapsed_seconds - self.last_ww > self.params.sleeping_wake_timeout_seconds {
                    self.state = State::Sleeping;
                }
            }
        }
    }

    /// Wakes immediately without requiring a wake-up-word detection, used
    /// by the supervisor's `wake_up` bus handler.
    pub fn wake_up(&mut self, sink: &mut dyn EventSink) {
        sink.handle(Event::Wakeup);
        self.mode = self.pre_sleep_mode.take().unwrap_or(Mode::Wakeword);
        self.state = State::DetectWakeword;
        self.last_ww = self.elapsed_seconds;
    }

    fn on_confirmation(&mut self, chunk: Chunk) {
        if self.params.instant_listen {
            self.state = State::BeforeCommand;
            self.reset_counters();
            self.on_before_command(chunk);
            return;
        }
        self.transformers.feed_speech(&chunk);
        self.counters.confirmation_seconds_left -= chunk.seconds_per_chunk();
        if self.counters.confirmation_seconds_left <= 0.0 {
            self.state = State::BeforeCommand;
            self.reset_counters();
        }
    }

    /// External "sound played" acknowledgement: an alternative exit from
    /// `CONFIRMATION` to `BeforeCommand`, independent of the timer.
    pub fn acknowledge_sound_played(&mut self) {
        if self.state == State::Confirmation {
            self.state = State::BeforeCommand;
            self.reset_counters();
        }
    }

    fn on_before_command(&mut self, chunk: Chunk) {
        self.push_rewind(chunk.clone());
        self.stt_audio_bytes.extend_from_slice(chunk.bytes());
        self.drain_stt();

        self.counters.timeout_seconds_left -= chunk.seconds_per_chunk();
        self.counters.timeout_seconds_with_silence_left -= chunk.seconds_per_chunk();
        if self.counters.timeout_seconds_left <= 0.0 || self.counters.timeout_seconds_with_silence_left <= 0.0 {
            self.state = State::AfterCommand;
            return;
        }

        let is_silence = self.vad.is_silence(chunk.bytes()).unwrap_or(true);
        if !is_silence {
            self.counters.speech_seconds_left -= chunk.seconds_per_chunk();
            if self.counters.speech_seconds_left <= 0.0 {
                self.state = State::InCommand;
                self.counters.silence_seconds_left = self.params.silence_seconds;
            }
        } else {
            self.counters.speech_seconds_left = self.params.speech_seconds;
        }
    }

    fn on_in_command(&mut self, chunk: Chunk) {
        self.push_rewind(chunk.clone());
        self.stt_audio_bytes.extend_from_slice(chunk.bytes());
        self.drain_stt();

        self.counters.timeout_seconds_left -= chunk.seconds_per_chunk();
        if self.counters.timeout_seconds_left <= 0.0 {
            self.state = State::AfterCommand;
            return;
        }

        let is_silence = self.vad.is_silence(chunk.bytes()).unwrap_or(true);
        if is_silence {
            self.counters.silence_seconds_left -= chunk.seconds_per_chunk();
            if self.counters.silence_seconds_left <= 0.0 {
                self.state = State::AfterCommand;
            }
        } else {
            self.counters.silence_seconds_left = self.params.silence_seconds;
        }
    }

    /// Drains the rewind deque into STT, guaranteeing every byte appended
    /// to `stt_audio_bytes` is also presented to STT exactly once.
    fn drain_stt(&mut self) {
        while let Some(rewound) = self.stt_chunks.pop_front() {
            let _ = self.primary_stt.stream_data(rewound.bytes());
            if let Some(fb) = &mut self.fallback_stt {
                let _ = fb.stream_data(rewound.bytes());
            }
        }
    }

    fn on_after_command(&mut self, chunk: Chunk, sink: &mut dyn EventSink) {
        let (mut audio, mut meta) = self.transformers.transform(self.stt_audio_bytes.clone());

        if self.params.remove_silence {
            let bytes_per_second = chunk.sample_rate() as usize * chunk.sample_width() as usize * chunk.sample_channels() as usize;
            audio = crate::vad::trim_silence(self.vad.as_mut(), &audio, bytes_per_second);
        }

        let default_lang = self.params.accepted_languages[0].clone();
        let resolved_lang = match meta.get("stt_lang") {
            Some(Value::String(lang_hint)) => {
                let accepted: Vec<&str> = self.params.accepted_languages.iter().map(String::as_str).collect();
                if validate_lang(lang_hint, &accepted) {
                    lang_hint.clone()
                } else {
                    default_lang
                }
            }
            _ => default_lang,
        };
        meta.insert("lang".to_string(), Value::String(resolved_lang));

        let mut transcripts = transcribe_with_fallback(self.primary_stt.as_mut(), self.fallback_stt.as_deref_mut());

        transcripts = filter_hallucinations(transcripts, &self.params.hallucination_list, self.params.filter_hallucinations);
        transcripts = filter_low_confidence(transcripts, self.params.min_stt_confidence);
        transcripts.truncate(self.params.max_transcripts.max(1));

        let meta_value = Value::Object(meta.into_iter().collect());
        sink.handle(Event::SttAudio {
            audio: audio.clone(),
            meta: meta_value.clone(),
        });
        sink.handle(Event::RecordEnd);
        if transcripts.is_empty() && self.mode != Mode::Continuous {
            sink.handle(Event::SpeechRecognitionUnknown);
        }
        sink.handle(Event::Text {
            transcripts,
            meta: meta_value,
        });

        self.clear_utterance_state();
        self.vad.reset();
        self.hotwords.reset();

        self.state = match self.mode {
            Mode::Continuous | Mode::Hybrid => State::WaitingCmd,
            _ => State::DetectWakeword,
        };
        self.reset_counters();
    }

    fn on_recording(&mut self, chunk: Chunk, recording_name: Option<String>, sink: &mut dyn EventSink) {
        self.hotwords.state = HotwordSetState::Recording;
        self.hotwords.update(&chunk);
        if let Ok(Some(name)) = self.hotwords.found() {
            sink.handle(Event::Stopword { name });
            sink.handle(Event::RecordingAudio {
                audio: self.stt_audio_bytes.clone(),
                recording_name: recording_name.unwrap_or_default(),
            });
            sink.handle(Event::RecordEnd);
            self.clear_utterance_state();
            self.state = State::DetectWakeword;
            return;
        }
        self.stt_audio_bytes.extend_from_slice(chunk.bytes());
        let is_silence = self.vad.is_silence(chunk.bytes()).unwrap_or(true);
        if is_silence {
            self.counters.recording_seconds_with_silence_left -= chunk.seconds_per_chunk();
            if self.counters.recording_seconds_with_silence_left <= 0.0 {
                sink.handle(Event::RecordingAudio {
                    audio: self.stt_audio_bytes.clone(),
                    recording_name: recording_name.unwrap_or_default(),
                });
                sink.handle(Event::RecordEnd);
                self.clear_utterance_state();
                self.state = State::DetectWakeword;
            }
        } else {
            self.counters.recording_seconds_with_silence_left = self.params.recording_mode_max_silence_seconds;
        }
    }

    /// Wake-word detection. HotwordSet.state=Listen;
    /// appends the chunk to both the hotword-save deque and the rewind
    /// deque; on detection (or a pending `skip_next_wake`) drains the
    /// hotword-save deque into `listenword_audio_callback`, fires
    /// `wake_callback` at most once, and transitions to `Confirmation`
    /// or `BeforeCommand` depending on whether the record carries a
    /// confirmation sound.
    fn detect_ww(&mut self, chunk: &Chunk, sink: &mut dyn EventSink) -> Result<bool, VoiceLoopError> {
        self.hotwords.state = HotwordSetState::Listen;
        self.push_hotword_keep(chunk.clone());
        self.push_rewind(chunk.clone());
        self.hotwords.update(chunk);

        let found = match self.hotwords.found() {
            Ok(found) => found,
            Err(err @ HotwordError::EmptySubset(_)) => {
                sink.handle(Event::ReloadEligible(err));
                return Ok(false);
            }
            Err(err) => return Err(VoiceLoopError::Hotword(err)),
        };

        if found.is_none() && !self.skip_next_wake {
            return Ok(false);
        }

        let drained: Vec<u8> = self.hotword_chunks.drain(..).flat_map(|c| c.bytes().to_vec()).collect();
        let name = found.unwrap_or_else(|| "external".to_string());
        sink.handle(Event::ListenwordAudio {
            audio: drained,
            name: name.clone(),
        });
        self.hotword_chunks.clear();
        self.skip_next_wake = false;

        if !self.wake_fired_this_utterance {
            sink.handle(Event::WakeCallback { name: name.clone() });
            self.wake_fired_this_utterance = true;
        }

        self.reset_counters();
        self.stt_audio_bytes.clear();
        let lang = self
            .hotwords
            .config_of(&name)
            .and_then(|c| c.stt_lang.clone())
            .unwrap_or_else(|| self.params.accepted_languages[0].clone());
        self.primary_stt.stream_start(&lang)?;
        if let Some(fb) = &mut self.fallback_stt {
            fb.stream_start(&lang)?;
        }
        self.last_ww = self.elapsed_seconds;
        self.transformers.feed_hotword(chunk);

        let has_sound = self.hotwords.config_of(&name).and_then(|c| c.sound.clone()).is_some();
        if has_sound {
            self.state = State::Confirmation;
            self.counters.confirmation_seconds_left = self.params.confirmation_seconds;
        } else {
            self.state = State::BeforeCommand;
        }
        Ok(true)
    }

    fn detect_hot(&mut self, chunk: &Chunk, sink: &mut dyn EventSink) -> Result<bool, VoiceLoopError> {
        self.hotwords.state = HotwordSetState::Hotword;
        self.hotwords.update(chunk);
        match self.hotwords.found() {
            Ok(Some(name)) => {
                if self.hotwords.role_of(&name) == Some(Role::Hot) {
                    let config = self.hotwords.config_of(&name);
                    let bus_event = config.and_then(|c| c.bus_event.clone());
                    let utterance = config.and_then(|c| c.utterance.clone());
                    sink.handle(Event::Hotword { name, bus_event, utterance });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Ok(None) => Ok(false),
            Err(err) => {
                warn!(error = %err, "hot-word detection failed");
                Ok(false)
            }
        }
    }

    /// Forces a synthetic wake, skipping the keyword spotter. Used by the
    /// external "listen now" bus command.
    pub fn force_listen(&mut self, play_confirmation_sound: bool) {
        self.reset_counters();
        self.stt_audio_bytes.clear();
        if play_confirmation_sound {
            self.state = State::Confirmation;
            self.counters.confirmation_seconds_left = self.params.confirmation_seconds;
        } else {
            self.state = State::BeforeCommand;
        }
    }

    pub fn go_to_sleep(&mut self) {
        if self.mode != Mode::Sleeping {
            self.pre_sleep_mode = Some(self.mode);
        }
        self.mode = Mode::Sleeping;
        self.state = State::Sleeping;
    }

    pub fn begin_recording(&mut self, recording_name: Option<String>) {
        self.clear_utterance_state();
        self.reset_counters();
        self.counters.recording_seconds_with_silence_left = self.params.recording_mode_max_silence_seconds;
        self.state = State::Recording { recording_name };
    }
}

/// Drops transcripts whose text matches the (case-insensitive, quote-
/// stripped) hallucination list.
fn filter_hallucinations(transcripts: Vec<Transcript>, list: &[String], enabled: bool) -> Vec<Transcript> {
    if !enabled {
        return transcripts;
    }
    let normalized: Vec<String> = list.iter().map(|s| s.trim_matches('"').to_ascii_lowercase()).collect();
    transcripts
        .into_iter()
        .filter(|t| !normalized.contains(&t.text.trim_matches('"').to_ascii_lowercase()))
        .collect()
}

/// Drops transcripts below `min_confidence`; if that empties the list,
/// keeps the single max-confidence transcript instead.
fn filter_low_confidence(transcripts: Vec<Transcript>, min_confidence: f32) -> Vec<Transcript> {
    if transcripts.is_empty() {
        return transcripts;
    }
    let filtered: Vec<Transcript> = transcripts.iter().cloned().filter(|t| t.confidence >= min_confidence).collect();
    if filtered.is_empty() {
        let best = transcripts.into_iter().max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal));
        best.into_iter().collect()
    } else {
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_source::AudioSource;
    use crate::error::AudioSourceError;
    use crate::hotwords::{HotwordEngine, HotwordRecordConfig};
    use crate::vad::VoiceActivityDetector as VadTrait;

    struct NullSource;
    impl AudioSource for NullSource {
        fn start(&mut self) -> Result<(), AudioSourceError> {
            Ok(())
        }
        fn stop(&mut self) -> Result<(), AudioSourceError> {
            Ok(())
        }
        fn read_chunk(&mut self) -> Result<Option<Chunk>, AudioSourceError> {
            Ok(None)
        }
        fn sample_rate(&self) -> u32 {
            16_000
        }
        fn sample_width(&self) -> u8 {
            2
        }
        fn sample_channels(&self) -> u8 {
            1
        }
        fn chunk_size(&self) -> usize {
            3200
        }
    }

    struct ScriptedVad(Vec<bool>, usize);
    impl VadTrait for ScriptedVad {
        fn is_silence(&mut self, _chunk: &[u8]) -> Result<bool, crate::error::VadError> {
            let value = *self.0.get(self.1).unwrap_or(&true);
            self.1 += 1;
            Ok(value)
        }
    }

    struct DetectOnceEngine(bool);
    impl HotwordEngine for DetectOnceEngine {
        fn found_wake_word(&mut self, _audio_data: &[u8]) -> bool {
            let was = self.0;
            self.0 = false;
            was
        }
    }

    struct NeverEngine;
    impl HotwordEngine for NeverEngine {
        fn found_wake_word(&mut self, _audio_data: &[u8]) -> bool {
            false
        }
    }

    struct FixedStt(Vec<Transcript>);
    impl StreamingStt for FixedStt {
        fn stream_start(&mut self, _lang: &str) -> Result<(), crate::error::SttError> {
            Ok(())
        }
        fn stream_data(&mut self, _chunk: &[u8]) -> Result<(), crate::error::SttError> {
            Ok(())
        }
        fn transcribe(&mut self) -> Result<Vec<Transcript>, crate::error::SttError> {
            Ok(self.0.clone())
        }
    }

    /// Counts `stream_data` calls so tests can catch double-feeding the
    /// same audio into STT.
    struct CountingStt {
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
        transcripts: Vec<Transcript>,
    }
    impl StreamingStt for CountingStt {
        fn stream_start(&mut self, _lang: &str) -> Result<(), crate::error::SttError> {
            Ok(())
        }
        fn stream_data(&mut self, _chunk: &[u8]) -> Result<(), crate::error::SttError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        fn transcribe(&mut self) -> Result<Vec<Transcript>, crate::error::SttError> {
            Ok(self.transcripts.clone())
        }
    }

    fn silent_chunk() -> Chunk {
        Chunk::silence(3200, 16_000, 2, 1)
    }

    fn make_loop(mode: Mode, vad_script: Vec<bool>) -> VoiceLoop {
        make_loop_with_stt(mode, vad_script, Box::new(FixedStt(vec![Transcript::new("hello world", 0.9)])))
    }

    fn make_loop_with_stt(mode: Mode, vad_script: Vec<bool>, stt: Box<dyn StreamingStt>) -> VoiceLoop {
        let mut hotwords = HotwordSet::new(3.0, 16_000, 2);
        hotwords.register(
            "hey_computer",
            Box::new(DetectOnceEngine(true)),
            HotwordRecordConfig {
                listen: true,
                ..Default::default()
            },
            "hey_computer",
            "wake_up",
            false,
            None,
        );
        let transformers = AudioTransformerChain::new(vec![]);
        VoiceLoop::new(
            Box::new(NullSource),
            hotwords,
            Box::new(ScriptedVad(vad_script, 0)),
            transformers,
            stt,
            None,
            TimingParams::default(),
            mode,
        )
    }

    struct CollectingSink(Vec<String>);
    impl EventSink for CollectingSink {
        fn handle(&mut self, event: Event) {
            let label = match event {
                Event::ListenwordAudio { .. } => "listenword_audio",
                Event::WakeCallback { .. } => "wake_callback",
                Event::WakeupwordAudio { .. } => "wakeupword_audio",
                Event::Wakeup => "wakeup",
                Event::Hotword { .. } => "hotword",
                Event::Stopword { .. } => "stopword",
                Event::SttAudio { .. } => "stt_audio",
                Event::RecordEnd => "record_end",
                Event::Text { .. } => "text",
                Event::SpeechRecognitionUnknown => "speech.recognition.unknown",
                Event::RecordingAudio { .. } => "recording_audio",
                Event::Chunk { .. } => "chunk",
                Event::ReloadEligible(_) => "reload_eligible",
            };
            self.0.push(label.to_string());
        }
    }

    #[test]
    fn wake_word_then_speech_then_silence_reaches_after_command() {
        let mut vl = make_loop(Mode::Wakeword, vec![false; 60]);
        let mut sink = CollectingSink(Vec::new());

        // first chunk triggers wake word
        vl.step(silent_chunk(), &mut sink).unwrap();
        assert_eq!(vl.state, State::BeforeCommand);
        assert!(sink.0.contains(&"wake_callback".to_string()));

        // feed speech chunks until IN_COMMAND
        for _ in 0..5 {
            vl.step(silent_chunk(), &mut sink).unwrap();
        }
        assert_eq!(vl.state, State::InCommand);

        // feed silence until AFTER_COMMAND fires and loop resets
        for _ in 0..20 {
            vl.step(silent_chunk(), &mut sink).unwrap();
            if vl.state == State::DetectWakeword {
                break;
            }
        }
        assert_eq!(vl.state, State::DetectWakeword);
        assert!(sink.0.contains(&"record_end".to_string()));
        assert!(sink.0.contains(&"text".to_string()));
    }

    #[test]
    fn sleeping_mode_never_fires_text_callback() {
        let mut vl = make_loop(Mode::Wakeword, vec![false; 200]);
        vl.go_to_sleep();
        let mut sink = CollectingSink(Vec::new());
        for _ in 0..50 {
            vl.step(silent_chunk(), &mut sink).unwrap();
        }
        assert!(!sink.0.contains(&"text".to_string()));
    }

    #[test]
    fn waking_up_restores_pre_sleep_mode() {
        let mut vl = make_loop(Mode::Hybrid, vec![false; 10]);
        vl.go_to_sleep();
        assert_eq!(vl.mode, Mode::Sleeping);
        let mut sink = CollectingSink(Vec::new());
        vl.wake_up(&mut sink);
        assert_eq!(vl.mode, Mode::Hybrid);
        assert_eq!(vl.state, State::DetectWakeword);
    }

    #[test]
    fn rewind_deque_never_exceeds_capacity() {
        let mut vl = make_loop(Mode::Wakeword, vec![false; 200]);
        let cap = vl.rewind_capacity();
        for _ in 0..(cap * 3) {
            vl.push_rewind(silent_chunk());
            assert!(vl.stt_chunks.len() <= cap);
        }
    }

    #[test]
    fn idempotent_reset_state() {
        let mut vl = make_loop(Mode::Wakeword, vec![false; 10]);
        let mut sink = CollectingSink(Vec::new());
        vl.step(silent_chunk(), &mut sink).unwrap();
        vl.reset_state();
        let state_after_one = vl.state.clone();
        vl.reset_state();
        assert_eq!(vl.state, state_after_one);
    }

    #[test]
    fn hallucination_filter_empties_transcripts() {
        let transcripts = vec![Transcript::new("Thanks for watching!", 0.95)];
        let filtered = filter_hallucinations(
            transcripts,
            &TimingParams::default().hallucination_list,
            true,
        );
        assert!(filtered.is_empty());
    }

    #[test]
    fn low_confidence_keeps_single_best_transcript() {
        let transcripts = vec![Transcript::new("a", 0.1), Transcript::new("b", 0.3)];
        let filtered = filter_low_confidence(transcripts, 0.6);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].text, "b");
    }

    #[test]
    fn continuous_mode_has_triple_rewind_capacity() {
        let vl = make_loop(Mode::Continuous, vec![]);
        assert_eq!(vl.rewind_capacity(), (vl.params.num_stt_rewind_chunks + 1) * 3);
    }

    #[test]
    fn external_state_set_recording_clears_prior_utterance() {
        let mut vl = make_loop(Mode::Wakeword, vec![false; 10]);
        let mut sink = CollectingSink(Vec::new());
        vl.step(silent_chunk(), &mut sink).unwrap();
        vl.force_state(State::Recording {
            recording_name: Some("memo1".to_string()),
        });
        assert!(matches!(vl.state, State::Recording { .. }));
    }

    #[test]
    fn continuous_mode_streams_rewound_chunks_exactly_once() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let stt = CountingStt {
            calls: calls.clone(),
            transcripts: vec![Transcript::new("hello world", 0.9)],
        };
        let mut vl = make_loop_with_stt(Mode::Continuous, vec![false; 60], Box::new(stt));
        vl.force_state(State::WaitingCmd);
        let mut sink = CollectingSink(Vec::new());

        let mut chunks_fed = 0usize;
        while vl.state == State::WaitingCmd {
            vl.step(silent_chunk(), &mut sink).unwrap();
            chunks_fed += 1;
        }
        assert_eq!(vl.state, State::InCommand);

        // one more tick lets `on_in_command`'s `drain_stt()` run.
        vl.step(silent_chunk(), &mut sink).unwrap();
        chunks_fed += 1;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), chunks_fed);
    }

    #[test]
    fn after_command_utterance_meta_carries_lang() {
        let mut vl = make_loop(Mode::Wakeword, vec![false; 60]);
        let mut captured_meta = None;
        let mut sink = |event: Event| {
            if let Event::Text { meta, .. } = event {
                captured_meta = Some(meta);
            }
        };

        vl.step(silent_chunk(), &mut sink).unwrap();
        for _ in 0..5 {
            vl.step(silent_chunk(), &mut sink).unwrap();
        }
        for _ in 0..20 {
            vl.step(silent_chunk(), &mut sink).unwrap();
            if vl.state == State::DetectWakeword {
                break;
            }
        }

        let meta = captured_meta.expect("Event::Text should have fired");
        assert_eq!(meta.get("lang").and_then(Value::as_str), Some("en-us"));
    }

    #[test]
    fn stop_recording_flushes_and_returns_to_detect_wakeword() {
        let mut vl = make_loop(Mode::Wakeword, vec![false; 10]);
        vl.force_state(State::Recording {
            recording_name: Some("memo1".to_string()),
        });
        let mut sink = CollectingSink(Vec::new());
        vl.step(silent_chunk(), &mut sink).unwrap();
        vl.stop_recording(&mut sink);
        assert_eq!(vl.state, State::DetectWakeword);
        assert!(sink.0.contains(&"recording_audio".to_string()));
    }
}
