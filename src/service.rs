//! The supervisor wiring `VoiceLoop` to a message bus: translates loop
//! callbacks into bus events, persists audio artifacts, and owns
//! configuration hot-reload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::audio_source::AudioSource;
use crate::bus::{Bus, Message};
use crate::config::AppConfig;
use crate::error::{PersistenceError, VoiceLoopError};
use crate::hotwords::HotwordSet;
use crate::persistence::{ArtifactWriter, TemplateFilenameFormatter, WakewordContext, md5_hex};
use crate::stt::StreamingStt;
use crate::upload::DatasetUploader;
use crate::vad::VoiceActivityDetector;
use crate::voice_loop::{Event, EventSink, Mode, State, TimingParams, VoiceLoop};

const FAKE_BARGE_IN_SKILL_ID: &str = "hearth_listener.fake_barge_in";

/// Builds the collaborators a reload needs to rebuild, one per config
/// slice. Concrete engines are external collaborators; callers supply
/// these closures at startup, typically backed by the `adapters` module
/// or a plugin registry of their own.
pub struct ComponentFactories {
    pub primary_stt: Box<dyn Fn(&AppConfig) -> Box<dyn StreamingStt> + Send + Sync>,
    pub fallback_stt: Box<dyn Fn(&AppConfig) -> Option<Box<dyn StreamingStt>> + Send + Sync>,
    pub hotwords: Box<dyn Fn(&AppConfig) -> HotwordSet + Send + Sync>,
    pub vad: Box<dyn Fn(&AppConfig) -> Box<dyn VoiceActivityDetector> + Send + Sync>,
    pub audio_source: Box<dyn Fn(&AppConfig) -> Box<dyn AudioSource> + Send + Sync>,
}

/// Filters `mic.listen` / forced-wake requests to those whose message
/// context names a native audio source.
fn context_targets_native_audio(context: &Value) -> bool {
    match context.get("destination") {
        None => true,
        Some(Value::String(s)) => s == "audio",
        Some(Value::Array(items)) => items.iter().any(|v| v.as_str() == Some("audio")),
        _ => false,
    }
}

fn try_lock_timeout<'a, T>(mutex: &'a Mutex<T>, timeout: Duration) -> Result<MutexGuard<'a, T>, VoiceLoopError> {
    let start = Instant::now();
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(_) if start.elapsed() < timeout => std::thread::sleep(Duration::from_millis(10)),
            Err(_) => return Err(VoiceLoopError::ReloadFailed("timed out waiting for reload lock".to_string())),
        }
    }
}

pub struct Service {
    bus: Arc<dyn Bus>,
    voice_loop: Arc<Mutex<VoiceLoop>>,
    config: Mutex<AppConfig>,
    config_hash: Mutex<crate::config::ConfigHash>,
    factories: ComponentFactories,
    reload_lock: Mutex<()>,
    artifacts: ArtifactWriter,
    uploader: Option<Arc<dyn DatasetUploader>>,
    last_user_volume: Mutex<Option<f32>>,
    running: AtomicBool,
}

impl Service {
    pub fn new(
        config: AppConfig,
        bus: Arc<dyn Bus>,
        voice_loop: VoiceLoop,
        factories: ComponentFactories,
        uploader: Option<Arc<dyn DatasetUploader>>,
    ) -> Arc<Self> {
        let spec = crate::persistence::WavSpec {
            sample_rate: config.listener.sample_rate,
            sample_width: config.listener.sample_width,
            channels: config.listener.sample_channels,
        };
        let artifacts = ArtifactWriter::new(crate::persistence::resolve_save_path(config.listener.save_path.as_deref()), spec);
        let config_hash = config.config_hash();
        let service = Arc::new(Self {
            bus,
            voice_loop: Arc::new(Mutex::new(voice_loop)),
            config: Mutex::new(config),
            config_hash: Mutex::new(config_hash),
            factories,
            reload_lock: Mutex::new(()),
            artifacts,
            uploader,
            last_user_volume: Mutex::new(None),
            running: AtomicBool::new(true),
        });
        service.clone().subscribe();
        service
    }

    fn config_snapshot(&self) -> AppConfig {
        self.config.lock().expect("config mutex poisoned").clone()
    }

    /// Registers every handler for the bus events the supervisor consumes.
    fn subscribe(self: Arc<Self>) {
        let s = self.clone();
        self.bus.on("mic.mute", Box::new(move |_| s.set_muted(true)));
        let s = self.clone();
        self.bus.on("mic.unmute", Box::new(move |_| s.set_muted(false)));
        let s = self.clone();
        self.bus.on(
            "mic.mute.toggle",
            Box::new(move |_| {
                let muted = s.voice_loop.lock().expect("voice loop mutex poisoned").is_muted;
                s.set_muted(!muted);
            }),
        );
        let s = self.clone();
        self.bus.on("mic.listen", Box::new(move |msg| s.handle_mic_listen(msg)));
        let s = self.clone();
        self.bus.on("mic.get_status", Box::new(move |_| s.handle_mic_get_status()));
        let s = self.clone();
        self.bus.on("audio_output_start", Box::new(move |_| s.handle_audio_output_start()));
        let s = self.clone();
        self.bus.on("audio_output_end", Box::new(move |_| s.handle_audio_output_end()));
        let s = self.clone();
        self.bus.on("stop", Box::new(move |_| s.set_muted(false)));
        let s = self.clone();
        self.bus.on(
            "sleep",
            Box::new(move |_| s.voice_loop.lock().expect("voice loop mutex poisoned").go_to_sleep()),
        );
        let s = self.clone();
        self.bus.on("wake_up", Box::new(move |_| s.handle_wake_up()));
        let s = self.clone();
        self.bus.on("record_stop", Box::new(move |_| s.handle_record_stop()));
        let s = self.clone();
        self.bus.on("state.set", Box::new(move |msg| s.handle_state_set(msg)));
        let s = self.clone();
        self.bus.on("state.get", Box::new(move |_| s.handle_state_get()));
        let s = self.clone();
        self.bus.on(
            "skills.activated",
            Box::new(move |_| {
                let mut vl = s.voice_loop.lock().expect("voice loop mutex poisoned");
                if vl.mode() == Mode::Hybrid {
                    vl.extend_hybrid_window();
                }
            }),
        );
        let s = self.clone();
        self.bus.on("b64_transcribe", Box::new(move |msg| s.handle_b64_transcribe(msg)));
        let s = self.clone();
        self.bus.on("b64_audio", Box::new(move |msg| s.handle_b64_audio(msg)));
        let s = self.clone();
        self.bus.on("configuration.updated", Box::new(move |_| s.request_reload()));
        let s = self.clone();
        self.bus.on("mycroft.volume.set", Box::new(move |msg| s.handle_volume_change(msg)));
    }

    fn set_muted(&self, muted: bool) {
        self.voice_loop.lock().expect("voice loop mutex poisoned").is_muted = muted;
    }

    fn handle_mic_listen(&self, msg: &Message) {
        if !context_targets_native_audio(&msg.context) {
            return;
        }
        let config = self.config_snapshot();
        self.voice_loop.lock().expect("voice loop mutex poisoned").force_listen(config.confirm_listening);
    }

    fn handle_mic_get_status(&self) {
        let muted = self.voice_loop.lock().expect("voice loop mutex poisoned").is_muted;
        self.bus.emit(Message::new("mic.get_status.response", json!({ "muted": muted })));
    }

    /// Mutes (or, with `fake_barge_in` enabled, ducks instead of mutes)
    /// when audio output starts, per `handle_audio_output_start`.
    fn handle_audio_output_start(&self) {
        let config = self.config_snapshot();
        if config.listener.fake_barge_in {
            let duck_to = config.listener.barge_in_volume.unwrap_or(0.1);
            self.bus.emit(
                Message::new("mycroft.volume.set", json!({ "percent": duck_to }))
                    .with_context(json!({ "skill_id": FAKE_BARGE_IN_SKILL_ID })),
            );
        } else if config.listener.mute_during_output {
            self.set_muted(true);
        }
    }

    /// Restores the pre-output volume (or unmutes), per
    /// `handle_audio_output_end`. The restored volume is whatever the last
    /// non-self `mycroft.volume.set` observed, defaulting to full volume.
    fn handle_audio_output_end(&self) {
        let config = self.config_snapshot();
        if config.listener.fake_barge_in {
            let restore = self.last_user_volume.lock().expect("volume mutex poisoned").unwrap_or(1.0);
            self.bus.emit(
                Message::new("mycroft.volume.set", json!({ "percent": restore }))
                    .with_context(json!({ "skill_id": FAKE_BARGE_IN_SKILL_ID })),
            );
        } else if config.listener.mute_during_output {
            self.set_muted(false);
        }
    }

    fn handle_wake_up(&self) {
        let mut vl = self.voice_loop.lock().expect("voice loop mutex poisoned");
        let mut sink = EventTranslator { service: self };
        vl.wake_up(&mut sink);
    }

    fn handle_record_stop(&self) {
        let mut vl = self.voice_loop.lock().expect("voice loop mutex poisoned");
        let mut sink = EventTranslator { service: self };
        vl.stop_recording(&mut sink);
    }

    fn handle_state_set(&self, msg: &Message) {
        let mut vl = self.voice_loop.lock().expect("voice loop mutex poisoned");
        if let Some(mode) = msg.data.get("mode").and_then(Value::as_str).and_then(parse_mode) {
            vl.set_mode(mode);
        }
        if let Some(state_name) = msg.data.get("state").and_then(Value::as_str) {
            let recording_name = msg.data.get("recording_name").and_then(Value::as_str).map(String::from);
            if let Some(state) = parse_state(state_name, recording_name) {
                vl.force_state(state);
            }
        }
    }

    fn handle_state_get(&self) {
        let vl = self.voice_loop.lock().expect("voice loop mutex poisoned");
        self.bus.emit(Message::new(
            "state",
            json!({ "mode": mode_name(vl.mode()), "state": state_name(vl.state()) }),
        ));
    }

    /// Tracks the last volume some other component set, so
    /// `handle_audio_output_end` can restore it. Ignores the supervisor's
    /// own fake-barge-in announcements.
    fn handle_volume_change(&self, msg: &Message) {
        if msg.context.get("skill_id").and_then(Value::as_str) == Some(FAKE_BARGE_IN_SKILL_ID) {
            return;
        }
        if let Some(volume) = msg.data.get("percent").and_then(Value::as_f64) {
            *self.last_user_volume.lock().expect("volume mutex poisoned") = Some(volume as f32);
        }
    }

    fn handle_b64_transcribe(&self, msg: &Message) {
        let Some((transcripts, lang)) = self.transcribe_b64(msg) else { return };
        let payload: Vec<Value> = transcripts.into_iter().map(|t| json!({ "text": t.text, "confidence": t.confidence })).collect();
        self.bus.emit(Message::new("b64_transcribe.response", json!({ "transcriptions": payload, "lang": lang })));
    }

    fn handle_b64_audio(&self, msg: &Message) {
        let Some((transcripts, lang)) = self.transcribe_b64(msg) else { return };
        if let Some(best) = transcripts.into_iter().next() {
            self.bus.emit(Message::new("recognizer_loop:utterance", json!({ "utterances": [best.text], "lang": lang })));
        }
    }

    /// Decodes a base64 audio payload and runs it through a one-shot
    /// `stream_start -> stream_data -> transcribe -> stream_stop`, out of
    /// band from the loop's own utterance state. Payloads must already be
    /// PCM or WAV (arbitrary-format decoding is a non-goal). Returns the
    /// transcripts alongside the language actually used, so callers can
    /// echo it back on the response/utterance event.
    fn transcribe_b64(&self, msg: &Message) -> Option<(Vec<crate::stt::Transcript>, String)> {
        let b64 = msg.data.get("audio").and_then(Value::as_str)?;
        let bytes = decode_b64_audio(b64).ok()?;
        let config = self.config_snapshot();
        let mut stt = (self.factories.primary_stt)(&config);
        let lang = msg.data.get("lang").and_then(Value::as_str).unwrap_or(&config.lang).to_string();
        stt.stream_start(&lang).ok()?;
        stt.stream_data(&bytes).ok()?;
        let transcripts = stt.transcribe().ok()?;
        let _ = stt.stream_stop();
        Some((transcripts, lang))
    }

    fn request_reload(&self) {
        let new_config = self.config_snapshot();
        if let Err(err) = self.reload(new_config) {
            warn!(error = %err, "configuration reload failed");
        }
    }

    /// Reloads from `new_config`, rebuilding only the config slices whose
    /// hash changed. Stops the loop before swapping, resumes after.
    pub fn reload(&self, new_config: AppConfig) -> Result<(), VoiceLoopError> {
        let _guard = try_lock_timeout(&self.reload_lock, Duration::from_secs(30))?;

        let old_hash = *self.config_hash.lock().expect("config hash mutex poisoned");
        let new_hash = new_config.config_hash();
        let diff = old_hash.diff(&new_hash);
        if !diff.any() {
            *self.config.lock().expect("config mutex poisoned") = new_config;
            return Ok(());
        }

        let mut vl = self.voice_loop.lock().expect("voice loop mutex poisoned");
        vl.stop();

        if diff.stt {
            vl.replace_primary_stt((self.factories.primary_stt)(&new_config));
        }
        if diff.fallback {
            vl.replace_fallback_stt((self.factories.fallback_stt)(&new_config));
        }
        if diff.hotwords {
            vl.replace_hotwords((self.factories.hotwords)(&new_config));
        }
        if diff.loop_ {
            vl.replace_timing(TimingParams::from_config(&new_config));
            vl.replace_vad((self.factories.vad)(&new_config));
            vl.replace_audio_source((self.factories.audio_source)(&new_config));
        }
        vl.resume();
        drop(vl);

        *self.config.lock().expect("config mutex poisoned") = new_config;
        *self.config_hash.lock().expect("config hash mutex poisoned") = new_hash;
        info!(?diff, "voice loop configuration reloaded");
        Ok(())
    }

    /// Drives the loop one chunk at a time so bus handlers (running on
    /// other threads, synchronously from `Bus::emit`) can mutate
    /// externally-settable fields between chunks without racing a chunk
    /// already in flight.
    pub fn run(self: &Arc<Self>) -> Result<(), VoiceLoopError> {
        while self.running.load(Ordering::SeqCst) {
            let mut vl = self.voice_loop.lock().expect("voice loop mutex poisoned");
            if !vl.is_running() {
                drop(vl);
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            let mut sink = EventTranslator { service: self };
            let result = vl.tick(&mut sink);
            drop(vl);
            if let Err(err) = result {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(error = %err, "voice loop tick error");
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.voice_loop.lock().expect("voice loop mutex poisoned").stop();
    }

    fn persist_wake_word(&self, audio: Vec<u8>, name: &str, config: &AppConfig) {
        if !config.listener.record_wake_words {
            return;
        }
        let context = WakewordContext::new(name, name, "session", None);
        match self.artifacts.save_wake_word(&audio, &context) {
            Ok((wav_path, _)) => self.maybe_upload(&config.listener.wake_word_upload, audio, &wav_path),
            Err(err) => warn!(error = %err, "failed to save wake-word audio"),
        }
    }

    fn persist_utterance(&self, audio: Vec<u8>, meta: &Value, config: &AppConfig) {
        if !config.listener.save_utterances {
            return;
        }
        let first_text = meta
            .get("utterances")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let mut formatter = TemplateFilenameFormatter::new();
        formatter.register("md5", move || md5_hex(&first_text));
        match self.artifacts.save_utterance(&audio, meta, &formatter, &config.listener.utterance_filename) {
            Ok((wav_path, _)) => self.maybe_upload(&config.listener.stt_upload, audio, &wav_path),
            Err(err) => warn!(error = %err, "failed to save utterance audio"),
        }
    }

    fn persist_recording(&self, audio: Vec<u8>, recording_name: &str) {
        if let Err(err) = self.artifacts.save_recording(&audio, recording_name, &json!({ "recording_name": recording_name })) {
            warn!(error = %err, "failed to save free recording");
        }
    }

    fn maybe_upload(&self, upload_config: &crate::config::UploadConfig, audio: Vec<u8>, wav_path: &std::path::Path) {
        if upload_config.disable {
            return;
        }
        let (Some(uploader), Some(url)) = (&self.uploader, &upload_config.url) else {
            return;
        };
        match url::Url::parse(url) {
            Ok(url) => crate::upload::upload_in_background(uploader.clone(), url, audio, filename(wav_path)),
            Err(err) => warn!(error = %err, url, "invalid dataset upload URL"),
        }
    }
}

fn filename(path: &std::path::Path) -> String {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("audio.wav").to_string()
}

fn decode_b64_audio(data: &str) -> Result<Vec<u8>, PersistenceError> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|_| PersistenceError::UnknownTemplateKeys(vec!["invalid base64".to_string()]))?;
    match hound::WavReader::new(std::io::Cursor::new(&bytes)) {
        Ok(mut reader) => Ok(reader.samples::<i16>().filter_map(Result::ok).flat_map(|s| s.to_le_bytes()).collect()),
        Err(_) => Ok(bytes),
    }
}

fn parse_mode(name: &str) -> Option<Mode> {
    match name {
        "wakeword" => Some(Mode::Wakeword),
        "continuous" => Some(Mode::Continuous),
        "hybrid" => Some(Mode::Hybrid),
        "sleeping" => Some(Mode::Sleeping),
        _ => None,
    }
}

fn mode_name(mode: Mode) -> &'static str {
    match mode {
        Mode::Wakeword => "wakeword",
        Mode::Continuous => "continuous",
        Mode::Hybrid => "hybrid",
        Mode::Sleeping => "sleeping",
    }
}

fn parse_state(name: &str, recording_name: Option<String>) -> Option<State> {
    match name {
        "detect_wakeword" => Some(State::DetectWakeword),
        "waiting_cmd" => Some(State::WaitingCmd),
        "sleeping" => Some(State::Sleeping),
        "recording" => Some(State::Recording { recording_name }),
        _ => None,
    }
}

fn state_name(state: &State) -> &'static str {
    match state {
        State::DetectWakeword => "detect_wakeword",
        State::WaitingCmd => "waiting_cmd",
        State::Recording { .. } => "recording",
        State::Sleeping => "sleeping",
        State::CheckWakeUp => "check_wake_up",
        State::Confirmation => "confirmation",
        State::BeforeCommand => "before_command",
        State::InCommand => "in_command",
        State::AfterCommand => "after_command",
    }
}

/// Translates `VoiceLoop` events into bus messages and persisted
/// artifacts. Built fresh around a `&Service` for the duration of one
/// `tick()` or one externally-triggered control call.
struct EventTranslator<'a> {
    service: &'a Service,
}

impl EventSink for EventTranslator<'_> {
    fn handle(&mut self, event: Event) {
        let bus = &self.service.bus;
        match event {
            Event::ListenwordAudio { audio, name } => {
                bus.emit(Message::new("recognizer_loop:record_begin", Value::Null));
                let config = self.service.config_snapshot();
                self.service.persist_wake_word(audio, &name, &config);
            }
            Event::WakeCallback { name } => {
                bus.emit(Message::new("recognizer_loop:wakeword", json!({ "utterance": name.replace('_', " ") })));
            }
            Event::WakeupwordAudio { audio: _ } => {}
            Event::Wakeup => {
                bus.emit(Message::new("awoken", Value::Null));
            }
            Event::Hotword { name, bus_event, utterance } => match (bus_event, utterance) {
                (Some(event_name), _) => bus.emit(Message::new(event_name, json!({ "hotword": name }))),
                (None, Some(text)) => bus.emit(Message::new("recognizer_loop:utterance", json!({ "utterances": [text] }))),
                (None, None) => bus.emit(Message::new("recognizer_loop:hotword", json!({ "hotword": name }))),
            },
            Event::Stopword { name } => {
                bus.emit(Message::new("recognizer_loop:stopword", json!({ "hotword": name })));
            }
            Event::SttAudio { audio, meta } => {
                let config = self.service.config_snapshot();
                self.service.persist_utterance(audio, &meta, &config);
            }
            Event::RecordEnd => {
                bus.emit(Message::new("recognizer_loop:record_end", Value::Null));
            }
            Event::Text { transcripts, meta } => {
                if !transcripts.is_empty() {
                    let utterances: Vec<&str> = transcripts.iter().map(|t| t.text.as_str()).collect();
                    let mut data = meta;
                    if let Value::Object(map) = &mut data {
                        map.insert("utterances".to_string(), json!(utterances));
                    }
                    bus.emit(Message::new("recognizer_loop:utterance", data));
                }
            }
            Event::SpeechRecognitionUnknown => {
                bus.emit(Message::new("speech.recognition.unknown", Value::Null));
            }
            Event::RecordingAudio { audio, recording_name } => {
                self.service.persist_recording(audio, &recording_name);
            }
            Event::Chunk { energy: _ } => {}
            Event::ReloadEligible(err) => {
                warn!(error = %err, "hot-word condition, reload eligible");
            }
        }
    }
}
