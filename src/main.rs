use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Result, eyre};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hearth_listener::audio_source::AudioSource;
use hearth_listener::bus::{Bus, FakeBus};
use hearth_listener::config::AppConfig;
use hearth_listener::hotwords::{self, HotwordSet};
use hearth_listener::service::{ComponentFactories, Service};
use hearth_listener::stt::StreamingStt;
use hearth_listener::transformers::AudioTransformerChain;
use hearth_listener::upload::{DatasetUploader, ReqwestUploader};
use hearth_listener::vad::VoiceActivityDetector;
use hearth_listener::voice_loop::{Mode, TimingParams, VoiceLoop};

#[cfg(not(feature = "cpal-source"))]
compile_error!("the hearth-listener binary needs a concrete AudioSource; build with --features cpal-source (or wire a custom one through hearth_listener::service::Service directly)");

#[cfg(not(feature = "whisper-stt"))]
compile_error!("the hearth-listener binary needs a concrete StreamingStt; build with --features whisper-stt (or wire a custom one through hearth_listener::service::Service directly)");

/// Voice-interaction front-end: wake-word, hot-word, and utterance
/// detection over a local message bus.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults to
    /// `$XDG_CONFIG_HOME/hearth-listener/config.toml`.
    #[arg(short, long, env = "HEARTH_LISTENER_CONFIG")]
    config: Option<PathBuf>,

    /// `tracing_subscriber::EnvFilter` directive, e.g. `debug` or
    /// `hearth_listener=debug,warn`.
    #[arg(long, env = "HEARTH_LISTENER_LOG", default_value = "info")]
    log_level: String,

    /// Input device name; omit for the host's default input device.
    #[arg(long, env = "HEARTH_LISTENER_DEVICE")]
    device: Option<String>,

    /// Path to a whisper.cpp GGML/GGUF model file.
    #[arg(long, env = "HEARTH_LISTENER_WHISPER_MODEL")]
    whisper_model: PathBuf,

    /// Disable filesystem watching of the configuration file for hot-reload.
    #[arg(long)]
    no_watch: bool,
}

fn init_tracing(directive: &str) {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn default_config_path() -> PathBuf {
    dirs::config_dir().unwrap_or_else(std::env::temp_dir).join("hearth-listener").join("config.toml")
}

fn initial_mode(config: &AppConfig) -> Mode {
    if config.listener.continuous_listen {
        Mode::Continuous
    } else if config.listener.hybrid_listen {
        Mode::Hybrid
    } else {
        Mode::Wakeword
    }
}

fn build_factories(cli: &Cli) -> ComponentFactories {
    let device = cli.device.clone();
    let whisper_model = cli.whisper_model.clone();

    ComponentFactories {
        primary_stt: Box::new(move |_config: &AppConfig| -> Box<dyn StreamingStt> {
            Box::new(
                hearth_listener::adapters::whisper_stt::WhisperStt::new(whisper_model.to_string_lossy().as_ref())
                    .expect("failed to load whisper model"),
            )
        }),
        fallback_stt: Box::new(|_config: &AppConfig| -> Option<Box<dyn StreamingStt>> { None }),
        hotwords: Box::new(|config: &AppConfig| -> HotwordSet {
            // No wake-word engine ships with the core itself; the
            // keyword-spotting model is an external collaborator a caller
            // wires in here. Returning `None` for every entry still builds
            // a valid (if silent) HotwordSet.
            hotwords::load_from_config(config, &|_name, _entry| None)
        }),
        vad: Box::new(|config: &AppConfig| -> Box<dyn VoiceActivityDetector> { build_vad(config) }),
        audio_source: Box::new(move |config: &AppConfig| -> Box<dyn AudioSource> {
            Box::new(
                hearth_listener::adapters::cpal_source::CpalAudioSource::new(
                    device.as_deref(),
                    config.listener.sample_rate,
                    config.listener.sample_channels,
                    config.listener.chunk_size,
                    Duration::from_secs_f32(config.listener.audio_timeout),
                )
                .expect("failed to open audio input device"),
            )
        }),
    }
}

#[cfg(feature = "webrtc-vad")]
fn build_vad(config: &AppConfig) -> Box<dyn VoiceActivityDetector> {
    match hearth_listener::adapters::webrtc_vad::NeuralVad::new(config.listener.sample_rate, config.listener.chunk_size, 0.5) {
        Ok(vad) => Box::new(vad),
        Err(err) => {
            warn!(error = %err, "falling back to energy-threshold VAD");
            Box::new(hearth_listener::vad::EnergyVad::new(400.0, config.listener.sample_width))
        }
    }
}

#[cfg(not(feature = "webrtc-vad"))]
fn build_vad(config: &AppConfig) -> Box<dyn VoiceActivityDetector> {
    Box::new(hearth_listener::vad::EnergyVad::new(400.0, config.listener.sample_width))
}

/// Watches the configuration file and reloads `service` whenever it
/// changes.
fn spawn_config_watcher(config_path: PathBuf, service: Arc<Service>) -> Result<()> {
    use notify::{RecursiveMode, Watcher};

    let Some(watch_dir) = config_path.parent().map(|p| p.to_path_buf()) else {
        return Ok(());
    };
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

    std::thread::spawn(move || {
        let _watcher = watcher;
        for event in rx {
            match event {
                Ok(event) if event.paths.iter().any(|p| p == &config_path) => match AppConfig::load(&config_path) {
                    Ok(new_config) => match service.reload(new_config) {
                        Ok(()) => info!("configuration reloaded from disk"),
                        Err(err) => warn!(error = %err, "configuration reload failed"),
                    },
                    Err(err) => warn!(error = %err, "failed to parse updated configuration"),
                },
                Ok(_) => {}
                Err(err) => warn!(error = %err, "configuration watcher error"),
            }
        }
    });
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = if config_path.exists() {
        AppConfig::load(&config_path).map_err(|err| eyre!(err))?
    } else {
        warn!(path = ?config_path, "no configuration file found, starting from defaults");
        AppConfig::default()
    };

    let bus: Arc<dyn Bus> = Arc::new(FakeBus::new());
    let factories = build_factories(&cli);

    let hotword_set = (factories.hotwords)(&config);
    let vad = (factories.vad)(&config);
    let audio_source = (factories.audio_source)(&config);
    let primary_stt = (factories.primary_stt)(&config);
    let fallback_stt = (factories.fallback_stt)(&config);
    let transformers = AudioTransformerChain::new(vec![]);
    let mode = initial_mode(&config);
    let timing = TimingParams::from_config(&config);

    let voice_loop = VoiceLoop::new(audio_source, hotword_set, vad, transformers, primary_stt, fallback_stt, timing, mode);

    let uploader: Option<Arc<dyn DatasetUploader>> = Some(Arc::new(ReqwestUploader::default()));
    let service = Service::new(config, bus, voice_loop, factories, uploader);

    if !cli.no_watch {
        if let Err(err) = spawn_config_watcher(config_path, service.clone()) {
            warn!(error = %err, "failed to start configuration watcher");
        }
    }

    info!("hearth-listener starting");
    service.run().map_err(|err| eyre!(err.to_string()))
}
