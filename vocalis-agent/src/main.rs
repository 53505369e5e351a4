//! Vocalis daemon entry point: an always-on, headless voice-assistant
//! client. Loads the sectioned config file, wires the capture pipeline,
//! the dialog state machine and the conversation/STT protocol clients
//! together over a shared event bus, and runs until interrupted.

mod leds;
mod player;
mod volume;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{error, info, warn};
use vocalis_core::audio::AudioCapture;
use vocalis_core::buffering::create_audio_ring;
use vocalis_core::capture::echo::NullEchoCanceller;
use vocalis_core::capture::{CaptureConfig, CapturePipeline};
use vocalis_core::config::Config;
use vocalis_core::dialog::StateMachine;
use vocalis_core::protocol::conversation::ConversationClient;
use vocalis_core::vad::energy::EnergyVad;
use vocalis_core::wakeword::NullWakeWordDetector;
use vocalis_core::EventBus;

use leds::LoggingLedDriver;
use player::{default_sounds_dir, ProcessPlayer};
use volume::PulseVolumeController;

#[cfg(feature = "onnx")]
use vocalis_core::wakeword::neural::{NeuralWakeWordConfig, NeuralWakeWordDetector};

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("VOCALIS_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("vocalis.ini"))
}

/// Channel layout the capture pipeline should demux, derived the same way
/// the original client derives it from `stereo2mono`/`ec_loopback` rather
/// than trusting whatever the device reports.
fn expected_channel_count(audio: &vocalis_core::config::AudioConfig) -> u8 {
    if audio.ec_loopback {
        3
    } else if audio.stereo2mono {
        2
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vocalis=info".parse().unwrap()),
        )
        .init();

    let path = config_path();
    info!(path = %path.display(), "loading configuration");
    let config = Config::load(&path)?;

    let bus = EventBus::new(512);

    // ── Capture pipeline ────────────────────────────────────────────────
    let (producer, consumer) = create_audio_ring();
    let capture_running = Arc::new(AtomicBool::new(true));
    let expected_channels = expected_channel_count(&config.audio);

    let audio_capture_running = capture_running.clone();
    let preferred_input = config.audio.input.clone();
    // `AudioCapture` is bound to the thread that creates it; keep it alive
    // on a dedicated thread for the program's lifetime rather than moving
    // it into the pipeline thread, which only ever touches the consumer.
    let (capture_ready_tx, capture_ready_rx) = std::sync::mpsc::channel();
    let device_thread = std::thread::Builder::new()
        .name("vocalis-audio-device".into())
        .spawn(move || {
            let opened = AudioCapture::open_raw_with_preference(
                producer,
                audio_capture_running.clone(),
                preferred_input.as_deref(),
            );
            let device_channels = match &opened {
                Ok((_, channels)) => Some(*channels),
                Err(err) => {
                    error!(%err, "failed to open audio input device");
                    None
                }
            };
            let _ = capture_ready_tx.send(device_channels);
            let Ok((capture, _)) = opened else { return };
            while audio_capture_running.load(std::sync::atomic::Ordering::Acquire) {
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
            capture.stop();
        })
        .expect("failed to spawn audio device thread");

    let device_channels = capture_ready_rx.recv().ok().flatten();
    let channel_count = match device_channels {
        Some(reported) if (reported as u8) >= expected_channels => expected_channels,
        Some(reported) => {
            warn!(
                expected = expected_channels,
                reported, "input device has fewer channels than stereo2mono/ec_loopback expect; falling back to mono"
            );
            1
        }
        None => expected_channels,
    };

    let wake_detector: Box<dyn vocalis_core::wakeword::WakeWordDetector> = {
        #[cfg(feature = "onnx")]
        {
            match NeuralWakeWordDetector::new(NeuralWakeWordConfig::from_sensitivity(
                config.wakeword.sensitivity,
            )) {
                Ok(detector) => Box::new(detector),
                Err(err) => {
                    warn!(%err, "failed to load neural wake-word model, falling back to external wake() calls only");
                    Box::new(NullWakeWordDetector)
                }
            }
        }
        #[cfg(not(feature = "onnx"))]
        {
            Box::new(NullWakeWordDetector)
        }
    };

    let capture_pipeline = CapturePipeline::new(
        CaptureConfig::new(
            16_000,
            channel_count,
            config.audio.stereo2mono,
            config.audio.ec_enabled,
            config.audio.ec_loopback,
        ),
        consumer,
        wake_detector,
        Box::new(EnergyVad::new(0.015, 5)),
        Box::new(NullEchoCanceller),
        bus.clone(),
        &config.vad,
    );
    let (capture_handle, capture_thread) = capture_pipeline.spawn();

    // ── Protocol clients ────────────────────────────────────────────────
    let (conversation, conversation_task) = ConversationClient::spawn(config.general.clone(), bus.clone());

    // ── Dialog collaborators ────────────────────────────────────────────
    let sounds_dir = config
        .system
        .cache_dir
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(default_sounds_dir);
    let player = ProcessPlayer::new(
        bus.clone(),
        tokio::runtime::Handle::current(),
        config.general.nl_url.clone(),
        config.general.locale.clone(),
        config.audio.voice.clone().unwrap_or_else(|| "female".to_string()),
        sounds_dir,
        config.sounds.clone(),
        "paplay".to_string(),
    );
    let leds = LoggingLedDriver::new(config.leds.clone());
    let volume = PulseVolumeController::new(config.audio.sink.clone());

    let mut state_machine = StateMachine::new(
        &config.general,
        &config.wakeword,
        &config.hacks,
        Box::new(player),
        Box::new(leds),
        Box::new(volume),
        conversation,
        bus.clone(),
    );

    info!("vocalis-agent running, awaiting wake word");

    // ── Main dispatch loop ──────────────────────────────────────────────
    let dispatch_bus = bus.clone();
    let dispatch_task = tokio::task::spawn_blocking(move || loop {
        let event = dispatch_bus.recv();
        state_machine.dispatch(event);
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
        result = dispatch_task => {
            if let Err(err) = result {
                error!(%err, "dialog dispatch task panicked");
            }
        }
        result = conversation_task => {
            if let Err(err) = result {
                error!(%err, "conversation client task panicked");
            }
        }
    }

    capture_running.store(false, std::sync::atomic::Ordering::Release);
    capture_handle.close();
    let _ = capture_thread.join();
    let _ = device_thread.join();

    Ok(())
}
