use std::thread;
use std::time::{Duration, Instant};

use vocalis_core::buffering::{chunk::AudioFrame, create_audio_ring, Producer};
use vocalis_core::bus::EventBus;
use vocalis_core::capture::echo::NullEchoCanceller;
use vocalis_core::capture::{CaptureConfig, CapturePipeline, DEFAULT_WAKE_FRAME_LEN};
use vocalis_core::config::VadConfig;
use vocalis_core::events::Event;
use vocalis_core::vad::{VadDecision, VoiceActivityDetector};
use vocalis_core::wakeword::WakeWordDetector;

struct AlwaysSpeechVad;

impl VoiceActivityDetector for AlwaysSpeechVad {
    fn classify(&mut self, _frame: &AudioFrame) -> VadDecision {
        VadDecision::Speech
    }

    fn reset(&mut self) {}
}

struct FiresOnce {
    fired: bool,
}

impl WakeWordDetector for FiresOnce {
    fn process(&mut self, frame: &AudioFrame) -> bool {
        if frame.is_empty() || self.fired {
            return false;
        }
        self.fired = true;
        true
    }

    fn reset(&mut self) {
        self.fired = false;
    }
}

fn recv_with_timeout(bus: &EventBus, timeout: Duration) -> Event {
    let start = Instant::now();
    loop {
        if let Some(ev) = bus.try_recv() {
            return ev;
        }
        if start.elapsed() >= timeout {
            panic!("timed out waiting for an event off the bus");
        }
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn wake_to_event_latency_under_500ms() {
    let (mut producer, consumer) = create_audio_ring();
    producer.push_slice(&vec![0.2; DEFAULT_WAKE_FRAME_LEN]);

    let bus = EventBus::new(64);
    let pipeline = CapturePipeline::new(
        CaptureConfig::new(16_000, 1, true, false, false),
        consumer,
        Box::new(FiresOnce { fired: false }),
        Box::new(AlwaysSpeechVad),
        Box::new(NullEchoCanceller),
        bus.clone(),
        &VadConfig::default(),
    );

    let start = Instant::now();
    let (handle, join) = pipeline.spawn();

    let first = recv_with_timeout(&bus, Duration::from_secs(2));
    let elapsed = start.elapsed();

    handle.close();
    join.join().expect("capture thread panicked");

    assert!(matches!(first, Event::Wake));
    assert!(
        elapsed < Duration::from_millis(500),
        "wake-to-event latency too high: {:?} (target < 500ms)",
        elapsed
    );
}

#[test]
fn woke_phase_emits_input_frames_before_reaching_listening() {
    let (mut producer, consumer) = create_audio_ring();
    producer.push_slice(&vec![0.2; DEFAULT_WAKE_FRAME_LEN]);

    let bus = EventBus::new(256);
    let mut cfg = VadConfig::default();
    cfg.input_detected_noise_ms = 30; // one VAD frame is enough to enter Listening
    cfg.done_speaking_ms = 30;

    let pipeline = CapturePipeline::new(
        CaptureConfig::new(16_000, 1, true, false, false),
        consumer,
        Box::new(FiresOnce { fired: false }),
        Box::new(AlwaysSpeechVad),
        Box::new(NullEchoCanceller),
        bus.clone(),
        &cfg,
    );

    let (handle, join) = pipeline.spawn();

    // The VAD always reports speech, so Listening never reaches Silence on
    // its own; close() terminates the thread once we've seen what we need.
    for _ in 0..50 {
        producer.push_slice(&vec![0.2; 480]);
        thread::sleep(Duration::from_millis(2));
    }

    let mut saw_wake = false;
    let mut saw_input_frame = false;
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline && !(saw_wake && saw_input_frame) {
        match bus.try_recv() {
            Some(Event::Wake) => saw_wake = true,
            Some(Event::InputFrame(_)) => saw_input_frame = true,
            Some(_) => {}
            None => thread::sleep(Duration::from_millis(2)),
        }
    }

    handle.close();
    join.join().expect("capture thread panicked");

    assert!(saw_wake, "expected a Wake event");
    assert!(saw_input_frame, "expected at least one InputFrame event");
}
