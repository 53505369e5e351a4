//! Narrow collaborator interface towards whatever actually renders audio
//! (a GStreamer pipeline, a native OS mixer, a wrapped CLI player). The
//! dialog layer only ever talks to this trait, never to a concrete backend.

use crate::events::Event;

/// A named local sound cue, mirroring the fixed set configured in
/// `SoundsConfig`. Most are triggered internally by the dialog state
/// machine; only `NewsIntro` and `AlarmClockElapsed` are reachable through
/// a server-sent `sound` message in the base deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sound {
    Wake,
    NoInput,
    TooMuchInput,
    Working,
    SttError,
    NewsIntro,
    AlarmClockElapsed,
}

impl Sound {
    /// Map a server-sent `sound{name}` logical key to a cue. Unrecognized
    /// names are the caller's responsibility to log and drop.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "news-intro" | "news_intro" => Some(Sound::NewsIntro),
            "alarm-clock-elapsed" | "alarm_clock_elapsed" => Some(Sound::AlarmClockElapsed),
            _ => None,
        }
    }
}

/// Playback surface the dialog state machine drives.
///
/// Implementors report stream lifecycle back through `Event::PlayerStreamEnter`
/// / `Event::PlayerStreamEnd` (tagged with the `ref_id` the caller supplied),
/// so the trait itself stays synchronous and fire-and-forget.
pub trait Player: Send + 'static {
    /// Speak `text` via the configured TTS voice, tagged `ref_id`.
    fn say(&mut self, ref_id: u64, text: &str);

    /// Stream a remote URL, tagged `ref_id`.
    fn play_url(&mut self, ref_id: u64, url: &str);

    /// Play a local named sound effect; `queue` mirrors the original
    /// player's distinction between interrupting playback and queuing
    /// behind whatever is already running.
    fn play_sound(&mut self, sound: Sound, queue: bool);

    /// Stop whatever is currently playing.
    fn stop(&mut self);

    /// Resume playback after a `stop`/duck.
    fn resume(&mut self);

    /// Drop everything queued but not yet started.
    fn clean_queue(&mut self);
}

/// A `Player` that does nothing but still satisfies the stream-lifecycle
/// contract, useful for headless testing of the dialog state machine.
pub struct NullPlayer;

impl Player for NullPlayer {
    fn say(&mut self, _ref_id: u64, _text: &str) {}
    fn play_url(&mut self, _ref_id: u64, _url: &str) {}
    fn play_sound(&mut self, _sound: Sound, _queue: bool) {}
    fn stop(&mut self) {}
    fn resume(&mut self) {}
    fn clean_queue(&mut self) {}
}

/// Convenience constructors for the two stream-lifecycle events a real
/// `Player` implementation emits onto the event bus around playback.
pub fn stream_enter(ref_id: u64) -> Event {
    Event::PlayerStreamEnter { ref_id }
}

pub fn stream_end(ref_id: u64) -> Event {
    Event::PlayerStreamEnd { ref_id }
}
