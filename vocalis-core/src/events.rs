//! The dialog event alphabet. Every state transition in `dialog` is driven
//! by one of these variants; every producer (capture pipeline, protocol
//! clients, player) speaks this vocabulary rather than calling into the
//! state machine directly.

use std::sync::Arc;

use crate::buffering::chunk::AudioFrame;

/// A unit of audio handed from capture to a protocol client mid-utterance.
#[derive(Debug, Clone)]
pub struct InputFrame {
    pub frame: Arc<AudioFrame>,
}

/// Why an utterance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDoneReason {
    /// Trailing silence exceeded the configured threshold — speech was
    /// detected and the server should attempt recognition.
    Silence,
    /// No speech crossed the noise threshold before the `Woke` phase's
    /// start-speaking window elapsed.
    Cancelled,
}

/// Spotify device-linking credentials forwarded from the conversation
/// server to whatever external Spotify Connect client is configured.
#[derive(Debug, Clone)]
pub struct SpotifyCredentials {
    pub username: String,
    pub access_token: String,
    pub expires_in_secs: u64,
}

/// All events the dialog state machine reacts to.
#[derive(Debug, Clone)]
pub enum Event {
    /// Wake-word fired (or `wake()` was invoked directly).
    Wake,
    /// One frame of an in-progress utterance.
    InputFrame(InputFrame),
    /// The current utterance has ended.
    InputDone(InputDoneReason),
    /// A `text` message arrived from the conversation server, to be spoken.
    TextMessage { text_id: u64, text: String, follow_up: bool },
    /// An `audio` message (URL to play) arrived from the conversation server.
    AudioMessage { text_id: u64, url: String, follow_up: bool },
    /// A `sound` message (named local sound effect) arrived.
    SoundMessage { name: String },
    /// Server asked a clarifying question tied to a specific `text_id`.
    AskSpecial { text_id: u64, special: String },
    /// Spotify Connect device-linking credentials arrived.
    SpotifyCredentials(SpotifyCredentials),
    /// Volume change requested (delta, in percentage points; may be negative).
    AdjustVolume(i32),
    /// Toggle the assistant between Sleeping and Disabled.
    ToggleDisabled,
    /// Toggle Config mode (used by on-device setup flows).
    ToggleConfigMode,
    /// Unrecoverable error — drop whatever is in progress and return to Sleeping.
    Panic(String),
    /// The player started streaming audio tagged with `ref_id`.
    PlayerStreamEnter { ref_id: u64 },
    /// The player finished streaming audio tagged with `ref_id`.
    PlayerStreamEnd { ref_id: u64 },
    /// An inbound `protocol:audio` request arrived and needs dispatch.
    AudioRequest(crate::protocol::audio_subprotocol::AudioRequest),
    /// No input arrived before the listening timeout elapsed.
    InputTimeout,
    /// The active STT session produced its one outcome.
    SttResult(crate::protocol::stt::SttOutcome),
}

impl Event {
    /// Events that must never be dropped, even under queue pressure.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Event::Panic(_)
                | Event::ToggleDisabled
                | Event::ToggleConfigMode
                | Event::AudioRequest(_)
        )
    }
}
