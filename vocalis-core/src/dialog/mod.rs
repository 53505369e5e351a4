//! The dialog state machine: six states, driven entirely by `Event`s taken
//! off the shared bus. `dispatch` is the single entry point — it always
//! runs on the control thread, so states never need their own locking.
//!
//! Unhandled events are logged and dropped rather than panicking: a race
//! between, say, a trailing `PlayerStreamEnd` for a just-finished utterance
//! and a new one starting is expected, not exceptional.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::{GeneralConfig, HacksConfig, WakewordConfig};
use crate::events::{Event, InputDoneReason};
use crate::leds::{LedDriver, LedState};
use crate::player::{Player, Sound};
use crate::protocol::audio_subprotocol::AudioRequest;
use crate::protocol::conversation::ConversationClient;
use crate::protocol::stt::{SttOutcome, SttSession};
use crate::volume::VolumeController;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Sleeping,
    Listening,
    Processing,
    Saying { text_id: u64, text: String, follow_up: bool },
    Disabled,
    Config,
}

impl State {
    fn led(&self) -> LedState {
        match self {
            State::Sleeping => LedState::Sleeping,
            State::Listening => LedState::Listening,
            State::Processing => LedState::Processing,
            State::Saying { .. } => LedState::Saying,
            State::Disabled => LedState::Disabled,
            State::Config => LedState::Config,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            State::Sleeping => "Sleeping",
            State::Listening => "Listening",
            State::Processing => "Processing",
            State::Saying { .. } => "Saying",
            State::Disabled => "Disabled",
            State::Config => "Config",
        }
    }
}

/// Owns every external collaborator the state machine drives and the
/// current `State`. Constructed once at startup and fed events in a loop
/// by whatever owns the bus's receive side.
pub struct StateMachine {
    state: State,
    enter_time: Instant,
    player: Box<dyn Player>,
    leds: Box<dyn LedDriver>,
    volume: Box<dyn VolumeController>,
    conversation: ConversationClient,
    bus: EventBus,
    nl_url: String,
    locale: String,
    active_stt: Option<SttSession>,
    wake_word_pattern: Option<regex::Regex>,
}

impl StateMachine {
    pub fn new(
        general: &GeneralConfig,
        wakeword: &WakewordConfig,
        hacks: &HacksConfig,
        player: Box<dyn Player>,
        leds: Box<dyn LedDriver>,
        volume: Box<dyn VolumeController>,
        conversation: ConversationClient,
        bus: EventBus,
    ) -> Self {
        let wake_word_pattern = if hacks.wake_word_verification {
            match regex::Regex::new(&wakeword.pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(%err, pattern = %wakeword.pattern, "invalid wake_word_pattern, disabling verification");
                    None
                }
            }
        } else {
            None
        };

        let mut machine = Self {
            state: State::Sleeping,
            enter_time: Instant::now(),
            player,
            leds,
            volume,
            conversation,
            bus,
            nl_url: general.nl_url.clone(),
            locale: general.locale.clone(),
            active_stt: None,
            wake_word_pattern,
        };
        machine.leds.animate(LedState::Starting);
        machine.enter(State::Sleeping);
        machine
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    fn enter(&mut self, state: State) {
        self.enter_time = Instant::now();
        info!(state = state.name(), "entering state");
        self.leds.animate(state.led());

        match &state {
            State::Sleeping => {
                self.volume.unduck();
            }
            State::Listening => {
                self.begin_stt_session();
                self.volume.duck();
                self.player.stop();
                self.player.play_sound(Sound::Wake, false);
            }
            State::Saying { text_id, text, .. } => {
                self.player.say(*text_id, text);
            }
            State::Disabled | State::Config | State::Processing => {}
        }

        self.state = state;
    }

    fn transit(&mut self, state: State) {
        let spent = self.enter_time.elapsed();
        debug!(from = self.state.name(), millis = spent.as_millis() as u64, "leaving state");
        self.enter(state);
    }

    fn begin_stt_session(&mut self) {
        self.active_stt = Some(SttSession::begin(&self.nl_url, &self.locale));
    }

    fn flush_stt(&mut self) {
        if let Some(session) = self.active_stt.take() {
            let bus = self.bus.clone();
            tokio::spawn(async move {
                let outcome = session.finish().await;
                bus.push(Event::SttResult(outcome));
            });
        }
    }

    fn abort_stt(&mut self) {
        if let Some(session) = self.active_stt.take() {
            session.abort();
        }
    }

    /// Process one event. Safe to call from the control thread only.
    pub fn dispatch(&mut self, event: Event) {
        // protocol:audio must be answered exactly once regardless of
        // dialog state — it is a side channel, not a dialog transition.
        if let Event::AudioRequest(request) = event {
            self.handle_audio_request(request);
            return;
        }

        if let Event::Panic(reason) = event {
            warn!(reason, "panic event — returning to Sleeping");
            self.player.stop();
            self.leds.animate(LedState::Error);
            self.transit(State::Sleeping);
            return;
        }

        match (&self.state, event) {
            (State::Sleeping, Event::Wake) => self.transit(State::Listening),
            (State::Sleeping, Event::ToggleDisabled) => self.transit(State::Disabled),
            (State::Sleeping, Event::ToggleConfigMode) => self.transit(State::Config),

            (State::Listening, Event::InputFrame(frame)) => {
                if let Some(session) = &self.active_stt {
                    session.send_frame(frame.frame.to_pcm16());
                }
            }
            (State::Listening, Event::InputDone(InputDoneReason::Silence)) => {
                self.flush_stt();
                self.transit(State::Processing);
            }
            (State::Listening, Event::InputDone(InputDoneReason::Cancelled))
            | (State::Listening, Event::InputTimeout) => {
                self.abort_stt();
                self.player.play_sound(Sound::NoInput, false);
                self.transit(State::Sleeping);
            }

            (State::Processing, Event::SttResult(SttOutcome::Recognized(text))) => {
                if let Some(pattern) = &self.wake_word_pattern {
                    if !pattern.is_match(&text) {
                        debug!(text, "stt result does not match wake_word_pattern, discarding");
                        self.volume.unduck();
                        self.player.resume();
                        self.transit(State::Sleeping);
                        return;
                    }
                }
                self.player.clean_queue();
                if let Err(e) = self.conversation.send_command(&text) {
                    warn!("failed to forward recognized text: {e}");
                }
            }
            (State::Processing, Event::SttResult(_)) => {
                self.player.play_sound(Sound::SttError, false);
                self.volume.unduck();
                self.player.resume();
                self.transit(State::Sleeping);
            }
            (State::Processing, Event::TextMessage { text_id, text, .. }) => {
                self.transit(State::Saying { text_id, text, follow_up: false });
            }

            (State::Saying { text_id, .. }, Event::AskSpecial { text_id: ask_id, special })
                if *text_id == ask_id && !special.is_empty() =>
            {
                if let State::Saying { follow_up, .. } = &mut self.state {
                    *follow_up = true;
                }
            }
            (State::Saying { .. }, Event::AskSpecial { .. }) => {
                debug!("dropping AskSpecial for a stale or empty ask");
            }
            (State::Saying { text_id, .. }, Event::PlayerStreamEnter { ref_id }) if *text_id == ref_id => {
                debug!(text_id, "tts stream started");
            }
            (State::Saying { text_id, follow_up }, Event::PlayerStreamEnd { ref_id }) if *text_id == ref_id => {
                if *follow_up {
                    self.transit(State::Listening);
                } else {
                    self.volume.unduck();
                    self.transit(State::Sleeping);
                }
            }
            (State::Saying { .. }, Event::PlayerStreamEnter { .. })
            | (State::Saying { .. }, Event::PlayerStreamEnd { .. }) => {
                debug!("dropping player stream event for an unrelated ref_id");
            }

            (State::Disabled, Event::ToggleDisabled) => self.transit(State::Sleeping),
            (State::Config, Event::ToggleConfigMode) => self.transit(State::Sleeping),

            (state, event) => {
                debug!(state = state.name(), event = ?event, "dropping unhandled event");
            }
        }
    }

    fn handle_audio_request(&mut self, request: AudioRequest) {
        match request {
            AudioRequest::Check { spec, pending } => match spec {
                Some(crate::protocol::audio_subprotocol::PlayerSpec::Url) | None => {
                    pending.resolve_check(true, "");
                }
                Some(crate::protocol::audio_subprotocol::PlayerSpec::Spotify { .. }) => {
                    pending.resolve_check(true, "");
                }
                Some(crate::protocol::audio_subprotocol::PlayerSpec::Custom) => {
                    pending.resolve_check(false, "custom binaries are not supported");
                }
            },
            AudioRequest::Prepare { spec, pending } => {
                if let Some(crate::protocol::audio_subprotocol::PlayerSpec::Spotify {
                    username,
                    access_token,
                }) = spec
                {
                    self.bus.push(Event::SpotifyCredentials(crate::events::SpotifyCredentials {
                        username,
                        access_token,
                        expires_in_secs: 0,
                    }));
                }
                self.player.clean_queue();
                pending.resolve();
            }
            AudioRequest::Stop { pending } => {
                self.player.clean_queue();
                pending.resolve();
            }
            AudioRequest::PlayUrls { urls, pending } => {
                self.player.clean_queue();
                for (i, url) in urls.iter().enumerate() {
                    self.player.play_url(i as u64, url);
                }
                pending.resolve();
            }
            AudioRequest::SetVolume { volume, pending } => {
                self.volume.set_volume(volume.clamp(0, 100) as u8);
                pending.resolve();
            }
            AudioRequest::SetMute { mute, pending } => {
                if mute {
                    self.volume.duck();
                } else {
                    self.volume.unduck();
                }
                pending.resolve();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeneralConfig, HacksConfig, WakewordConfig};
    use crate::player::NullPlayer;
    use crate::leds::NullLedDriver;
    use crate::volume::NullVolumeController;

    fn machine() -> StateMachine {
        let bus = EventBus::new(32);
        let conversation = ConversationClient::disconnected_for_test();
        StateMachine::new(
            &GeneralConfig::default(),
            &WakewordConfig::default(),
            &HacksConfig::default(),
            Box::new(NullPlayer),
            Box::new(NullLedDriver),
            Box::new(NullVolumeController::default()),
            conversation,
            bus,
        )
    }

    #[test]
    fn starts_in_sleeping() {
        let m = machine();
        assert_eq!(*m.state(), State::Sleeping);
    }

    // Entering `Listening` opens an STT session, which spawns a background
    // task onto the current runtime — these need a real one to run under.

    #[tokio::test]
    async fn wake_enters_listening() {
        let mut m = machine();
        m.dispatch(Event::Wake);
        assert_eq!(*m.state(), State::Listening);
    }

    #[tokio::test]
    async fn silence_flushes_to_processing() {
        let mut m = machine();
        m.dispatch(Event::Wake);
        m.dispatch(Event::InputDone(InputDoneReason::Silence));
        assert_eq!(*m.state(), State::Processing);
    }

    #[tokio::test]
    async fn cancelled_input_returns_to_sleeping() {
        let mut m = machine();
        m.dispatch(Event::Wake);
        m.dispatch(Event::InputDone(InputDoneReason::Cancelled));
        assert_eq!(*m.state(), State::Sleeping);
    }

    #[tokio::test]
    async fn input_timeout_returns_to_sleeping() {
        let mut m = machine();
        m.dispatch(Event::Wake);
        m.dispatch(Event::InputTimeout);
        assert_eq!(*m.state(), State::Sleeping);
    }

    #[tokio::test]
    async fn text_message_enters_saying_with_text() {
        let mut m = machine();
        m.dispatch(Event::Wake);
        m.dispatch(Event::InputDone(InputDoneReason::Silence));
        m.dispatch(Event::TextMessage { text_id: 7, text: "hi".into(), follow_up: false });
        match m.state() {
            State::Saying { text_id, text, follow_up } => {
                assert_eq!(*text_id, 7);
                assert_eq!(text, "hi");
                assert!(!follow_up);
            }
            other => panic!("wrong state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_end_without_follow_up_goes_to_sleeping() {
        let mut m = machine();
        m.dispatch(Event::Wake);
        m.dispatch(Event::InputDone(InputDoneReason::Silence));
        m.dispatch(Event::TextMessage { text_id: 7, text: "hi".into(), follow_up: false });
        m.dispatch(Event::PlayerStreamEnd { ref_id: 7 });
        assert_eq!(*m.state(), State::Sleeping);
    }

    #[tokio::test]
    async fn ask_special_sets_follow_up_and_stream_end_returns_to_listening() {
        let mut m = machine();
        m.dispatch(Event::Wake);
        m.dispatch(Event::InputDone(InputDoneReason::Silence));
        m.dispatch(Event::TextMessage { text_id: 7, text: "yes or no?".into(), follow_up: false });
        m.dispatch(Event::AskSpecial { text_id: 7, special: "yes_no".into() });
        match m.state() {
            State::Saying { follow_up, .. } => assert!(follow_up),
            other => panic!("wrong state: {other:?}"),
        }
        m.dispatch(Event::PlayerStreamEnd { ref_id: 7 });
        assert_eq!(*m.state(), State::Listening);
    }

    #[tokio::test]
    async fn stream_end_with_unrelated_ref_id_is_ignored() {
        let mut m = machine();
        m.dispatch(Event::Wake);
        m.dispatch(Event::InputDone(InputDoneReason::Silence));
        m.dispatch(Event::TextMessage { text_id: 7, text: "hi".into(), follow_up: false });
        m.dispatch(Event::PlayerStreamEnd { ref_id: 99 });
        match m.state() {
            State::Saying { text_id, .. } => assert_eq!(*text_id, 7),
            other => panic!("wrong state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn panic_from_any_state_returns_to_sleeping() {
        let mut m = machine();
        m.dispatch(Event::Wake);
        m.dispatch(Event::InputDone(InputDoneReason::Silence));
        m.dispatch(Event::TextMessage { text_id: 1, text: "hi".into(), follow_up: false });
        m.dispatch(Event::Panic("boom".into()));
        assert_eq!(*m.state(), State::Sleeping);
    }

    #[test]
    fn toggle_disabled_round_trips() {
        let mut m = machine();
        m.dispatch(Event::ToggleDisabled);
        assert_eq!(*m.state(), State::Disabled);
        m.dispatch(Event::ToggleDisabled);
        assert_eq!(*m.state(), State::Sleeping);
    }

    #[test]
    fn toggle_config_round_trips() {
        let mut m = machine();
        m.dispatch(Event::ToggleConfigMode);
        assert_eq!(*m.state(), State::Config);
        m.dispatch(Event::ToggleConfigMode);
        assert_eq!(*m.state(), State::Sleeping);
    }

    #[tokio::test]
    async fn audio_request_is_handled_regardless_of_state() {
        use crate::protocol::audio_subprotocol::{AudioRequest, PendingAudioRequest};

        let mut m = machine();
        m.dispatch(Event::Wake);

        let pending = PendingAudioRequest::for_test(1);
        m.dispatch(Event::AudioRequest(AudioRequest::Stop { pending }));
        // Stop does not change dialog state; it's a side channel.
        assert_eq!(*m.state(), State::Listening);
    }
}
