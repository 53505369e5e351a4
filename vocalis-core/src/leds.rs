//! Narrow interface towards the LED effect driver. Each dialog state maps
//! to exactly one `LedState`; the driver owns the actual animation timing.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    Starting,
    Sleeping,
    Listening,
    Processing,
    Saying,
    Config,
    Error,
    NetError,
    Disabled,
}

pub trait LedDriver: Send + 'static {
    fn animate(&mut self, state: LedState);
}

pub struct NullLedDriver;

impl LedDriver for NullLedDriver {
    fn animate(&mut self, _state: LedState) {}
}
