//! LED driver backed by whatever the deployment's `leds` config describes.
//! Most single-board targets wire this up to a strip over SPI/I2C; absent
//! that hardware, this backend just narrates the animation it would have
//! run, which is enough to drive integration tests and headless desktops.

use tracing::info;
use vocalis_core::config::{LedStyle, LedsConfig};
use vocalis_core::leds::{LedDriver, LedState};

pub struct LoggingLedDriver {
    config: LedsConfig,
}

impl LoggingLedDriver {
    pub fn new(config: LedsConfig) -> Self {
        Self { config }
    }

    fn style_for(&self, state: LedState) -> LedStyle {
        match state {
            LedState::Starting => self.config.starting,
            LedState::Sleeping => self.config.sleeping,
            LedState::Listening => self.config.listening,
            LedState::Processing => self.config.processing,
            LedState::Saying => self.config.saying,
            LedState::Config => self.config.sleeping,
            LedState::Error => self.config.error,
            LedState::NetError => self.config.net_error,
            LedState::Disabled => self.config.disabled,
        }
    }
}

impl LedDriver for LoggingLedDriver {
    fn animate(&mut self, state: LedState) {
        let style = self.style_for(state);
        info!(?state, effect = ?style.effect, color = format!("#{:06x}", style.color), "led animation");
    }
}
