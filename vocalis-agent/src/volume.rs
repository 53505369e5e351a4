//! `VolumeController` backed by `pactl`, mirroring the PulseAudio-flavored
//! deployments the rest of the audio stack already assumes (`AudioConfig::sink`,
//! `AudioBackend::Pulse`).

use std::process::Command;

use tracing::warn;
use vocalis_core::volume::VolumeController;

const DUCK_VOLUME: u8 = 25;

pub struct PulseVolumeController {
    sink: String,
    volume: u8,
    pre_duck: Option<u8>,
}

impl PulseVolumeController {
    pub fn new(sink: String) -> Self {
        let volume = Self::query(&sink).unwrap_or(100);
        Self {
            sink,
            volume,
            pre_duck: None,
        }
    }

    fn query(sink: &str) -> Option<u8> {
        let output = Command::new("pactl")
            .args(["get-sink-volume", sink])
            .output()
            .ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        // Line looks like "Volume: front-left: .../ 57% / ...".
        let pct_idx = text.find('%')?;
        let digits_start = text[..pct_idx]
            .rfind(|c: char| !c.is_ascii_digit())
            .map(|i| i + 1)
            .unwrap_or(0);
        text[digits_start..pct_idx].trim().parse().ok()
    }

    fn apply(&self, volume: u8) {
        let status = Command::new("pactl")
            .args(["set-sink-volume", &self.sink, &format!("{volume}%")])
            .status();
        if let Err(err) = status {
            warn!(%err, sink = %self.sink, "failed to invoke pactl");
        }
    }
}

impl VolumeController for PulseVolumeController {
    fn duck(&mut self) {
        if self.pre_duck.is_some() {
            return;
        }
        self.pre_duck = Some(self.volume);
        self.set_volume(DUCK_VOLUME.min(self.volume));
    }

    fn unduck(&mut self) {
        if let Some(previous) = self.pre_duck.take() {
            self.set_volume(previous);
        }
    }

    fn get_volume(&self) -> u8 {
        self.volume
    }

    fn set_volume(&mut self, volume: u8) {
        let volume = volume.min(100);
        self.volume = volume;
        self.apply(volume);
    }
}
