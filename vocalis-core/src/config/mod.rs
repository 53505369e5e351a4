//! Sectioned key/value configuration file loader.
//!
//! The wire format is a handful of `[section]` headers followed by
//! `key = value` lines (blank lines and `#`/`;`-prefixed lines ignored).
//! Every key has a documented default; bounded numeric keys are clamped
//! here, once, rather than at each call site — mirroring the
//! normalize-on-load discipline the desktop app's settings module uses
//! for its own (JSON) config file.

mod parse;

use std::path::Path;
use thiserror::Error;

pub use parse::Section;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for {section}.{key}: {value}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    #[error("unknown auth mode: {0}")]
    UnknownAuthMode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Bearer,
    Cookie,
    HomeAssistant,
    OAuth2,
}

impl std::str::FromStr for AuthMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AuthMode::None),
            "bearer" => Ok(AuthMode::Bearer),
            "cookie" => Ok(AuthMode::Cookie),
            "home_assistant" => Ok(AuthMode::HomeAssistant),
            "oauth2" => Ok(AuthMode::OAuth2),
            other => Err(ConfigError::UnknownAuthMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneralConfig {
    pub url: String,
    pub access_token: Option<String>,
    pub conversation_id: Option<String>,
    pub nl_url: String,
    pub locale: String,
    pub auth_mode: AuthMode,
    pub retry_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            url: "wss://almond.stanford.edu/me/api/conversation".to_string(),
            access_token: None,
            conversation_id: None,
            nl_url: "https://nlp-staging.almond.stanford.edu".to_string(),
            locale: "en-US".to_string(),
            auth_mode: AuthMode::None,
            retry_interval_ms: 3000,
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioBackend {
    Alsa,
    Pulse,
}

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub backend: AudioBackend,
    pub input: Option<String>,
    pub sink: String,
    pub output: Option<String>,
    pub voice: Option<String>,
    pub stereo2mono: bool,
    pub ec_enabled: bool,
    pub ec_loopback: bool,
    pub output_fifo: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: AudioBackend::Pulse,
            input: None,
            sink: "echosink".to_string(),
            output: None,
            voice: None,
            stereo2mono: true,
            ec_enabled: false,
            ec_loopback: false,
            output_fifo: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VadConfig {
    pub start_speaking_ms: u64,
    pub done_speaking_ms: u64,
    pub input_detected_noise_ms: u64,
    pub listen_timeout_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            start_speaking_ms: 2000,
            done_speaking_ms: 300,
            input_detected_noise_ms: 300,
            listen_timeout_ms: 10_000,
        }
    }
}

impl VadConfig {
    fn clamp(mut self) -> Self {
        self.start_speaking_ms = self.start_speaking_ms.clamp(100, 5000);
        self.listen_timeout_ms = self.listen_timeout_ms.clamp(1000, 100_000);
        self
    }
}

#[derive(Debug, Clone)]
pub struct WakewordConfig {
    pub library_path: String,
    pub model_path: String,
    pub keyword_path: String,
    pub sensitivity: f32,
    pub pattern: String,
}

impl Default for WakewordConfig {
    fn default() -> Self {
        Self {
            library_path: "libpv_porcupine.so".to_string(),
            model_path: "porcupine_params.pv".to_string(),
            keyword_path: "keyword.ppn".to_string(),
            sensitivity: 0.7,
            pattern: "^computers?[.,!?]?".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SoundsConfig {
    pub wake: String,
    pub no_input: String,
    pub too_much_input: String,
    pub news_intro: String,
    pub alarm_clock_elapsed: String,
    pub working: String,
    pub stt_error: String,
}

impl Default for SoundsConfig {
    fn default() -> Self {
        Self {
            wake: "match.oga".to_string(),
            no_input: "no-match.oga".to_string(),
            too_much_input: "no-match.oga".to_string(),
            news_intro: "news-intro.oga".to_string(),
            alarm_clock_elapsed: "alarm-clock-elapsed.oga".to_string(),
            working: "match.oga".to_string(),
            stt_error: "no-match.oga".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedEffect {
    None,
    Solid,
    Circular,
    Pulse,
}

impl std::str::FromStr for LedEffect {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(LedEffect::None),
            "solid" => Ok(LedEffect::Solid),
            "circular" => Ok(LedEffect::Circular),
            "pulse" => Ok(LedEffect::Pulse),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LedStyle {
    pub effect: LedEffect,
    pub color: u32,
}

#[derive(Debug, Clone)]
pub struct LedsConfig {
    pub starting: LedStyle,
    pub sleeping: LedStyle,
    pub listening: LedStyle,
    pub processing: LedStyle,
    pub saying: LedStyle,
    pub error: LedStyle,
    pub net_error: LedStyle,
    pub disabled: LedStyle,
}

impl Default for LedsConfig {
    fn default() -> Self {
        Self {
            starting: LedStyle { effect: LedEffect::Pulse, color: 0x0000ff },
            sleeping: LedStyle { effect: LedEffect::None, color: 0x000000 },
            listening: LedStyle { effect: LedEffect::Pulse, color: 0x00ff00 },
            processing: LedStyle { effect: LedEffect::Circular, color: 0x0000ff },
            saying: LedStyle { effect: LedEffect::Pulse, color: 0x8f00ff },
            error: LedStyle { effect: LedEffect::Solid, color: 0xff0000 },
            net_error: LedStyle { effect: LedEffect::Circular, color: 0xffa500 },
            disabled: LedStyle { effect: LedEffect::Solid, color: 0xff0000 },
        }
    }
}

#[derive(Debug, Clone)]
pub struct HacksConfig {
    pub wake_word_verification: bool,
    pub suppress_repeated_notifs: bool,
    pub dns_server: String,
}

impl Default for HacksConfig {
    fn default() -> Self {
        Self {
            wake_word_verification: true,
            suppress_repeated_notifs: false,
            dns_server: "8.8.8.8".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    pub proxy: Option<String>,
    pub ssl_strict: Option<bool>,
    pub ssl_ca_file: Option<String>,
    pub cache_dir: Option<String>,
}

/// Fully parsed, defaulted and bounds-clamped configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub general: GeneralConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub wakeword: WakewordConfig,
    pub sounds: SoundsConfig,
    pub leds: LedsConfig,
    pub hacks: HacksConfig,
    pub system: SystemConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            wakeword: WakewordConfig::default(),
            sounds: SoundsConfig::default(),
            leds: LedsConfig::default(),
            hacks: HacksConfig::default(),
            system: SystemConfig::default(),
        }
    }
}

impl Config {
    /// Load and parse a sectioned key/value config file, applying defaults
    /// for every unspecified key and clamping bounded numeric keys.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let sections = parse::parse_sections(text);
        let mut cfg = Config::default();

        if let Some(s) = sections.get("general") {
            if let Some(v) = s.get("url") {
                cfg.general.url = v.to_string();
            }
            cfg.general.access_token = s.get("accessToken").map(str::to_string);
            cfg.general.conversation_id = s.get("conversationId").map(str::to_string);
            if let Some(v) = s.get("nlUrl") {
                cfg.general.nl_url = v.to_string();
            }
            if let Some(v) = s.get("locale") {
                cfg.general.locale = v.to_string();
            }
            if let Some(v) = s.get("authMode") {
                cfg.general.auth_mode = v.parse()?;
            }
            if let Some(v) = s.get("retry_interval_ms") {
                cfg.general.retry_interval_ms = parse_u64("general", "retry_interval_ms", v)?;
            }
            if let Some(v) = s.get("connect_timeout_ms") {
                cfg.general.connect_timeout_ms = parse_u64("general", "connect_timeout_ms", v)?;
            }
        }

        if let Some(s) = sections.get("audio") {
            if let Some(v) = s.get("backend") {
                cfg.audio.backend = match v {
                    "alsa" => AudioBackend::Alsa,
                    "pulse" => AudioBackend::Pulse,
                    other => {
                        return Err(ConfigError::InvalidValue {
                            section: "audio".into(),
                            key: "backend".into(),
                            value: other.into(),
                        })
                    }
                };
            }
            cfg.audio.input = s.get("input").map(str::to_string);
            if let Some(v) = s.get("sink") {
                cfg.audio.sink = v.to_string();
            }
            cfg.audio.output = s.get("output").map(str::to_string);
            cfg.audio.voice = s.get("voice").map(str::to_string);
            if let Some(v) = s.get("stereo2mono") {
                cfg.audio.stereo2mono = parse_bool("audio", "stereo2mono", v)?;
            }
            if let Some(v) = s.get("ec_enabled") {
                cfg.audio.ec_enabled = parse_bool("audio", "ec_enabled", v)?;
            }
            if let Some(v) = s.get("ec_loopback") {
                cfg.audio.ec_loopback = parse_bool("audio", "ec_loopback", v)?;
            }
            cfg.audio.output_fifo = s.get("output_fifo").map(str::to_string);
        }

        if let Some(s) = sections.get("vad") {
            if let Some(v) = s.get("start_speaking_ms") {
                cfg.vad.start_speaking_ms = parse_u64("vad", "start_speaking_ms", v)?;
            }
            if let Some(v) = s.get("done_speaking_ms") {
                cfg.vad.done_speaking_ms = parse_u64("vad", "done_speaking_ms", v)?;
            }
            if let Some(v) = s.get("input_detected_noise_ms") {
                cfg.vad.input_detected_noise_ms =
                    parse_u64("vad", "input_detected_noise_ms", v)?;
            }
            if let Some(v) = s.get("listen_timeout_ms") {
                cfg.vad.listen_timeout_ms = parse_u64("vad", "listen_timeout_ms", v)?;
            }
        }
        cfg.vad = cfg.vad.clamp();

        if let Some(s) = sections.get("wakeword") {
            if let Some(v) = s.get("library_path") {
                cfg.wakeword.library_path = v.to_string();
            }
            if let Some(v) = s.get("model_path") {
                cfg.wakeword.model_path = v.to_string();
            }
            if let Some(v) = s.get("keyword_path") {
                cfg.wakeword.keyword_path = v.to_string();
            }
            if let Some(v) = s.get("sensitivity") {
                cfg.wakeword.sensitivity = parse_f32("wakeword", "sensitivity", v)?.clamp(0.0, 1.0);
            }
            if let Some(v) = s.get("pattern") {
                cfg.wakeword.pattern = v.to_string();
            }
        }

        if let Some(s) = sections.get("sounds") {
            if let Some(v) = s.get("wake") {
                cfg.sounds.wake = v.to_string();
            }
            if let Some(v) = s.get("no_input") {
                cfg.sounds.no_input = v.to_string();
            }
            if let Some(v) = s.get("too_much_input") {
                cfg.sounds.too_much_input = v.to_string();
            }
            if let Some(v) = s.get("news_intro") {
                cfg.sounds.news_intro = v.to_string();
            }
            if let Some(v) = s.get("alarm_clock_elapsed") {
                cfg.sounds.alarm_clock_elapsed = v.to_string();
            }
            if let Some(v) = s.get("working") {
                cfg.sounds.working = v.to_string();
            }
            if let Some(v) = s.get("stt_error") {
                cfg.sounds.stt_error = v.to_string();
            }
        }

        if let Some(s) = sections.get("leds") {
            apply_led_style(&mut cfg.leds.starting, s, "starting")?;
            apply_led_style(&mut cfg.leds.sleeping, s, "sleeping")?;
            apply_led_style(&mut cfg.leds.listening, s, "listening")?;
            apply_led_style(&mut cfg.leds.processing, s, "processing")?;
            apply_led_style(&mut cfg.leds.saying, s, "saying")?;
            apply_led_style(&mut cfg.leds.error, s, "error")?;
            apply_led_style(&mut cfg.leds.net_error, s, "net_error")?;
            apply_led_style(&mut cfg.leds.disabled, s, "disabled")?;
        }

        if let Some(s) = sections.get("hacks") {
            if let Some(v) = s.get("wake_word_verification") {
                cfg.hacks.wake_word_verification = parse_bool("hacks", "wake_word_verification", v)?;
            }
            if let Some(v) = s.get("suppress_repeated_notifs") {
                cfg.hacks.suppress_repeated_notifs =
                    parse_bool("hacks", "suppress_repeated_notifs", v)?;
            }
            if let Some(v) = s.get("dns_server") {
                cfg.hacks.dns_server = v.to_string();
            }
        }

        if let Some(s) = sections.get("system") {
            cfg.system.proxy = s.get("proxy").map(str::to_string);
            if let Some(v) = s.get("ssl_strict") {
                cfg.system.ssl_strict = Some(parse_bool("system", "ssl_strict", v)?);
            }
            cfg.system.ssl_ca_file = s.get("ssl_ca_file").map(str::to_string);
            cfg.system.cache_dir = s.get("cache_dir").map(str::to_string);
        }

        Ok(cfg)
    }
}

fn apply_led_style(style: &mut LedStyle, s: &Section, prefix: &str) -> Result<(), ConfigError> {
    if let Some(v) = s.get(&format!("{prefix}_effect")) {
        style.effect = v.parse().map_err(|_| ConfigError::InvalidValue {
            section: "leds".into(),
            key: format!("{prefix}_effect"),
            value: v.to_string(),
        })?;
    }
    if let Some(v) = s.get(&format!("{prefix}_color")) {
        style.color = u32::from_str_radix(v.trim_start_matches('#'), 16).map_err(|_| {
            ConfigError::InvalidValue {
                section: "leds".into(),
                key: format!("{prefix}_color"),
                value: v.to_string(),
            }
        })?;
    }
    Ok(())
}

fn parse_u64(section: &str, key: &str, v: &str) -> Result<u64, ConfigError> {
    v.parse().map_err(|_| ConfigError::InvalidValue {
        section: section.into(),
        key: key.into(),
        value: v.into(),
    })
}

fn parse_f32(section: &str, key: &str, v: &str) -> Result<f32, ConfigError> {
    v.parse().map_err(|_| ConfigError::InvalidValue {
        section: section.into(),
        key: key.into(),
        value: v.into(),
    })
}

fn parse_bool(section: &str, key: &str, v: &str) -> Result<bool, ConfigError> {
    match v {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            section: section.into(),
            key: key.into(),
            value: other.into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.general.locale, "en-US");
        assert_eq!(cfg.vad.done_speaking_ms, 300);
        assert_eq!(cfg.wakeword.sensitivity, 0.7);
        assert_eq!(cfg.sounds.wake, "match.oga");
    }

    #[test]
    fn parses_sections_and_overrides_defaults() {
        let text = r#"
            [general]
            locale = fr-FR
            authMode = bearer
            retry_interval_ms = 1500

            [vad]
            start_speaking_ms = 50
            listen_timeout_ms = 999999

            [leds]
            listening_effect = solid
            listening_color = #ff00ff
        "#;
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.general.locale, "fr-FR");
        assert_eq!(cfg.general.auth_mode, AuthMode::Bearer);
        assert_eq!(cfg.general.retry_interval_ms, 1500);
        // out-of-bounds values are clamped, not rejected
        assert_eq!(cfg.vad.start_speaking_ms, 100);
        assert_eq!(cfg.vad.listen_timeout_ms, 100_000);
        assert_eq!(cfg.leds.listening.effect, LedEffect::Solid);
        assert_eq!(cfg.leds.listening.color, 0xff00ff);
    }

    #[test]
    fn unknown_auth_mode_is_an_error() {
        let text = "[general]\nauthMode = telepathy\n";
        assert!(Config::parse(text).is_err());
    }
}
