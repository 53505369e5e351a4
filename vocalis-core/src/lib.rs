//! # vocalis-core
//!
//! Always-on voice-assistant client: wake-word capture, a dialog state
//! machine, and the WebSocket protocol clients that talk to the
//! conversation/STT backends.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → CapturePipeline (own thread)
//!                                                    │
//!                                     WakeWord / VAD / EchoCanceller cascade
//!                                                    │
//!                                              EventBus (Wake/InputFrame/InputDone)
//!                                                    │
//!                                           dialog::StateMachine::dispatch
//!                                                    │
//!                              ConversationClient / SttSession (WebSocket protocol)
//! ```
//!
//! The capture callback is zero-alloc; all heap work and inference happen
//! on the capture thread or the async runtime, never inside the device
//! callback itself.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod bus;
pub mod capture;
pub mod config;
pub mod dialog;
pub mod error;
pub mod events;
pub mod leds;
pub mod models;
pub mod player;
pub mod protocol;
pub mod vad;
pub mod volume;
pub mod wakeword;

// Convenience re-exports for downstream crates (vocalis-agent).
pub use bus::EventBus;
pub use config::Config;
pub use dialog::{State, StateMachine};
pub use error::VocalisError;
pub use events::Event;

#[cfg(feature = "onnx")]
pub use vad::SileroVad;

#[cfg(feature = "onnx")]
pub use wakeword::neural::NeuralWakeWordDetector;
