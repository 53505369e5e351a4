//! Wake-word detection: a stateless-per-frame classifier wrapped around a
//! stateful three-stage neural pipeline (melspectrogram → embedding →
//! wake-word confidence), in the OpenWakeWord architecture.

#[cfg(feature = "onnx")]
pub mod neural;

use crate::buffering::chunk::AudioFrame;

/// Trait for all wake-word detector implementations.
///
/// Implementors are stateful (sliding windows, debounce timers) but expose
/// a simple per-frame `process` so the capture pipeline never needs to know
/// the backend's internal windowing scheme.
pub trait WakeWordDetector: Send + 'static {
    /// Feed one wake-word-length frame. Returns `true` exactly once per
    /// debounce window on detection; an empty frame never triggers.
    fn process(&mut self, frame: &AudioFrame) -> bool;

    /// Reset sliding windows and debounce state (called after a completed
    /// utterance returns the pipeline to `Waiting`).
    fn reset(&mut self);
}

/// Always-false detector — used when no neural backend is compiled in or
/// wake-word detection is driven externally via `wake()`.
pub struct NullWakeWordDetector;

impl WakeWordDetector for NullWakeWordDetector {
    fn process(&mut self, _frame: &AudioFrame) -> bool {
        false
    }

    fn reset(&mut self) {}
}
