//! Narrow interface towards the bundled acoustic echo cancellation /
//! denoise library. Given a mic frame and a reference frame of what the
//! speaker is currently playing, produces a cleaned frame. The concrete
//! backend (a wrapped C AEC/denoise library) is an external collaborator;
//! this trait is the only thing the capture pipeline depends on.

/// Cancels the known playback signal out of a captured mic frame.
pub trait EchoCanceller: Send + 'static {
    /// `mic` and `reference` are equal-length frames of the same sample
    /// rate. Returns the cleaned mic signal, denoised and dereverbed.
    fn cancel(&mut self, mic: &[f32], reference: &[f32]) -> Vec<f32>;
}

/// Pass-through canceller used when `ec_enabled=false` or no real backend
/// is linked in — returns the mic signal unmodified.
pub struct NullEchoCanceller;

impl EchoCanceller for NullEchoCanceller {
    fn cancel(&mut self, mic: &[f32], _reference: &[f32]) -> Vec<f32> {
        mic.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_canceller_passes_mic_through_unchanged() {
        let mut ec = NullEchoCanceller;
        let mic = vec![0.1, 0.2, -0.3];
        let reference = vec![0.5, 0.5, 0.5];
        assert_eq!(ec.cancel(&mic, &reference), mic);
    }
}
