//! Owned audio frame passed from the ring buffer through the capture pipeline.

/// A contiguous block of mono PCM samples at a known sample rate.
///
/// Move-only: producers move a frame into the event bus, consumers take
/// ownership, and the backing buffer is released exactly once at
/// consumption. An empty frame (`is_empty()`) is the sentinel for a short
/// device read and never advances pipeline state.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 16000, 44100, 48000).
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// An empty sentinel frame — the result of a short device read.
    pub fn empty(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
        }
    }

    /// Returns the duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Returns true if the frame contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Convert to raw 16-bit little-endian PCM, the wire format the STT
    /// session sends over its binary channel.
    pub fn to_pcm16(&self) -> Vec<i16> {
        self.samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect()
    }
}
