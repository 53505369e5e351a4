//! Three-stage neural wake-word detector: melspectrogram → embedding →
//! wake-word confidence, in the OpenWakeWord architecture. Each stage is a
//! separate ONNX session; sliding windows accumulate context across frame
//! boundaries so detection is continuous, not chunked.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ndarray::{Array2, Array3};
use ort::session::builder::SessionBuilder;
use ort::session::Session;
use ort::value::Value;
use tracing::{info, warn};

use super::WakeWordDetector;
use crate::buffering::chunk::AudioFrame;
use crate::error::{Result, VocalisError};
use crate::models::default_models_dir;

/// Frames of mel output retained for one embedding inference (~1.5 s context).
const EMBEDDING_CONTEXT_FRAMES: usize = 76;
/// Number of embeddings retained for one wake-word inference (~1.28 s context).
const WAKEWORD_WINDOW: usize = 16;
/// Mel bins per mel frame.
const MEL_BINS: usize = 32;
/// Embedding feature width.
const EMBEDDING_DIM: usize = 96;

#[derive(Debug, Clone)]
pub struct NeuralWakeWordConfig {
    pub melspectrogram_model_path: PathBuf,
    pub embedding_model_path: PathBuf,
    pub wakeword_model_path: PathBuf,
    /// Detection threshold in [0, 1] — derived from `wakeword.sensitivity`.
    pub confidence_threshold: f32,
    /// Minimum time between two accepted detections.
    pub debounce: Duration,
    /// Run the embedding model once every `embedding_skip_rate` mel frames;
    /// skipped frames still feed the mel accumulator, only the (expensive)
    /// embedding inference cadence is reduced.
    pub embedding_skip_rate: usize,
}

impl NeuralWakeWordConfig {
    pub fn from_sensitivity(sensitivity: f32) -> Self {
        let dir = default_models_dir();
        Self {
            melspectrogram_model_path: dir.join("melspectrogram.onnx"),
            embedding_model_path: dir.join("embedding.onnx"),
            wakeword_model_path: dir.join("wakeword.onnx"),
            confidence_threshold: sensitivity.clamp(0.01, 0.99),
            debounce: Duration::from_millis(1000),
            embedding_skip_rate: 2,
        }
    }
}

/// OpenWakeWord-style three-stage detector.
pub struct NeuralWakeWordDetector {
    melspectrogram: Session,
    embedding: Session,
    wakeword: Session,
    config: NeuralWakeWordConfig,

    melspec_accumulator: VecDeque<Vec<f32>>,
    embedding_window: VecDeque<Vec<f32>>,
    frame_counter: usize,
    last_detection: Option<Instant>,
}

impl NeuralWakeWordDetector {
    pub fn new(config: NeuralWakeWordConfig) -> Result<Self> {
        let melspectrogram = load_session(&config.melspectrogram_model_path)?;
        let embedding = load_session(&config.embedding_model_path)?;
        let wakeword = load_session(&config.wakeword_model_path)?;

        info!(
            threshold = config.confidence_threshold,
            debounce_ms = config.debounce.as_millis(),
            "neural wake-word detector ready"
        );

        Ok(Self {
            melspectrogram,
            embedding,
            wakeword,
            config,
            melspec_accumulator: VecDeque::with_capacity(WAKEWORD_WINDOW),
            embedding_window: VecDeque::with_capacity(WAKEWORD_WINDOW),
            frame_counter: 0,
            last_detection: None,
        })
    }

    fn run_melspectrogram(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let arr = Array2::<f32>::from_shape_vec((1, samples.len()), samples.to_vec())
            .map_err(|e| VocalisError::OnnxSession(e.to_string()))?;
        let input = Value::from_array(arr).map_err(|e: ort::Error| VocalisError::OnnxSession(e.to_string()))?;
        let input_name = first_input_name(&self.melspectrogram)?;
        let outputs = self
            .melspectrogram
            .run(vec![(input_name, input.into())])
            .map_err(|e| VocalisError::OnnxSession(e.to_string()))?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VocalisError::OnnxSession(e.to_string()))?;
        Ok(data.to_vec())
    }

    fn run_embedding(&mut self, mel_frames: &[f32]) -> Result<Vec<f32>> {
        let arr = Array2::<f32>::from_shape_vec(
            (EMBEDDING_CONTEXT_FRAMES, MEL_BINS),
            mel_frames.to_vec(),
        )
        .map_err(|e| VocalisError::OnnxSession(e.to_string()))?;
        let input = Value::from_array(arr).map_err(|e: ort::Error| VocalisError::OnnxSession(e.to_string()))?;
        let input_name = first_input_name(&self.embedding)?;
        let outputs = self
            .embedding
            .run(vec![(input_name, input.into())])
            .map_err(|e| VocalisError::OnnxSession(e.to_string()))?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VocalisError::OnnxSession(e.to_string()))?;
        Ok(data.to_vec())
    }

    fn run_wakeword(&mut self) -> Result<f32> {
        let mut flat = Vec::with_capacity(WAKEWORD_WINDOW * EMBEDDING_DIM);
        for e in &self.embedding_window {
            flat.extend_from_slice(e);
        }
        let arr = Array3::<f32>::from_shape_vec((1, WAKEWORD_WINDOW, EMBEDDING_DIM), flat)
            .map_err(|e| VocalisError::OnnxSession(e.to_string()))?;
        let input = Value::from_array(arr).map_err(|e: ort::Error| VocalisError::OnnxSession(e.to_string()))?;
        let input_name = first_input_name(&self.wakeword)?;
        let outputs = self
            .wakeword
            .run(vec![(input_name, input.into())])
            .map_err(|e| VocalisError::OnnxSession(e.to_string()))?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VocalisError::OnnxSession(e.to_string()))?;
        Ok(data.first().copied().unwrap_or(0.0))
    }
}

fn load_session(path: &Path) -> Result<Session> {
    if !path.exists() {
        return Err(VocalisError::ModelNotFound {
            path: path.to_path_buf(),
        });
    }
    SessionBuilder::new()
        .map_err(|e| VocalisError::OnnxSession(e.to_string()))?
        .commit_from_file(path)
        .map_err(|e| VocalisError::OnnxSession(e.to_string()))
}

fn first_input_name(session: &Session) -> Result<String> {
    session
        .inputs()
        .first()
        .map(|outlet| outlet.name().to_string())
        .ok_or_else(|| VocalisError::OnnxSession("model has no inputs".into()))
}

impl WakeWordDetector for NeuralWakeWordDetector {
    fn process(&mut self, frame: &AudioFrame) -> bool {
        if frame.is_empty() {
            return false;
        }

        if let Some(last) = self.last_detection {
            if last.elapsed() < self.config.debounce {
                return false;
            }
        }

        let mel = match self.run_melspectrogram(&frame.samples) {
            Ok(m) => m,
            Err(e) => {
                warn!("melspectrogram inference failed: {e}");
                return false;
            }
        };
        self.melspec_accumulator.push_back(mel);
        while self.melspec_accumulator.len() > WAKEWORD_WINDOW {
            self.melspec_accumulator.pop_front();
        }

        self.frame_counter += 1;
        if self.frame_counter % self.config.embedding_skip_rate != 0 {
            return false;
        }

        let available: usize = self
            .melspec_accumulator
            .iter()
            .map(|f| f.len() / MEL_BINS)
            .sum();
        if available < EMBEDDING_CONTEXT_FRAMES {
            return false;
        }

        let mut flattened: Vec<f32> = self
            .melspec_accumulator
            .iter()
            .flat_map(|f| f.iter().copied())
            .collect();
        let keep = EMBEDDING_CONTEXT_FRAMES * MEL_BINS;
        if flattened.len() > keep {
            flattened.drain(..flattened.len() - keep);
        }

        let embedding = match self.run_embedding(&flattened) {
            Ok(e) => e,
            Err(e) => {
                warn!("embedding inference failed: {e}");
                return false;
            }
        };
        self.embedding_window.push_back(embedding);
        while self.embedding_window.len() > WAKEWORD_WINDOW {
            self.embedding_window.pop_front();
        }

        if self.embedding_window.len() < WAKEWORD_WINDOW {
            return false;
        }

        match self.run_wakeword() {
            Ok(confidence) if confidence >= self.config.confidence_threshold => {
                self.last_detection = Some(Instant::now());
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("wakeword inference failed: {e}");
                false
            }
        }
    }

    fn reset(&mut self) {
        self.melspec_accumulator.clear();
        self.embedding_window.clear();
        self.frame_counter = 0;
        self.last_detection = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitivity_clamps_into_open_unit_interval() {
        let low = NeuralWakeWordConfig::from_sensitivity(-1.0);
        let high = NeuralWakeWordConfig::from_sensitivity(5.0);
        assert_eq!(low.confidence_threshold, 0.01);
        assert_eq!(high.confidence_threshold, 0.99);
    }

    #[test]
    fn default_config_points_at_models_dir() {
        let cfg = NeuralWakeWordConfig::from_sensitivity(0.5);
        assert!(cfg
            .melspectrogram_model_path
            .ends_with("melspectrogram.onnx"));
        assert!(cfg.embedding_model_path.ends_with("embedding.onnx"));
        assert!(cfg.wakeword_model_path.ends_with("wakeword.onnx"));
    }

    #[test]
    fn missing_model_file_reports_not_found() {
        let err = load_session(Path::new("/nonexistent/does-not-exist.onnx")).unwrap_err();
        assert!(matches!(err, VocalisError::ModelNotFound { .. }));
    }
}
