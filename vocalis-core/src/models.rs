//! Platform default location for downloaded ONNX model assets (wake-word
//! and Silero VAD weights).

use std::path::PathBuf;

pub fn default_models_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(|p| {
                PathBuf::from(p)
                    .join("Lattice Labs")
                    .join("Vocalis")
                    .join("models")
            })
            .unwrap_or_else(|| PathBuf::from("models"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("vocalis")
            .join("models")
    }
}
