use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::FeatureExtractionError;

/// Analysis settings shared by training and inference.
///
/// Every framing constant a DSP backend needs to reproduce the feature
/// layout lives here, and the whole struct is stored in the model artifact
/// so a served model is always paired with the settings it was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Decode/resample target in Hz.
    pub sample_rate: u32,
    /// Cepstral coefficients per frame.
    pub n_mfcc: usize,
    /// FFT size, also the analysis window length.
    pub n_fft: usize,
    /// Samples between successive frames.
    pub hop_length: usize,
    /// Mel filters feeding the cepstrum.
    pub n_mels: usize,
    /// Dynamic range kept in the log-mel spectrogram.
    pub top_db_mel: f64,
    /// Savitzky-Golay window for the derivative matrices (odd, >= 3).
    pub delta_width: usize,
    pub n_chroma: usize,
    /// Chroma tuning offset in fractional bins.
    pub tuning: f64,
    pub rolloff_percent: f64,
    /// Frames quieter than this many dB under the peak are trimmed at the edges.
    pub trim_top_db: f64,
    pub trim_frame_length: usize,
    pub trim_hop_length: usize,
    /// Shorter clips are zero-padded on the right up to this duration.
    pub min_duration_secs: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            n_mfcc: 20,
            n_fft: 2048,
            hop_length: 512,
            n_mels: 128,
            top_db_mel: 80.0,
            delta_width: 9,
            n_chroma: 12,
            tuning: 0.0,
            rolloff_percent: 0.85,
            trim_top_db: 30.0,
            trim_frame_length: 2048,
            trim_hop_length: 512,
            min_duration_secs: 0.5,
        }
    }
}

impl FeatureConfig {
    /// Length of the vector produced by the extractor.
    ///
    /// Three cepstral matrices contribute mean and std per coefficient,
    /// chroma contributes one mean per bin, then five scalars.
    pub fn dimension(&self) -> usize {
        3 * 2 * self.n_mfcc + self.n_chroma + 5
    }

    /// Minimum clip length in samples after silence trimming.
    pub fn min_samples(&self) -> usize {
        (self.sample_rate as f64 * self.min_duration_secs) as usize
    }

    pub fn validate(&self) -> Result<(), FeatureExtractionError> {
        let fail = |msg: &str| Err(FeatureExtractionError::InvalidConfig(msg.to_string()));
        if self.sample_rate == 0 {
            return fail("sample_rate must be positive");
        }
        if self.n_mfcc == 0 || self.n_mfcc > self.n_mels {
            return fail("n_mfcc must be in 1..=n_mels");
        }
        if self.n_fft < 2 || self.hop_length == 0 {
            return fail("n_fft must be >= 2 and hop_length > 0");
        }
        if self.delta_width < 3 || self.delta_width % 2 == 0 {
            return fail("delta_width must be odd and >= 3");
        }
        if self.n_chroma == 0 {
            return fail("n_chroma must be positive");
        }
        if self.trim_frame_length == 0 || self.trim_hop_length == 0 {
            return fail("trim framing must be positive");
        }
        if !(0.0..=1.0).contains(&self.rolloff_percent) {
            return fail("rolloff_percent must be within [0, 1]");
        }
        Ok(())
    }
}

/// Hyper-parameters of the training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub real_dir: PathBuf,
    pub fake_dir: PathBuf,
    /// Fraction of the dataset held out for evaluation.
    pub test_fraction: f64,
    pub seed: u64,
    pub n_estimators: usize,
    /// `None` grows trees until leaves are pure.
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Folds used for probability calibration.
    pub calibration_folds: usize,
    pub extensions: Vec<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            real_dir: PathBuf::from("dataset/real"),
            fake_dir: PathBuf::from("dataset/fake"),
            test_fraction: 0.2,
            seed: 42,
            n_estimators: 200,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            calibration_folds: 3,
            extensions: vec!["wav".into(), "mp3".into(), "m4a".into()],
        }
    }
}

/// Upload server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub upload_dir: PathBuf,
    pub max_upload_mb: usize,
    pub cleanup_after_hours: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            upload_dir: PathBuf::from("uploads"),
            max_upload_mb: 10,
            cleanup_after_hours: 6,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model_path: ModelPath,
    pub features: FeatureConfig,
    pub training: TrainingConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelPath(pub PathBuf);

impl Default for ModelPath {
    fn default() -> Self {
        Self(PathBuf::from("ai/voice_model.json"))
    }
}

impl AppConfig {
    /// Reads a TOML config file; absent sections and fields keep their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.features.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dimension_is_137() {
        assert_eq!(FeatureConfig::default().dimension(), 137);
    }

    #[test]
    fn dimension_follows_mfcc_count() {
        let config = FeatureConfig {
            n_mfcc: 13,
            ..Default::default()
        };
        assert_eq!(config.dimension(), 78 + 12 + 5);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            model_path = "models/m.json"

            [features]
            n_mfcc = 13

            [server]
            max_upload_mb = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.model_path.0, PathBuf::from("models/m.json"));
        assert_eq!(config.features.n_mfcc, 13);
        assert_eq!(config.features.n_fft, 2048);
        assert_eq!(config.server.max_upload_mb, 4);
        assert_eq!(config.training.n_estimators, 200);
    }

    #[test]
    fn rejects_even_delta_width() {
        let config = FeatureConfig {
            delta_width: 8,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FeatureExtractionError::InvalidConfig(_))
        ));
    }
}
