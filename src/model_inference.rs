use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::calibration::CalibratedClassifier;
use crate::config::FeatureConfig;
use crate::error::ModelError;
use crate::Label;

/// Bumped whenever the on-disk layout of [`ModelArtifact`] changes.
pub const ARTIFACT_VERSION: u32 = 1;

/// Anything that can turn a feature vector into a verdict.
///
/// Implementations must be shareable across request handlers.
pub trait Classifier: Send + Sync {
    fn predict_label(&self, features: &[f64]) -> Result<Label, ModelError>;

    /// Probability of [`Label::Manipulated`], when the backend exposes one.
    fn predict_probability(&self, _features: &[f64]) -> Result<Option<f64>, ModelError> {
        Ok(None)
    }

    /// Expected feature count, when known.
    fn input_dimension(&self) -> Option<usize> {
        None
    }
}

/// A trained classifier together with the feature settings it was fitted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub features: FeatureConfig,
    pub classifier: CalibratedClassifier,
}

impl ModelArtifact {
    pub fn new(features: FeatureConfig, classifier: CalibratedClassifier) -> Self {
        Self {
            version: ARTIFACT_VERSION,
            created_at: Utc::now(),
            features,
            classifier,
        }
    }

    /// Writes the artifact as JSON, replacing any previous file only once
    /// the new one is fully written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let json = serde_json::to_vec(self)?;
        let tmp = tmp_path(path);
        fs::write(&tmp, json).map_err(io_error(&tmp))?;
        fs::rename(&tmp, path).map_err(io_error(path))?;

        info!("Model saved to {}", path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ModelError::Unavailable(path.to_path_buf()))
            }
            Err(source) => {
                return Err(ModelError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let artifact: Self = serde_json::from_slice(&bytes)?;
        if artifact.version != ARTIFACT_VERSION {
            return Err(ModelError::UnsupportedVersion(artifact.version));
        }
        let expected = artifact.features.dimension();
        if artifact.classifier.n_features() != expected {
            return Err(ModelError::DimensionMismatch {
                expected,
                got: artifact.classifier.n_features(),
            });
        }

        info!(
            "Model loaded from {} (trained {})",
            path.display(),
            artifact.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        Ok(artifact)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ModelError {
    let path = path.to_path_buf();
    move |source| ModelError::Io { path, source }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

impl Classifier for ModelArtifact {
    fn predict_label(&self, features: &[f64]) -> Result<Label, ModelError> {
        let p = self.classifier.predict_probability(features)?;
        Ok(Label::from_probability(p))
    }

    fn predict_probability(&self, features: &[f64]) -> Result<Option<f64>, ModelError> {
        self.classifier.predict_probability(features).map(Some)
    }

    fn input_dimension(&self) -> Option<usize> {
        Some(self.classifier.n_features())
    }
}
