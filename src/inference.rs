use std::fmt;
use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::FeatureConfig;
use crate::error::ModelError;
use crate::feature_extractor::FeatureExtractor;
use crate::model_inference::{Classifier, ModelArtifact};
#[cfg(feature = "onnx")]
use crate::onnx_classifier::OnnxClassifier;
use crate::Label;

pub const NO_MODEL_MESSAGE: &str = "No model found. Please run training first";

/// Labelled, confidence-scored prediction for one clip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub label: Label,
    /// Percentage in `[0, 100]`.
    pub confidence: f64,
    pub raw_probability: f64,
}

impl Verdict {
    pub fn from_probability(probability: f64) -> Self {
        let label = Label::from_probability(probability);
        let confidence = match label {
            Label::Manipulated => probability * 100.0,
            Label::Original => (1.0 - probability) * 100.0,
        };
        Self {
            label,
            confidence,
            raw_probability: probability,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.label {
            Label::Original => "Original",
            Label::Manipulated => "Manipulated",
        };
        write!(f, "{} (Confidence: {:.2}%)", name, self.confidence)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClassificationOutcome {
    Classified(Verdict),
    NoModel { message: String },
    Failed { message: String },
}

impl fmt::Display for ClassificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassificationOutcome::Classified(verdict) => write!(f, "{}", verdict),
            ClassificationOutcome::NoModel { message } => f.write_str(message),
            ClassificationOutcome::Failed { message } => write!(f, "Error: {}", message),
        }
    }
}

/// Feature extraction paired with an optional, read-only model.
///
/// The model is loaded once and shared by every request; a service without
/// a model still answers, with [`ClassificationOutcome::NoModel`].
pub struct InferenceService {
    extractor: FeatureExtractor,
    model: Option<Arc<dyn Classifier>>,
}

impl InferenceService {
    pub fn new(
        extractor: FeatureExtractor,
        model: Option<Arc<dyn Classifier>>,
    ) -> Result<Self, ModelError> {
        if let Some(expected) = model.as_ref().and_then(|m| m.input_dimension()) {
            if expected != extractor.dimension() {
                return Err(ModelError::DimensionMismatch {
                    expected,
                    got: extractor.dimension(),
                });
            }
        }
        Ok(Self { extractor, model })
    }

    /// Loads the model at `path`.
    ///
    /// A `.onnx` path selects the ONNX backend (cargo feature `onnx`) with
    /// `fallback` feature settings. Anything else is read as a
    /// [`ModelArtifact`] and paired with the feature settings it was trained
    /// on. A missing file yields a service without a model and `fallback`
    /// settings; any other load failure is returned.
    pub fn from_artifact<P: AsRef<Path>>(
        path: P,
        fallback: FeatureConfig,
    ) -> Result<Self, ModelError> {
        let path = path.as_ref();
        if is_onnx_path(path) {
            return Self::from_onnx(path, fallback);
        }

        match ModelArtifact::load(path) {
            Ok(artifact) => {
                let extractor = build_extractor(artifact.features.clone())?;
                Self::new(extractor, Some(Arc::new(artifact)))
            }
            Err(ModelError::Unavailable(_)) => Self::without_model(path, fallback),
            Err(e) => Err(e),
        }
    }

    #[cfg(feature = "onnx")]
    fn from_onnx(path: &Path, features: FeatureConfig) -> Result<Self, ModelError> {
        let extractor = build_extractor(features)?;
        match OnnxClassifier::new(path, Some(extractor.dimension())) {
            Ok(classifier) => Self::new(extractor, Some(Arc::new(classifier))),
            Err(ModelError::Unavailable(_)) => Ok(Self::no_model_warning(path, extractor)),
            Err(e) => Err(e),
        }
    }

    #[cfg(not(feature = "onnx"))]
    fn from_onnx(path: &Path, _features: FeatureConfig) -> Result<Self, ModelError> {
        Err(ModelError::Backend(format!(
            "{} is an ONNX model but this build has no `onnx` feature",
            path.display()
        )))
    }

    fn without_model(path: &Path, features: FeatureConfig) -> Result<Self, ModelError> {
        Ok(Self::no_model_warning(path, build_extractor(features)?))
    }

    fn no_model_warning(path: &Path, extractor: FeatureExtractor) -> Self {
        warn!("No model at {}; serving without one", path.display());
        Self {
            extractor,
            model: None,
        }
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// Classifies one file. Never fails: every error becomes
    /// [`ClassificationOutcome::Failed`].
    pub fn classify<P: AsRef<Path>>(&self, path: P) -> ClassificationOutcome {
        let path = path.as_ref();
        let features = match self.extractor.extract(path) {
            Ok(features) => features,
            Err(e) => return self.failed(path, &e),
        };

        let Some(model) = &self.model else {
            return ClassificationOutcome::NoModel {
                message: NO_MODEL_MESSAGE.to_string(),
            };
        };

        match self.predict(model.as_ref(), features.as_slice()) {
            Ok(verdict) => {
                info!("{}: {}", path.display(), verdict);
                ClassificationOutcome::Classified(verdict)
            }
            Err(e) => self.failed(path, &e),
        }
    }

    fn predict(&self, model: &dyn Classifier, features: &[f64]) -> Result<Verdict, ModelError> {
        let probability = match model.predict_probability(features)? {
            Some(p) => p,
            None => match model.predict_label(features)? {
                Label::Manipulated => 1.0,
                Label::Original => 0.0,
            },
        };
        Ok(Verdict::from_probability(probability))
    }

    fn failed(&self, path: &Path, e: &dyn std::error::Error) -> ClassificationOutcome {
        error!("Classification of {} failed: {}", path.display(), e);
        ClassificationOutcome::Failed {
            message: e.to_string(),
        }
    }
}

fn is_onnx_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"))
}

fn build_extractor(features: FeatureConfig) -> Result<FeatureExtractor, ModelError> {
    FeatureExtractor::new(features).map_err(|e| ModelError::Backend(e.to_string()))
}
