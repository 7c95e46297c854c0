pub mod audio_processor;
pub mod augment;
pub mod calibration;
pub mod config;
pub mod error;
pub mod feature_extractor;
pub mod forest;
pub mod inference;
pub mod metrics;
pub mod model_inference;
#[cfg(feature = "onnx")]
pub mod onnx_classifier;
pub mod pipeline;
pub mod scaler;
pub mod server;
pub mod spectral;
pub mod training;
pub mod uploads;

use serde::{Deserialize, Serialize};

pub use audio_processor::{AudioProcessor, AudioSignal};
pub use augment::FakeGenerator;
pub use calibration::CalibratedClassifier;
pub use config::{AppConfig, FeatureConfig};
pub use error::{FeatureExtractionError, ModelError, TrainingError};
pub use feature_extractor::{FeatureExtractor, FeatureVector};
pub use inference::{ClassificationOutcome, InferenceService, Verdict};
pub use model_inference::{Classifier, ModelArtifact};
#[cfg(feature = "onnx")]
pub use onnx_classifier::OnnxClassifier;
pub use scaler::StandardScaler;
pub use training::TrainingPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Original = 0,
    Manipulated = 1,
}

impl Label {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Label::Original),
            1 => Some(Label::Manipulated),
            _ => None,
        }
    }

    /// `Manipulated` at or above 0.5.
    pub fn from_probability(probability: f64) -> Self {
        if probability >= 0.5 {
            Label::Manipulated
        } else {
            Label::Original
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Original => "original",
            Label::Manipulated => "manipulated",
        }
    }
}

pub type Result<T> = anyhow::Result<T>;
