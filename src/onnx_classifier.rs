use std::path::Path;
use std::sync::Mutex;

use log::info;
use ort::{
    session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session},
    value::Value,
};

use crate::error::ModelError;
use crate::model_inference::Classifier;
use crate::Label;

fn backend(e: impl std::fmt::Display) -> ModelError {
    ModelError::Backend(e.to_string())
}

/// Classifier exported to ONNX: output 0 holds the label, output 1 (when
/// present) the per-class probabilities.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    n_features: Option<usize>,
}

impl OnnxClassifier {
    pub fn new<P: AsRef<Path>>(model_path: P, n_features: Option<usize>) -> Result<Self, ModelError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(ModelError::Unavailable(model_path.to_path_buf()));
        }

        let session = SessionBuilder::new()
            .map_err(backend)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(backend)?
            .commit_from_file(model_path)
            .map_err(backend)?;

        info!(
            "ONNX model loaded from {} ({} inputs, {} outputs)",
            model_path.display(),
            session.inputs.len(),
            session.outputs.len()
        );

        Ok(Self {
            session: Mutex::new(session),
            n_features,
        })
    }

    fn check_dimension(&self, features: &[f64]) -> Result<(), ModelError> {
        match self.n_features {
            Some(expected) if expected != features.len() => Err(ModelError::DimensionMismatch {
                expected,
                got: features.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Runs one row and returns the label plus the manipulated-class
    /// probability when the graph emits one.
    fn run(&self, features: &[f64]) -> Result<(Label, Option<f64>), ModelError> {
        self.check_dimension(features)?;

        let data: Vec<f32> = features.iter().map(|&x| x as f32).collect();
        let input = Value::from_array((vec![1usize, features.len()], data)).map_err(backend)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| ModelError::Backend("session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![input]).map_err(backend)?;

        let label_value = if let Ok((_, data)) = outputs[0].try_extract_tensor::<i64>() {
            data.first().copied()
        } else if let Ok((_, data)) = outputs[0].try_extract_tensor::<f32>() {
            data.first().map(|v| v.round() as i64)
        } else {
            return Err(ModelError::Backend("unsupported label tensor type".into()));
        };
        let label = label_value
            .and_then(|v| u8::try_from(v).ok())
            .and_then(Label::from_u8)
            .ok_or_else(|| ModelError::Backend("label output is empty or out of range".into()))?;

        let probability = if outputs.len() > 1 {
            outputs[1]
                .try_extract_tensor::<f32>()
                .ok()
                .and_then(|(_, data)| data.get(1).map(|&p| p as f64))
        } else {
            None
        };

        Ok((label, probability))
    }
}

impl Classifier for OnnxClassifier {
    fn predict_label(&self, features: &[f64]) -> Result<Label, ModelError> {
        self.run(features).map(|(label, _)| label)
    }

    fn predict_probability(&self, features: &[f64]) -> Result<Option<f64>, ModelError> {
        self.run(features).map(|(_, probability)| probability)
    }

    fn input_dimension(&self) -> Option<usize> {
        self.n_features
    }
}
