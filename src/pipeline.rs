use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::forest::{ForestParams, RandomForest};
use crate::scaler::StandardScaler;

/// Standardisation followed by a random forest.
///
/// The scaler is fitted on the same rows as the forest, never on held-out data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaledForest {
    scaler: StandardScaler,
    forest: RandomForest,
}

impl ScaledForest {
    pub fn fit(x: ArrayView2<f64>, y: &[u8], params: &ForestParams) -> Result<Self, ModelError> {
        let scaler = StandardScaler::fit(x)?;
        let scaled = scaler.transform(x)?;
        let forest = RandomForest::fit(scaled.view(), y, params)?;
        Ok(Self { scaler, forest })
    }

    pub fn n_features(&self) -> usize {
        self.forest.n_features()
    }

    /// Uncalibrated probability of the manipulated class.
    pub fn predict_probability(&self, row: &[f64]) -> Result<f64, ModelError> {
        let scaled = self.scaler.transform_single(row)?;
        self.forest.predict_probability(&scaled)
    }

    pub fn predict_probabilities(&self, x: ArrayView2<f64>) -> Result<Vec<f64>, ModelError> {
        x.rows()
            .into_iter()
            .map(|row| self.predict_probability(&row.to_vec()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn pipeline_is_invariant_to_feature_scale() {
        let x = array![[1.0, 100.0], [2.0, 200.0], [8.0, 800.0], [9.0, 900.0]];
        let y = [0, 0, 1, 1];
        let params = ForestParams {
            n_estimators: 10,
            ..Default::default()
        };
        let model = ScaledForest::fit(x.view(), &y, &params).unwrap();

        assert_eq!(model.n_features(), 2);
        let probabilities = model.predict_probabilities(x.view()).unwrap();
        assert!(probabilities[0] < 0.5 && probabilities[1] < 0.5);
        assert!(probabilities[2] > 0.5 && probabilities[3] > 0.5);
    }
}
