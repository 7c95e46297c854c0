use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Per-dimension standardisation to zero mean and unit variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl StandardScaler {
    /// Learns mean and population standard deviation of every column.
    /// Constant columns get a scale of 1 so they map to zero.
    pub fn fit(x: ArrayView2<f64>) -> Result<Self, ModelError> {
        let mean = x.mean_axis(Axis(0)).ok_or(ModelError::EmptyTrainingSet)?;
        let std = x.std_axis(Axis(0), 0.0);

        let scale = std
            .iter()
            .map(|&s| if s < 10.0 * f64::EPSILON { 1.0 } else { s })
            .collect();

        Ok(Self {
            mean: mean.to_vec(),
            scale,
        })
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        self.check_dimension(x.ncols())?;
        let mut out = x.to_owned();
        for mut row in out.rows_mut() {
            for ((value, mean), scale) in row.iter_mut().zip(&self.mean).zip(&self.scale) {
                *value = (*value - mean) / scale;
            }
        }
        Ok(out)
    }

    pub fn transform_single(&self, features: &[f64]) -> Result<Vec<f64>, ModelError> {
        self.check_dimension(features.len())?;
        Ok(features
            .iter()
            .zip(&self.mean)
            .zip(&self.scale)
            .map(|((value, mean), scale)| (value - mean) / scale)
            .collect())
    }

    fn check_dimension(&self, got: usize) -> Result<(), ModelError> {
        if got != self.dimension() {
            return Err(ModelError::DimensionMismatch {
                expected: self.dimension(),
                got,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn standardises_columns() {
        let x = array![[1.0, 10.0, 5.0], [3.0, 20.0, 5.0], [5.0, 30.0, 5.0]];
        let scaler = StandardScaler::fit(x.view()).unwrap();
        let scaled = scaler.transform(x.view()).unwrap();

        for column in scaled.columns().into_iter().take(2) {
            assert!(column.mean().unwrap().abs() < 1e-12);
            assert!((column.std(0.0) - 1.0).abs() < 1e-12);
        }
        // Constant column maps to zero instead of dividing by zero
        assert!(scaled.column(2).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn single_row_matches_batch() {
        let x = array![[1.0, 2.0], [3.0, 6.0]];
        let scaler = StandardScaler::fit(x.view()).unwrap();
        let batch = scaler.transform(x.view()).unwrap();
        let single = scaler.transform_single(&[3.0, 6.0]).unwrap();
        assert_eq!(single, batch.row(1).to_vec());
    }

    #[test]
    fn rejects_wrong_dimension() {
        let scaler = StandardScaler::fit(array![[1.0, 2.0], [2.0, 3.0]].view()).unwrap();
        assert!(matches!(
            scaler.transform_single(&[1.0]),
            Err(ModelError::DimensionMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn fitting_zero_rows_fails() {
        let empty = Array2::<f64>::zeros((0, 3));
        assert!(matches!(
            StandardScaler::fit(empty.view()),
            Err(ModelError::EmptyTrainingSet)
        ));
    }
}
