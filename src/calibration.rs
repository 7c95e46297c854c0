//! Sigmoid (Platt) probability calibration over stratified folds.

use log::warn;
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::forest::ForestParams;
use crate::pipeline::ScaledForest;

/// Maps a raw score `f` to `1 / (1 + exp(a * f + b))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SigmoidCalibrator {
    pub a: f64,
    pub b: f64,
}

impl SigmoidCalibrator {
    /// Fits `a` and `b` by Newton's method with backtracking line search on
    /// the regularised targets of Platt (1999).
    pub fn fit(scores: &[f64], labels: &[u8]) -> Self {
        let prior1 = labels.iter().filter(|&&l| l == 1).count() as f64;
        let prior0 = labels.len() as f64 - prior1;

        let hi_target = (prior1 + 1.0) / (prior1 + 2.0);
        let lo_target = 1.0 / (prior0 + 2.0);
        let targets: Vec<f64> = labels
            .iter()
            .map(|&l| if l == 1 { hi_target } else { lo_target })
            .collect();

        let objective = |a: f64, b: f64| -> f64 {
            scores
                .iter()
                .zip(&targets)
                .map(|(&f, &t)| {
                    let z = f * a + b;
                    if z >= 0.0 {
                        t * z + (-z).exp().ln_1p()
                    } else {
                        (t - 1.0) * z + z.exp().ln_1p()
                    }
                })
                .sum()
        };

        const MAX_ITER: usize = 100;
        const MIN_STEP: f64 = 1e-10;
        const SIGMA: f64 = 1e-12;
        const EPS: f64 = 1e-5;

        let mut a = 0.0;
        let mut b = ((prior0 + 1.0) / (prior1 + 1.0)).ln();
        let mut fval = objective(a, b);

        for _ in 0..MAX_ITER {
            let (mut h11, mut h22, mut h21) = (SIGMA, SIGMA, 0.0);
            let (mut g1, mut g2) = (0.0, 0.0);
            for (&f, &t) in scores.iter().zip(&targets) {
                let z = f * a + b;
                let (p, q) = if z >= 0.0 {
                    let e = (-z).exp();
                    (e / (1.0 + e), 1.0 / (1.0 + e))
                } else {
                    let e = z.exp();
                    (1.0 / (1.0 + e), e / (1.0 + e))
                };
                let d2 = p * q;
                h11 += f * f * d2;
                h22 += d2;
                h21 += f * d2;
                let d1 = t - p;
                g1 += f * d1;
                g2 += d1;
            }

            if g1.abs() < EPS && g2.abs() < EPS {
                break;
            }

            let det = h11 * h22 - h21 * h21;
            let da = -(h22 * g1 - h21 * g2) / det;
            let db = -(-h21 * g1 + h11 * g2) / det;
            let gd = g1 * da + g2 * db;

            let mut step = 1.0;
            while step >= MIN_STEP {
                let (new_a, new_b) = (a + step * da, b + step * db);
                let new_f = objective(new_a, new_b);
                if new_f < fval + 1e-4 * step * gd {
                    a = new_a;
                    b = new_b;
                    fval = new_f;
                    break;
                }
                step /= 2.0;
            }

            if step < MIN_STEP {
                break;
            }
        }

        Self { a, b }
    }

    pub fn apply(&self, score: f64) -> f64 {
        let z = self.a * score + self.b;
        // Evaluate on the side that cannot overflow
        if z >= 0.0 {
            let e = (-z).exp();
            e / (1.0 + e)
        } else {
            1.0 / (1.0 + z.exp())
        }
    }
}

/// One fold's estimator together with the sigmoid fitted on its held-out rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedMember {
    estimator: ScaledForest,
    calibrator: SigmoidCalibrator,
}

/// Average of fold-wise calibrated [`ScaledForest`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedClassifier {
    members: Vec<CalibratedMember>,
    n_features: usize,
}

/// Assigns each row to one of `k` folds, spreading every class evenly.
pub fn stratified_folds(labels: &[u8], k: usize) -> Vec<usize> {
    let mut seen = [0usize; 2];
    labels
        .iter()
        .map(|&l| {
            let class = usize::from(l == 1);
            let fold = seen[class] % k;
            seen[class] += 1;
            fold
        })
        .collect()
}

impl CalibratedClassifier {
    pub fn fit(
        x: ArrayView2<f64>,
        y: &[u8],
        params: &ForestParams,
        folds: usize,
    ) -> Result<Self, ModelError> {
        let n = x.nrows();
        if n == 0 || n != y.len() {
            return Err(ModelError::EmptyTrainingSet);
        }

        let folds = folds.min(n);
        if folds < 2 {
            warn!(
                "Only {} training sample(s); calibrating on in-sample predictions",
                n
            );
            return Self::fit_in_sample(x, y, params);
        }

        let assignment = stratified_folds(y, folds);
        let mut members = Vec::with_capacity(folds);

        for fold in 0..folds {
            let (train, held_out): (Vec<usize>, Vec<usize>) =
                (0..n).partition(|&i| assignment[i] != fold);
            // Small classes can leave a fold with nothing to fit or nothing to score
            if train.is_empty() || held_out.is_empty() {
                continue;
            }

            let x_train = select_rows(x, &train);
            let y_train: Vec<u8> = train.iter().map(|&i| y[i]).collect();
            let x_held = select_rows(x, &held_out);
            let y_held: Vec<u8> = held_out.iter().map(|&i| y[i]).collect();

            let estimator = ScaledForest::fit(x_train.view(), &y_train, params)?;
            let scores = estimator.predict_probabilities(x_held.view())?;
            let calibrator = SigmoidCalibrator::fit(&scores, &y_held);

            members.push(CalibratedMember {
                estimator,
                calibrator,
            });
        }

        if members.is_empty() {
            warn!(
                "No usable calibration fold among {} samples; calibrating on in-sample predictions",
                n
            );
            return Self::fit_in_sample(x, y, params);
        }

        Ok(Self {
            members,
            n_features: x.ncols(),
        })
    }

    fn fit_in_sample(
        x: ArrayView2<f64>,
        y: &[u8],
        params: &ForestParams,
    ) -> Result<Self, ModelError> {
        let estimator = ScaledForest::fit(x, y, params)?;
        let scores = estimator.predict_probabilities(x)?;
        let calibrator = SigmoidCalibrator::fit(&scores, y);
        Ok(Self {
            members: vec![CalibratedMember {
                estimator,
                calibrator,
            }],
            n_features: x.ncols(),
        })
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_members(&self) -> usize {
        self.members.len()
    }

    /// Calibrated probability of the manipulated class.
    pub fn predict_probability(&self, row: &[f64]) -> Result<f64, ModelError> {
        let mut total = 0.0;
        for member in &self.members {
            let score = member.estimator.predict_probability(row)?;
            total += member.calibrator.apply(score);
        }
        Ok(total / self.members.len() as f64)
    }
}

pub(crate) fn select_rows(x: ArrayView2<f64>, rows: &[usize]) -> Array2<f64> {
    x.select(Axis(0), rows)
}
