//! Random forest of CART trees for binary labels.

use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Leaf {
        probability: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

struct TreeBuilder<'a> {
    x: ArrayView2<'a, f64>,
    y: &'a [u8],
    params: &'a ForestParams,
    max_features: usize,
    nodes: Vec<Node>,
}

fn gini(positives: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let p = positives as f64 / total as f64;
    2.0 * p * (1.0 - p)
}

impl TreeBuilder<'_> {
    fn build(&mut self, indices: &mut [usize], depth: usize, rng: &mut StdRng) -> usize {
        let n = indices.len();
        let positives = indices.iter().filter(|&&i| self.y[i] == 1).count();

        let node_id = self.nodes.len();
        self.nodes.push(Node::Leaf {
            probability: positives as f64 / n as f64,
        });

        let pure = positives == 0 || positives == n;
        let too_deep = self.params.max_depth.is_some_and(|max| depth >= max);
        if pure
            || too_deep
            || n < self.params.min_samples_split
            || n < 2 * self.params.min_samples_leaf
        {
            return node_id;
        }

        let Some(split) = self.best_split(indices, rng) else {
            return node_id;
        };

        let mut mid = 0;
        for i in 0..n {
            if self.x[[indices[i], split.feature]] <= split.threshold {
                indices.swap(i, mid);
                mid += 1;
            }
        }

        let (left_indices, right_indices) = indices.split_at_mut(mid);
        let left = self.build(left_indices, depth + 1, rng);
        let right = self.build(right_indices, depth + 1, rng);
        self.nodes[node_id] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };

        node_id
    }

    /// Visits features in random order until `max_features` non-constant
    /// ones have been scored, then returns the lowest weighted Gini split.
    fn best_split(&self, indices: &[usize], rng: &mut StdRng) -> Option<SplitCandidate> {
        let n = indices.len();
        let min_leaf = self.params.min_samples_leaf.max(1);

        let mut features: Vec<usize> = (0..self.x.ncols()).collect();
        features.shuffle(rng);

        let mut best: Option<SplitCandidate> = None;
        let mut visited = 0;
        let mut column: Vec<(f64, u8)> = Vec::with_capacity(n);

        for feature in features {
            if visited >= self.max_features {
                break;
            }

            column.clear();
            column.extend(indices.iter().map(|&i| (self.x[[i, feature]], self.y[i])));
            column.sort_by(|a, b| a.0.total_cmp(&b.0));
            if column[0].0 >= column[n - 1].0 {
                continue;
            }
            visited += 1;

            let total_positives = column.iter().filter(|(_, label)| *label == 1).count();
            let mut left_positives = 0;
            for split_at in 1..n {
                if column[split_at - 1].1 == 1 {
                    left_positives += 1;
                }
                let (lo, hi) = (column[split_at - 1].0, column[split_at].0);
                if lo >= hi || split_at < min_leaf || n - split_at < min_leaf {
                    continue;
                }

                let right_positives = total_positives - left_positives;
                let impurity = (split_at as f64 * gini(left_positives, split_at)
                    + (n - split_at) as f64 * gini(right_positives, n - split_at))
                    / n as f64;

                if best.as_ref().map_or(true, |b| impurity < b.impurity) {
                    let mut threshold = lo / 2.0 + hi / 2.0;
                    if threshold >= hi || !threshold.is_finite() {
                        threshold = lo;
                    }
                    best = Some(SplitCandidate {
                        feature,
                        threshold,
                        impurity,
                    });
                }
            }
        }

        best
    }
}

/// A single classification tree storing the positive-class fraction per leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    /// Grows a tree on the rows listed in `indices` (repeats allowed).
    pub fn fit(
        x: ArrayView2<f64>,
        y: &[u8],
        indices: &[usize],
        params: &ForestParams,
        rng: &mut StdRng,
    ) -> Self {
        let max_features = ((x.ncols() as f64).sqrt() as usize).max(1);
        let mut builder = TreeBuilder {
            x: x.reborrow(),
            y,
            params,
            max_features,
            nodes: Vec::new(),
        };

        let mut indices = indices.to_vec();
        if !indices.is_empty() {
            builder.build(&mut indices, 0, rng);
        }

        Self {
            nodes: builder.nodes,
        }
    }

    pub fn predict_probability(&self, row: &[f64]) -> f64 {
        let mut id = 0;
        loop {
            match self.nodes.get(id) {
                Some(Node::Leaf { probability }) => return *probability,
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    id = if row[*feature] <= *threshold { *left } else { *right };
                }
                None => return 0.5,
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Bagged ensemble of [`DecisionTree`]s; the probability is the mean of
/// the trees' leaf fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
    n_features: usize,
}

impl RandomForest {
    /// Fits trees in parallel. Each tree draws its bootstrap sample and
    /// feature order from its own seed, so the result is independent of
    /// thread scheduling.
    pub fn fit(x: ArrayView2<f64>, y: &[u8], params: &ForestParams) -> Result<Self, ModelError> {
        let n = x.nrows();
        if n == 0 || n != y.len() {
            return Err(ModelError::EmptyTrainingSet);
        }

        let trees = (0..params.n_estimators.max(1))
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(t as u64));
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                DecisionTree::fit(x, y, &bootstrap, params, &mut rng)
            })
            .collect();

        Ok(Self {
            trees,
            n_features: x.ncols(),
        })
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn predict_probability(&self, row: &[f64]) -> Result<f64, ModelError> {
        if row.len() != self.n_features {
            return Err(ModelError::DimensionMismatch {
                expected: self.n_features,
                got: row.len(),
            });
        }
        let total: f64 = self.trees.iter().map(|t| t.predict_probability(row)).sum();
        Ok(total / self.trees.len() as f64)
    }
}
