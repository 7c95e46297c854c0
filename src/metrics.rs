use std::fmt;

use serde::Serialize;

use crate::Label;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Per-class precision/recall/F1 plus summary averages on a held-out split.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    /// Indexed by label value: original, then manipulated.
    pub classes: [ClassMetrics; 2],
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
    /// `None` when the evaluated split holds a single class.
    pub roc_auc: Option<f64>,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl ClassificationReport {
    pub fn compute(y_true: &[u8], y_pred: &[u8], y_score: &[f64]) -> Self {
        let mut classes = [ClassMetrics::default(); 2];

        for (class, metrics) in classes.iter_mut().enumerate() {
            let class = class as u8;
            let tp = y_true
                .iter()
                .zip(y_pred)
                .filter(|(&t, &p)| t == class && p == class)
                .count();
            let predicted = y_pred.iter().filter(|&&p| p == class).count();
            let support = y_true.iter().filter(|&&t| t == class).count();

            let precision = ratio(tp, predicted);
            let recall = ratio(tp, support);
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };

            *metrics = ClassMetrics {
                precision,
                recall,
                f1,
                support,
            };
        }

        let total = y_true.len();
        let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();

        let average = |weight: &dyn Fn(&ClassMetrics) -> f64| -> ClassMetrics {
            let weights: Vec<f64> = classes.iter().map(weight).collect();
            let sum: f64 = weights.iter().sum();
            let mean = |field: fn(&ClassMetrics) -> f64| {
                if sum == 0.0 {
                    return 0.0;
                }
                classes.iter().zip(&weights).map(|(m, w)| field(m) * w).sum::<f64>() / sum
            };
            ClassMetrics {
                precision: mean(|m| m.precision),
                recall: mean(|m| m.recall),
                f1: mean(|m| m.f1),
                support: total,
            }
        };

        let macro_avg = average(&|_| 1.0);
        let weighted_avg = average(&|m| m.support as f64);

        Self {
            classes,
            accuracy: ratio(correct, total),
            macro_avg,
            weighted_avg,
            roc_auc: roc_auc(y_true, y_score),
        }
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>14} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for (class, m) in self.classes.iter().enumerate() {
            let name = Label::from_u8(class as u8).map_or("?", |l| l.as_str());
            writeln!(
                f,
                "{:>14} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                name, m.precision, m.recall, m.f1, m.support
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>14} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        for (name, m) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            writeln!(
                f,
                "{:>14} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                name, m.precision, m.recall, m.f1, m.support
            )?;
        }
        match self.roc_auc {
            Some(auc) => write!(f, "\nROC-AUC: {auc:.4}"),
            None => write!(f, "\nROC-AUC: n/a (single class in test split)"),
        }
    }
}

/// Area under the ROC curve via the rank-sum statistic, ties averaged.
pub fn roc_auc(y_true: &[u8], y_score: &[f64]) -> Option<f64> {
    let positives = y_true.iter().filter(|&&t| t == 1).count();
    let negatives = y_true.len() - positives;
    if positives == 0 || negatives == 0 || y_true.len() != y_score.len() {
        return None;
    }

    let mut order: Vec<usize> = (0..y_score.len()).collect();
    order.sort_by(|&a, &b| y_score[a].total_cmp(&y_score[b]));

    let mut ranks = vec![0.0; order.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && y_score[order[j + 1]] == y_score[order[i]] {
            j += 1;
        }
        let average_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = average_rank;
        }
        i = j + 1;
    }

    let positive_rank_sum: f64 = y_true
        .iter()
        .zip(&ranks)
        .filter(|(&t, _)| t == 1)
        .map(|(_, r)| r)
        .sum();
    let p = positives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}
