//! Offline training: dataset walk, stratified split, calibrated forest fit,
//! held-out evaluation and artifact persistence.

use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::calibration::CalibratedClassifier;
use crate::config::TrainingConfig;
use crate::error::{FeatureExtractionError, ModelError, TrainingError};
use crate::feature_extractor::{FeatureExtractor, FeatureVector};
use crate::forest::ForestParams;
use crate::metrics::ClassificationReport;
use crate::model_inference::ModelArtifact;
use crate::Label;

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledSample {
    pub path: PathBuf,
    pub features: FeatureVector,
    pub label: Label,
}

/// Result of walking both dataset folders.
#[derive(Debug, Default)]
pub struct DatasetLoad {
    pub samples: Vec<LabeledSample>,
    pub failures: Vec<(PathBuf, FeatureExtractionError)>,
}

impl DatasetLoad {
    pub fn count(&self, label: Label) -> usize {
        self.samples.iter().filter(|s| s.label == label).count()
    }
}

/// Row indices of the train and test partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

#[derive(Debug)]
pub struct TrainingOutcome {
    pub report: Option<ClassificationReport>,
    pub n_train: usize,
    pub n_test: usize,
    pub n_failures: usize,
    pub artifact_path: PathBuf,
}

/// Splits row indices so both partitions keep the class ratio.
///
/// The test partition holds `ceil(test_fraction * n)` rows, capped so that
/// at least one row is left for training. Per-class quotas are the floor of
/// the proportional share, with the remainder going to the classes with the
/// largest fractional parts.
pub fn stratified_split(labels: &[Label], test_fraction: f64, seed: u64) -> Split {
    let n = labels.len();
    if n == 0 {
        return Split {
            train: Vec::new(),
            test: Vec::new(),
        };
    }

    let n_test = ((test_fraction * n as f64).ceil() as usize).min(n - 1);

    let mut by_class: [Vec<usize>; 2] = [Vec::new(), Vec::new()];
    for (i, label) in labels.iter().enumerate() {
        by_class[*label as usize].push(i);
    }

    let shares: Vec<f64> = by_class
        .iter()
        .map(|members| n_test as f64 * members.len() as f64 / n as f64)
        .collect();
    let mut quotas: Vec<usize> = shares.iter().map(|s| s.floor() as usize).collect();
    let mut remainder = n_test - quotas.iter().sum::<usize>();

    let mut order: Vec<usize> = (0..2).collect();
    order.sort_by(|&a, &b| {
        let frac = |c: usize| shares[c] - shares[c].floor();
        frac(b).total_cmp(&frac(a))
    });
    while remainder > 0 {
        let before = remainder;
        for &class in &order {
            if remainder > 0 && quotas[class] < by_class[class].len() {
                quotas[class] += 1;
                remainder -= 1;
            }
        }
        if remainder == before {
            break;
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut split = Split {
        train: Vec::with_capacity(n - n_test),
        test: Vec::with_capacity(n_test),
    };
    for (class, members) in by_class.iter_mut().enumerate() {
        members.shuffle(&mut rng);
        let (test, train) = members.split_at(quotas[class]);
        split.test.extend_from_slice(test);
        split.train.extend_from_slice(train);
    }
    split.train.sort_unstable();
    split.test.sort_unstable();
    split
}

fn feature_matrix(samples: &[LabeledSample], rows: &[usize], dim: usize) -> Result<Array2<f64>, ModelError> {
    let mut flat = Vec::with_capacity(rows.len() * dim);
    for &i in rows {
        let features = samples[i].features.as_slice();
        if features.len() != dim {
            return Err(ModelError::DimensionMismatch {
                expected: dim,
                got: features.len(),
            });
        }
        flat.extend_from_slice(features);
    }
    Array2::from_shape_vec((rows.len(), dim), flat)
        .map_err(|e| ModelError::Backend(e.to_string()))
}

/// Files directly inside `dir` whose extension is in `extensions`
/// (case-insensitive), sorted. A missing folder is logged and yields nothing.
pub fn list_audio_files(dir: &Path, extensions: &[String]) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        warn!("Folder {} does not exist; skipping", dir.display());
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)));
        if matches {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

pub struct TrainingPipeline {
    extractor: FeatureExtractor,
    config: TrainingConfig,
}

impl TrainingPipeline {
    pub fn new(extractor: FeatureExtractor, config: TrainingConfig) -> Self {
        Self { extractor, config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn forest_params(&self) -> ForestParams {
        ForestParams {
            n_estimators: self.config.n_estimators,
            max_depth: self.config.max_depth,
            min_samples_split: self.config.min_samples_split,
            min_samples_leaf: self.config.min_samples_leaf,
            seed: self.config.seed,
        }
    }

    /// Audio files directly inside `dir`, sorted by path. A missing folder
    /// yields an empty list.
    pub fn list_audio_files(&self, dir: &Path) -> Result<Vec<PathBuf>, TrainingError> {
        list_audio_files(dir, &self.config.extensions).map_err(|source| TrainingError::Io {
            path: dir.to_path_buf(),
            source,
        })
    }

    /// Extracts features for every file in both folders. Files that fail are
    /// logged and recorded, never fatal.
    pub fn load_dataset(&self) -> Result<DatasetLoad, TrainingError> {
        let mut jobs: Vec<(PathBuf, Label)> = Vec::new();
        for (dir, label) in [
            (&self.config.real_dir, Label::Original),
            (&self.config.fake_dir, Label::Manipulated),
        ] {
            let files = self.list_audio_files(dir)?;
            info!("Found {} {} files in {}", files.len(), label.as_str(), dir.display());
            jobs.extend(files.into_iter().map(|path| (path, label)));
        }

        let results: Vec<_> = jobs
            .into_par_iter()
            .map(|(path, label)| {
                let result = self.extractor.extract(&path);
                (path, label, result)
            })
            .collect();

        let mut load = DatasetLoad::default();
        for (path, label, result) in results {
            match result {
                Ok(features) => load.samples.push(LabeledSample {
                    path,
                    features,
                    label,
                }),
                Err(e) => {
                    warn!("Skipped {}: {}", path.display(), e);
                    load.failures.push((path, e));
                }
            }
        }

        info!(
            "Loaded {} samples ({} original, {} manipulated), {} skipped",
            load.samples.len(),
            load.count(Label::Original),
            load.count(Label::Manipulated),
            load.failures.len()
        );
        Ok(load)
    }

    /// Fits the calibrated model on the train rows and scores the test rows.
    pub fn fit(
        &self,
        samples: &[LabeledSample],
        split: &Split,
    ) -> Result<(CalibratedClassifier, Option<ClassificationReport>), TrainingError> {
        let dim = self.extractor.dimension();
        let x_train = feature_matrix(samples, &split.train, dim)?;
        let y_train: Vec<u8> = split.train.iter().map(|&i| samples[i].label as u8).collect();

        info!(
            "Fitting {} trees with {}-fold sigmoid calibration on {} samples",
            self.config.n_estimators,
            self.config.calibration_folds,
            split.train.len()
        );
        let model = CalibratedClassifier::fit(
            x_train.view(),
            &y_train,
            &self.forest_params(),
            self.config.calibration_folds,
        )?;

        if split.test.is_empty() {
            warn!("Test split is empty; skipping evaluation");
            return Ok((model, None));
        }

        let mut y_true = Vec::with_capacity(split.test.len());
        let mut y_pred = Vec::with_capacity(split.test.len());
        let mut y_score = Vec::with_capacity(split.test.len());
        for &i in &split.test {
            let p = model.predict_probability(samples[i].features.as_slice())?;
            y_true.push(samples[i].label as u8);
            y_pred.push(Label::from_probability(p) as u8);
            y_score.push(p);
        }

        let report = ClassificationReport::compute(&y_true, &y_pred, &y_score);
        if report.roc_auc.is_none() {
            warn!("Test split holds a single class; ROC-AUC skipped");
        }
        Ok((model, Some(report)))
    }

    /// Full run: load, split, fit, evaluate, then overwrite the artifact at
    /// `model_path`. Nothing is written when no sample could be extracted.
    pub fn run(&self, model_path: &Path) -> Result<TrainingOutcome, TrainingError> {
        let load = self.load_dataset()?;
        if load.samples.is_empty() {
            return Err(TrainingError::EmptyDataset {
                real: self.config.real_dir.clone(),
                fake: self.config.fake_dir.clone(),
            });
        }

        let labels: Vec<Label> = load.samples.iter().map(|s| s.label).collect();
        let split = stratified_split(&labels, self.config.test_fraction, self.config.seed);
        info!("Split: {} train, {} test", split.train.len(), split.test.len());

        let (model, report) = self.fit(&load.samples, &split)?;
        if let Some(report) = &report {
            info!("Evaluation on held-out split:\n{}", report);
        }

        let artifact = ModelArtifact::new(self.extractor.config().clone(), model);
        artifact.save(model_path)?;

        Ok(TrainingOutcome {
            report,
            n_train: split.train.len(),
            n_test: split.test.len(),
            n_failures: load.failures.len(),
            artifact_path: model_path.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureConfig;

    fn labels(original: usize, manipulated: usize) -> Vec<Label> {
        let mut labels = vec![Label::Original; original];
        labels.extend(vec![Label::Manipulated; manipulated]);
        labels
    }

    #[test]
    fn split_is_stratified_and_disjoint() {
        let labels = labels(10, 10);
        let split = stratified_split(&labels, 0.2, 42);
        assert_eq!(split.test.len(), 4);
        assert_eq!(split.train.len(), 16);

        let test_fake = split.test.iter().filter(|&&i| labels[i] == Label::Manipulated).count();
        assert_eq!(test_fake, 2);

        let mut all: Vec<usize> = split.train.iter().chain(&split.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn split_is_reproducible() {
        let labels = labels(7, 5);
        assert_eq!(stratified_split(&labels, 0.2, 42), stratified_split(&labels, 0.2, 42));
    }

    #[test]
    fn split_keeps_proportions_for_unbalanced_classes() {
        let labels = labels(15, 5);
        let split = stratified_split(&labels, 0.2, 1);
        let test_fake = split.test.iter().filter(|&&i| labels[i] == Label::Manipulated).count();
        assert_eq!(split.test.len(), 4);
        assert_eq!(test_fake, 1);
    }

    #[test]
    fn split_leaves_a_training_row() {
        let split = stratified_split(&labels(1, 0), 0.2, 42);
        assert_eq!(split.train, vec![0]);
        assert!(split.test.is_empty());

        let split = stratified_split(&labels(1, 1), 0.2, 42);
        assert_eq!(split.test.len(), 1);
        assert_eq!(split.train.len(), 1);
    }

    #[test]
    fn listing_filters_extensions_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.wav", "a.MP3", "c.m4a", "notes.txt", "d.flac"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.wav")).unwrap();

        let pipeline = TrainingPipeline::new(
            FeatureExtractor::new(FeatureConfig::default()).unwrap(),
            TrainingConfig::default(),
        );
        let files = pipeline.list_audio_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.MP3", "b.wav", "c.m4a"]);

        let missing = pipeline.list_audio_files(&dir.path().join("absent")).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn undecodable_files_are_recorded_as_failures() {
        let root = tempfile::tempdir().unwrap();
        let real = root.path().join("real");
        std::fs::create_dir(&real).unwrap();
        std::fs::write(real.join("broken.wav"), b"not audio").unwrap();

        let config = TrainingConfig {
            real_dir: real,
            fake_dir: root.path().join("fake"),
            ..Default::default()
        };
        let pipeline = TrainingPipeline::new(FeatureExtractor::new(FeatureConfig::default()).unwrap(), config);
        let load = pipeline.load_dataset().unwrap();
        assert!(load.samples.is_empty());
        assert_eq!(load.failures.len(), 1);

        let model_path = root.path().join("model.json");
        assert!(matches!(
            pipeline.run(&model_path),
            Err(TrainingError::EmptyDataset { .. })
        ));
        assert!(!model_path.exists());
    }
}
