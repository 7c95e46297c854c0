use std::path::Path;

use log::debug;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::audio_processor::{resample_mono, AudioProcessor, AudioSignal};
use crate::config::FeatureConfig;
use crate::error::FeatureExtractionError;
use crate::spectral;

/// Amplitude floor used when expressing frame energy in dB.
const AMPLITUDE_AMIN: f64 = 1e-5;

/// Fixed-length feature vector.
///
/// Layout for `n_mfcc` coefficients and `n_chroma` bins:
/// `[mfcc mean, mfcc std, delta mean, delta std, delta2 mean, delta2 std,
///   chroma mean, zcr, centroid, rolloff, flatness, duration]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Clip duration in seconds, the last slot of the layout.
    pub fn duration_secs(&self) -> Option<f64> {
        self.0.last().copied()
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl AsRef<[f64]> for FeatureVector {
    fn as_ref(&self) -> &[f64] {
        &self.0
    }
}

/// Names of every slot of the vector, in layout order.
pub fn feature_names(config: &FeatureConfig) -> Vec<String> {
    let mut names = Vec::with_capacity(config.dimension());
    for family in ["mfcc", "delta", "delta2"] {
        for stat in ["mean", "std"] {
            names.extend((0..config.n_mfcc).map(|i| format!("{family}_{stat}_{i}")));
        }
    }
    names.extend((0..config.n_chroma).map(|i| format!("chroma_mean_{i}")));
    names.extend(
        ["zcr_mean", "centroid_mean", "rolloff_mean", "flatness_mean", "duration_secs"]
            .iter()
            .map(|s| s.to_string()),
    );
    names
}

/// Turns decoded audio into a [`FeatureVector`].
///
/// Filterbanks and the DCT basis are built once per extractor; `extract`
/// itself holds no mutable state and can be shared across threads.
pub struct FeatureExtractor {
    config: FeatureConfig,
    audio_processor: AudioProcessor,
    mel_basis: Array2<f64>,
    chroma_basis: Array2<f64>,
    dct_basis: Array2<f64>,
    freqs: Array1<f64>,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Result<Self, FeatureExtractionError> {
        config.validate()?;

        let mel_basis = spectral::mel_filterbank(config.sample_rate, config.n_fft, config.n_mels);
        let chroma_basis = spectral::chroma_filterbank(
            config.sample_rate,
            config.n_fft,
            config.n_chroma,
            config.tuning,
        );
        let dct_basis = spectral::dct_matrix(config.n_mfcc, config.n_mels);
        let freqs = spectral::fft_frequencies(config.sample_rate, config.n_fft);

        Ok(Self {
            audio_processor: AudioProcessor::new(config.sample_rate),
            config,
            mel_basis,
            chroma_basis,
            dct_basis,
            freqs,
        })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension()
    }

    /// Decodes `path` and extracts its features.
    pub fn extract<P: AsRef<Path>>(&self, path: P) -> Result<FeatureVector, FeatureExtractionError> {
        let signal = self.audio_processor.load_audio_file(path.as_ref())?;
        debug!(
            "Loaded {} with {} samples ({:.2} seconds)",
            path.as_ref().display(),
            signal.len(),
            signal.duration_secs()
        );
        self.extract_signal(&signal)
    }

    /// Extracts features from an already decoded mono signal.
    pub fn extract_signal(&self, signal: &AudioSignal) -> Result<FeatureVector, FeatureExtractionError> {
        let samples = if signal.sample_rate != self.config.sample_rate {
            resample_mono(
                &signal.samples,
                signal.sample_rate as f64,
                self.config.sample_rate as f64,
            )?
        } else {
            signal.samples.clone()
        };

        let prepared = self.prepare(&samples)?;
        self.compute_features(&prepared)
    }

    /// Rejects empty input, trims edge silence and pads to the minimum length.
    pub fn prepare(&self, samples: &[f32]) -> Result<Vec<f32>, FeatureExtractionError> {
        if samples.is_empty() || samples.iter().all(|&s| s == 0.0) {
            return Err(FeatureExtractionError::EmptyAudio);
        }

        let trimmed = trim_silence(
            samples,
            self.config.trim_top_db,
            self.config.trim_frame_length,
            self.config.trim_hop_length,
        );
        Ok(pad_to_length(trimmed, self.config.min_samples()))
    }

    fn compute_features(&self, samples: &[f32]) -> Result<FeatureVector, FeatureExtractionError> {
        let cfg = &self.config;

        let spectrum = spectral::stft(samples, cfg.n_fft, cfg.hop_length);
        let magnitude = spectrum.mapv(|c| c.norm());
        let power = spectrum.mapv(|c| c.norm_sqr());

        let mel = self.mel_basis.dot(&power);
        let log_mel = spectral::power_to_db(&mel, cfg.top_db_mel);
        let mfcc = self.dct_basis.dot(&log_mel);
        let delta = spectral::delta(&mfcc, 1, cfg.delta_width)?;
        let delta2 = spectral::delta(&mfcc, 2, cfg.delta_width)?;

        let mut chroma = self.chroma_basis.dot(&power);
        spectral::normalize_columns_max(&mut chroma);

        let zcr = spectral::zero_crossing_rate(samples, cfg.n_fft, cfg.hop_length);
        let centroid = spectral::spectral_centroid(&magnitude, &self.freqs);
        let rolloff = spectral::spectral_rolloff(&magnitude, &self.freqs, cfg.rolloff_percent);
        let flatness = spectral::spectral_flatness(&power);

        let mut features = Vec::with_capacity(cfg.dimension());
        for matrix in [&mfcc, &delta, &delta2] {
            features.extend(frame_mean(matrix)?.iter().copied());
            features.extend(matrix.std_axis(Axis(1), 0.0).iter().copied());
        }
        features.extend(frame_mean(&chroma)?.iter().copied());
        features.push(mean(&zcr));
        features.push(mean(&centroid));
        features.push(mean(&rolloff));
        features.push(mean(&flatness));
        features.push(samples.len() as f64 / cfg.sample_rate as f64);

        if let Some(index) = features.iter().position(|v| !v.is_finite()) {
            return Err(FeatureExtractionError::NonFinite { index });
        }
        debug_assert_eq!(features.len(), cfg.dimension());

        Ok(FeatureVector::new(features))
    }
}

fn frame_mean(matrix: &Array2<f64>) -> Result<Array1<f64>, FeatureExtractionError> {
    matrix
        .mean_axis(Axis(1))
        .ok_or(FeatureExtractionError::TooFewFrames {
            frames: 0,
            required: 1,
        })
}

fn mean(values: &Array1<f64>) -> f64 {
    values.mean().unwrap_or(0.0)
}

/// Drops leading and trailing frames whose RMS energy is more than `top_db`
/// below the loudest frame. Everything between the first and last loud frame
/// is kept.
pub fn trim_silence(samples: &[f32], top_db: f64, frame_length: usize, hop: usize) -> &[f32] {
    let rms = spectral::rms_frames(samples, frame_length, hop);
    let peak = rms.iter().copied().fold(0.0f64, f64::max).max(AMPLITUDE_AMIN);
    let ref_db = 20.0 * peak.log10();

    let loud = |r: &f64| 20.0 * r.max(AMPLITUDE_AMIN).log10() - ref_db > -top_db;
    let (Some(first), Some(last)) = (rms.iter().position(loud), rms.iter().rposition(loud)) else {
        return &samples[..0];
    };

    let start = (first * hop).min(samples.len());
    let end = ((last + 1) * hop).min(samples.len());
    &samples[start..end]
}

/// Right-pads with zeros to at least `min_len` samples; never truncates.
pub fn pad_to_length(samples: &[f32], min_len: usize) -> Vec<f32> {
    let mut padded = samples.to_vec();
    if padded.len() < min_len {
        padded.resize(min_len, 0.0);
    }
    padded
}
