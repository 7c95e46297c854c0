//! Synthetic "manipulated" samples derived from genuine recordings.

use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use ndarray::Array2;
use num_complex::Complex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::audio_processor::{resample_mono, AudioProcessor, AudioSignal};
use crate::error::{AugmentError, FeatureExtractionError};
use crate::spectral;
use crate::training::list_audio_files;

const VOCODER_N_FFT: usize = 2048;
const VOCODER_HOP: usize = VOCODER_N_FFT / 4;

/// Adds white Gaussian noise with standard deviation `sigma`.
pub fn add_noise(samples: &[f32], sigma: f64, rng: &mut StdRng) -> Vec<f32> {
    samples
        .iter()
        .map(|&x| {
            // Box-Muller; 1 - u keeps the log argument in (0, 1]
            let u1: f64 = 1.0 - rng.gen::<f64>();
            let u2: f64 = rng.gen();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
            (x as f64 + sigma * z) as f32
        })
        .collect()
}

/// Phase-vocoder time stretch. `rate > 1` speeds up; the output holds
/// `round(len / rate)` samples.
pub fn time_stretch(samples: &[f32], rate: f64) -> Result<Vec<f32>, FeatureExtractionError> {
    if !(rate.is_finite() && rate > 0.0) {
        return Err(FeatureExtractionError::InvalidConfig(format!(
            "stretch rate must be positive, got {rate}"
        )));
    }
    if samples.is_empty() {
        return Err(FeatureExtractionError::EmptyAudio);
    }

    let spectrum = spectral::stft(samples, VOCODER_N_FFT, VOCODER_HOP);
    let (n_bins, n_frames) = spectrum.dim();

    let steps: Vec<f64> = (0..)
        .map(|i| i as f64 * rate)
        .take_while(|&t| t < n_frames as f64)
        .collect();

    // Expected phase advance per hop for each bin
    let phi_advance: Vec<f64> = (0..n_bins)
        .map(|k| PI * VOCODER_HOP as f64 * k as f64 / (n_bins - 1).max(1) as f64)
        .collect();

    let column = |bin: usize, frame: usize| -> Complex<f64> {
        if frame < n_frames {
            spectrum[[bin, frame]]
        } else {
            Complex::new(0.0, 0.0)
        }
    };

    let mut phase: Vec<f64> = (0..n_bins).map(|k| spectrum[[k, 0]].arg()).collect();
    let mut stretched = Array2::<Complex<f64>>::zeros((n_bins, steps.len()));

    for (t, &step) in steps.iter().enumerate() {
        let frame = step.floor() as usize;
        let alpha = step - step.floor();
        for k in 0..n_bins {
            let (left, right) = (column(k, frame), column(k, frame + 1));
            let magnitude = (1.0 - alpha) * left.norm() + alpha * right.norm();
            stretched[[k, t]] = Complex::from_polar(magnitude, phase[k]);

            let mut dphase = right.arg() - left.arg() - phi_advance[k];
            dphase -= 2.0 * PI * (dphase / (2.0 * PI)).round();
            phase[k] += phi_advance[k] + dphase;
        }
    }

    let length = (samples.len() as f64 / rate).round() as usize;
    Ok(spectral::istft(&stretched, VOCODER_N_FFT, VOCODER_HOP, length))
}

/// Shifts pitch by `n_steps` semitones while keeping the length.
pub fn pitch_shift(samples: &[f32], sample_rate: u32, n_steps: f64) -> Result<Vec<f32>, FeatureExtractionError> {
    let rate = 2f64.powf(-n_steps / 12.0);
    let stretched = time_stretch(samples, rate)?;
    let sr = sample_rate as f64;
    let mut shifted = resample_mono(&stretched, sr / rate, sr)?;
    shifted.resize(samples.len(), 0.0);
    Ok(shifted)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Variant {
    Slow,
    Fast,
    High,
    Low,
    Noisy,
}

impl Variant {
    pub const ALL: [Variant; 5] = [
        Variant::Slow,
        Variant::Fast,
        Variant::High,
        Variant::Low,
        Variant::Noisy,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            Variant::Slow => "slow",
            Variant::Fast => "fast",
            Variant::High => "high",
            Variant::Low => "low",
            Variant::Noisy => "noisy",
        }
    }

    pub fn apply(
        &self,
        signal: &AudioSignal,
        noise_sigma: f64,
        rng: &mut StdRng,
    ) -> Result<Vec<f32>, FeatureExtractionError> {
        match self {
            Variant::Slow => time_stretch(&signal.samples, 0.8),
            Variant::Fast => time_stretch(&signal.samples, 1.2),
            Variant::High => pitch_shift(&signal.samples, signal.sample_rate, 4.0),
            Variant::Low => pitch_shift(&signal.samples, signal.sample_rate, -4.0),
            Variant::Noisy => Ok(add_noise(&signal.samples, noise_sigma, rng)),
        }
    }
}

#[derive(Debug, Default)]
pub struct GenerationSummary {
    pub processed: usize,
    pub created: usize,
    pub skipped: Vec<(PathBuf, AugmentError)>,
}

/// Writes every [`Variant`] of each clip in `real_dir` into `fake_dir`.
pub struct FakeGenerator {
    processor: AudioProcessor,
    real_dir: PathBuf,
    fake_dir: PathBuf,
    extensions: Vec<String>,
    noise_sigma: f64,
    seed: u64,
}

impl FakeGenerator {
    pub fn new(sample_rate: u32, real_dir: PathBuf, fake_dir: PathBuf, extensions: Vec<String>) -> Self {
        Self {
            processor: AudioProcessor::new(sample_rate),
            real_dir,
            fake_dir,
            extensions,
            noise_sigma: 0.005,
            seed: 42,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn process_file(&self, path: &Path, rng: &mut StdRng) -> Result<usize, AugmentError> {
        let signal = self.processor.load_audio_file(path)?;
        if signal.is_empty() {
            return Err(FeatureExtractionError::EmptyAudio.into());
        }
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "clip".to_string());

        let mut created = 0;
        for variant in Variant::ALL {
            let samples = variant.apply(&signal, self.noise_sigma, rng)?;
            let out = self.fake_dir.join(format!("{}_{}.wav", stem, variant.suffix()));
            self.processor
                .write_wav(&out, &AudioSignal::new(samples, signal.sample_rate))
                .map_err(|source| AugmentError::Write { path: out, source })?;
            created += 1;
        }
        Ok(created)
    }

    pub fn run(&self) -> Result<GenerationSummary, AugmentError> {
        fs::create_dir_all(&self.fake_dir).map_err(|source| AugmentError::Io {
            path: self.fake_dir.clone(),
            source,
        })?;
        let files = list_audio_files(&self.real_dir, &self.extensions).map_err(|source| {
            AugmentError::Io {
                path: self.real_dir.clone(),
                source,
            }
        })?;
        if files.is_empty() {
            warn!("No audio files found in {}", self.real_dir.display());
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut summary = GenerationSummary::default();
        for path in files {
            match self.process_file(&path, &mut rng) {
                Ok(created) => {
                    info!("Processed {} -> {} fake files", path.display(), created);
                    summary.processed += 1;
                    summary.created += created;
                }
                Err(e) => {
                    warn!("Skipped {}: {}", path.display(), e);
                    summary.skipped.push((path, e));
                }
            }
        }

        info!(
            "Generated {} fake files in {}",
            summary.created,
            self.fake_dir.display()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, len: usize, sr: u32) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32).sin())
            .collect()
    }

    fn dominant_frequency(samples: &[f32], sr: u32) -> f64 {
        let spectrum = spectral::stft(samples, 2048, 512);
        let mid = spectrum.ncols() / 2;
        let (bin, _) = (0..spectrum.nrows())
            .map(|k| (k, spectrum[[k, mid]].norm()))
            .fold((0, 0.0), |best, cur| if cur.1 > best.1 { cur } else { best });
        bin as f64 * sr as f64 / 2048.0
    }

    #[test]
    fn noise_has_requested_spread() {
        let mut rng = StdRng::seed_from_u64(7);
        let noisy = add_noise(&vec![0.0; 20000], 0.005, &mut rng);
        let mean = noisy.iter().map(|&x| x as f64).sum::<f64>() / noisy.len() as f64;
        let var = noisy.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>() / noisy.len() as f64;
        assert!(mean.abs() < 5e-4, "mean {mean}");
        assert!((var.sqrt() - 0.005).abs() < 5e-4, "std {}", var.sqrt());
    }

    #[test]
    fn stretch_changes_length_and_keeps_pitch() {
        let sr = 16000;
        let input = tone(440.0, sr as usize, sr);
        let slow = time_stretch(&input, 0.8).unwrap();
        let fast = time_stretch(&input, 1.2).unwrap();
        assert_eq!(slow.len(), 20000);
        assert_eq!(fast.len(), 13333);

        let f = dominant_frequency(&slow, sr);
        assert!((f - 440.0).abs() < 2.0 * sr as f64 / 2048.0, "dominant {f}");
    }

    #[test]
    fn stretch_rejects_bad_rate() {
        assert!(time_stretch(&[0.1; 100], 0.0).is_err());
        assert!(matches!(time_stretch(&[], 1.0), Err(FeatureExtractionError::EmptyAudio)));
    }

    #[test]
    fn pitch_shift_keeps_length_and_raises_pitch() {
        let sr = 16000;
        let input = tone(440.0, sr as usize, sr);
        let high = pitch_shift(&input, sr, 4.0).unwrap();
        assert_eq!(high.len(), input.len());

        let expected = 440.0 * 2f64.powf(4.0 / 12.0);
        let f = dominant_frequency(&high, sr);
        assert!((f - expected).abs() < 3.0 * sr as f64 / 2048.0, "dominant {f}, expected {expected}");
    }

    #[test]
    fn generator_writes_five_variants_and_skips_bad_files() {
        let root = tempfile::tempdir().unwrap();
        let real = root.path().join("real");
        let fake = root.path().join("fake");
        fs::create_dir(&real).unwrap();

        let processor = AudioProcessor::new(16000);
        processor
            .write_wav(real.join("voice.wav"), &AudioSignal::new(tone(300.0, 16000, 16000), 16000))
            .unwrap();
        fs::write(real.join("broken.wav"), b"nope").unwrap();

        let generator = FakeGenerator::new(16000, real, fake.clone(), vec!["wav".into()]);
        let summary = generator.run().unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.created, 5);
        assert_eq!(summary.skipped.len(), 1);

        for suffix in ["slow", "fast", "high", "low", "noisy"] {
            assert!(fake.join(format!("voice_{suffix}.wav")).exists(), "missing {suffix}");
        }
    }
}
