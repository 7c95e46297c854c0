//! Frame-based spectral primitives.
//!
//! Matrices are laid out `(bins_or_coefficients, frames)`. Analysis frames
//! are centred: the signal is zero-padded by `n_fft / 2` on both sides, so a
//! signal of `n` samples yields `1 + n / hop` frames.

use std::f64::consts::PI;

use ndarray::{Array1, Array2, Axis};
use num_complex::Complex;
use rustfft::FftPlanner;

use crate::error::FeatureExtractionError;

/// Floor applied before taking logarithms of power values.
pub const POWER_AMIN: f64 = 1e-10;

/// Samples with magnitude at or below this count as zero in crossing counts.
const ZERO_CROSSING_THRESHOLD: f64 = 1e-10;

/// Periodic Hann window of length `n`.
pub fn hann_window(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos())
        .collect()
}

pub fn frame_count(n_samples: usize, hop: usize) -> usize {
    1 + n_samples / hop
}

/// Centre frequency in Hz of every non-negative FFT bin.
pub fn fft_frequencies(sample_rate: u32, n_fft: usize) -> Array1<f64> {
    Array1::from_iter((0..=n_fft / 2).map(|k| k as f64 * sample_rate as f64 / n_fft as f64))
}

/// Short-time Fourier transform with a periodic Hann window.
pub fn stft(samples: &[f32], n_fft: usize, hop: usize) -> Array2<Complex<f64>> {
    let pad = n_fft / 2;
    let mut padded = vec![0.0f64; samples.len() + 2 * pad];
    for (slot, &sample) in padded[pad..].iter_mut().zip(samples) {
        *slot = sample as f64;
    }

    let n_frames = if padded.len() >= n_fft {
        1 + (padded.len() - n_fft) / hop
    } else {
        0
    };
    let n_bins = n_fft / 2 + 1;
    let window = hann_window(n_fft);

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n_fft);

    let mut spectrum = Array2::zeros((n_bins, n_frames));
    let mut buffer = vec![Complex::new(0.0, 0.0); n_fft];

    for frame in 0..n_frames {
        let start = frame * hop;
        for (i, slot) in buffer.iter_mut().enumerate() {
            *slot = Complex::new(padded[start + i] * window[i], 0.0);
        }
        fft.process(&mut buffer);
        for (bin, value) in buffer.iter().take(n_bins).enumerate() {
            spectrum[[bin, frame]] = *value;
        }
    }

    spectrum
}

/// Inverse of [`stft`] by windowed overlap-add, trimmed or zero-filled to `length`.
pub fn istft(spectrum: &Array2<Complex<f64>>, n_fft: usize, hop: usize, length: usize) -> Vec<f32> {
    let (n_bins, n_frames) = spectrum.dim();
    if n_frames == 0 {
        return vec![0.0; length];
    }

    let window = hann_window(n_fft);
    let total = n_fft + hop * (n_frames - 1);
    let mut signal = vec![0.0f64; total];
    let mut window_sum = vec![0.0f64; total];

    let mut planner = FftPlanner::<f64>::new();
    let ifft = planner.plan_fft_inverse(n_fft);
    let mut buffer = vec![Complex::new(0.0, 0.0); n_fft];

    for frame in 0..n_frames {
        for (k, slot) in buffer.iter_mut().enumerate() {
            *slot = if k < n_bins {
                spectrum[[k, frame]]
            } else {
                spectrum[[n_fft - k, frame]].conj()
            };
        }
        buffer[0].im = 0.0;
        if n_fft % 2 == 0 {
            buffer[n_fft / 2].im = 0.0;
        }
        ifft.process(&mut buffer);

        let start = frame * hop;
        for i in 0..n_fft {
            signal[start + i] += buffer[i].re / n_fft as f64 * window[i];
            window_sum[start + i] += window[i] * window[i];
        }
    }

    for (value, &weight) in signal.iter_mut().zip(&window_sum) {
        if weight > f64::MIN_POSITIVE {
            *value /= weight;
        }
    }

    let offset = n_fft / 2;
    (0..length)
        .map(|i| signal.get(offset + i).copied().unwrap_or(0.0) as f32)
        .collect()
}

fn hz_to_mel(hz: f64) -> f64 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = 6.4f64.ln() / 27.0;

    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = 6.4f64.ln() / 27.0;

    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        f_sp * mel
    }
}

/// Triangular mel filters on the Slaney scale with area normalisation,
/// spanning 0 Hz to Nyquist. Shape `(n_mels, n_fft / 2 + 1)`.
pub fn mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Array2<f64> {
    let fft_freqs = fft_frequencies(sample_rate, n_fft);
    let mel_max = hz_to_mel(sample_rate as f64 / 2.0);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = Array2::zeros((n_mels, fft_freqs.len()));
    for m in 0..n_mels {
        let (left, center, right) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
        let enorm = 2.0 / (right - left);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            filters[[m, k]] = lower.min(upper).max(0.0) * enorm;
        }
    }

    filters
}

/// Chroma filters mapping FFT bins to pitch classes, C first.
/// Shape `(n_chroma, n_fft / 2 + 1)`.
pub fn chroma_filterbank(sample_rate: u32, n_fft: usize, n_chroma: usize, tuning: f64) -> Array2<f64> {
    const CENTER_OCTAVE: f64 = 5.0;
    const OCTAVE_WIDTH: f64 = 2.0;

    let n_chroma_f = n_chroma as f64;
    let a440 = 440.0 * 2f64.powf(tuning / n_chroma_f);

    // Fractional chroma bin of every FFT bin over the full (two-sided) range
    let mut frq_bins = Vec::with_capacity(n_fft);
    for k in 1..n_fft {
        let freq = k as f64 * sample_rate as f64 / n_fft as f64;
        frq_bins.push(n_chroma_f * (freq / (a440 / 16.0)).log2());
    }
    let below_first = frq_bins[0] - 1.5 * n_chroma_f;
    frq_bins.insert(0, below_first);

    let mut bin_widths: Vec<f64> = frq_bins
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).max(1.0))
        .collect();
    bin_widths.push(1.0);

    let half = (n_chroma_f / 2.0).round_ties_even();
    let mut weights = Array2::zeros((n_chroma, n_fft));
    for c in 0..n_chroma {
        for i in 0..n_fft {
            let distance =
                (frq_bins[i] - c as f64 + half + 10.0 * n_chroma_f).rem_euclid(n_chroma_f) - half;
            weights[[c, i]] = (-0.5 * (2.0 * distance / bin_widths[i]).powi(2)).exp();
        }
    }

    for mut column in weights.columns_mut() {
        let norm = column.iter().map(|w| w * w).sum::<f64>().sqrt();
        if norm > f64::MIN_POSITIVE {
            column.mapv_inplace(|w| w / norm);
        }
    }

    for i in 0..n_fft {
        let octave = frq_bins[i] / n_chroma_f;
        let gain = (-0.5 * ((octave - CENTER_OCTAVE) / OCTAVE_WIDTH).powi(2)).exp();
        weights.column_mut(i).mapv_inplace(|w| w * gain);
    }

    let shift = 3 * (n_chroma / 12);
    let n_bins = n_fft / 2 + 1;
    let mut rolled = Array2::zeros((n_chroma, n_bins));
    for c in 0..n_chroma {
        for i in 0..n_bins {
            rolled[[c, i]] = weights[[(c + shift) % n_chroma, i]];
        }
    }

    rolled
}

/// `10 * log10(power)` with the result clamped to `top_db` under its maximum.
pub fn power_to_db(power: &Array2<f64>, top_db: f64) -> Array2<f64> {
    let log_spec = power.mapv(|p| 10.0 * p.max(POWER_AMIN).log10());
    let peak = log_spec.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    log_spec.mapv(|db| db.max(peak - top_db))
}

/// Orthonormal DCT-II basis, first `n_out` rows of an `n_in`-point transform.
pub fn dct_matrix(n_out: usize, n_in: usize) -> Array2<f64> {
    let n = n_in as f64;
    Array2::from_shape_fn((n_out, n_in), |(k, j)| {
        let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
        scale * (PI * k as f64 * (2 * j + 1) as f64 / (2.0 * n)).cos()
    })
}

/// Savitzky-Golay derivative along the frame axis.
///
/// `order` 1 fits a line, `order` 2 a parabola, over `width` frames. The
/// first and last `width / 2` frames take the value of the nearest full
/// window, since a polynomial fitted there has a constant derivative of
/// that order.
pub fn delta(data: &Array2<f64>, order: usize, width: usize) -> Result<Array2<f64>, FeatureExtractionError> {
    let n_frames = data.len_of(Axis(1));
    if n_frames < width {
        return Err(FeatureExtractionError::TooFewFrames {
            frames: n_frames,
            required: width,
        });
    }

    let half = (width / 2) as isize;
    let offsets: Vec<f64> = (-half..=half).map(|k| k as f64).collect();
    let coefficients: Vec<f64> = match order {
        1 => {
            let denom: f64 = offsets.iter().map(|k| k * k).sum();
            offsets.iter().map(|k| k / denom).collect()
        }
        2 => {
            let mean_sq = offsets.iter().map(|k| k * k).sum::<f64>() / width as f64;
            let centred: Vec<f64> = offsets.iter().map(|k| k * k - mean_sq).collect();
            let denom: f64 = centred.iter().map(|c| c * c).sum();
            centred.iter().map(|c| 2.0 * c / denom).collect()
        }
        other => {
            return Err(FeatureExtractionError::InvalidConfig(format!(
                "unsupported derivative order {other}"
            )))
        }
    };

    let half = half as usize;
    let mut out = Array2::zeros(data.dim());
    for (row_in, mut row_out) in data.rows().into_iter().zip(out.rows_mut()) {
        for t in half..n_frames - half {
            row_out[t] = coefficients
                .iter()
                .enumerate()
                .map(|(i, c)| c * row_in[t + i - half])
                .sum();
        }
        let head = row_out[half];
        let tail = row_out[n_frames - half - 1];
        for t in 0..half {
            row_out[t] = head;
            row_out[n_frames - 1 - t] = tail;
        }
    }

    Ok(out)
}

/// Root-mean-square energy per centred frame.
pub fn rms_frames(samples: &[f32], frame_length: usize, hop: usize) -> Vec<f64> {
    let pad = frame_length / 2;
    let mut prefix = vec![0.0f64; samples.len() + 1];
    for (i, &s) in samples.iter().enumerate() {
        prefix[i + 1] = prefix[i] + (s as f64) * (s as f64);
    }

    (0..frame_count(samples.len(), hop))
        .map(|frame| {
            // Frame covers padded[start, start + frame_length); map back to the signal
            let start = (frame * hop) as isize - pad as isize;
            let lo = start.clamp(0, samples.len() as isize) as usize;
            let hi = (start + frame_length as isize).clamp(0, samples.len() as isize) as usize;
            ((prefix[hi] - prefix[lo]) / frame_length as f64).sqrt()
        })
        .collect()
}

/// Fraction of sign changes in each edge-padded frame.
pub fn zero_crossing_rate(samples: &[f32], frame_length: usize, hop: usize) -> Array1<f64> {
    if samples.is_empty() {
        return Array1::zeros(1);
    }
    let pad = frame_length / 2;
    let last = samples.len() - 1;
    let negative = |padded_index: usize| -> bool {
        let i = padded_index.saturating_sub(pad).min(last);
        (samples[i] as f64) < -ZERO_CROSSING_THRESHOLD
    };

    Array1::from_iter((0..frame_count(samples.len(), hop)).map(|frame| {
        let start = frame * hop;
        let crossings = (start + 1..start + frame_length)
            .filter(|&i| negative(i) != negative(i - 1))
            .count();
        crossings as f64 / frame_length as f64
    }))
}

/// Magnitude-weighted mean frequency per frame.
pub fn spectral_centroid(magnitude: &Array2<f64>, freqs: &Array1<f64>) -> Array1<f64> {
    Array1::from_iter(magnitude.columns().into_iter().map(|column| {
        let total: f64 = column.sum();
        let norm = if total > f64::MIN_POSITIVE { total } else { 1.0 };
        column.iter().zip(freqs).map(|(m, f)| f * m / norm).sum()
    }))
}

/// Lowest frequency below which `percent` of each frame's magnitude lies.
pub fn spectral_rolloff(magnitude: &Array2<f64>, freqs: &Array1<f64>, percent: f64) -> Array1<f64> {
    Array1::from_iter(magnitude.columns().into_iter().map(|column| {
        let threshold = percent * column.sum();
        let mut cumulative = 0.0;
        for (m, &f) in column.iter().zip(freqs) {
            cumulative += m;
            if cumulative >= threshold {
                return f;
            }
        }
        freqs[freqs.len() - 1]
    }))
}

/// Geometric over arithmetic mean of the floored power spectrum per frame.
pub fn spectral_flatness(power: &Array2<f64>) -> Array1<f64> {
    Array1::from_iter(power.columns().into_iter().map(|column| {
        let n = column.len() as f64;
        let (log_sum, sum) = column.iter().fold((0.0, 0.0), |(ls, s), &p| {
            let p = p.max(POWER_AMIN);
            (ls + p.ln(), s + p)
        });
        (log_sum / n).exp() / (sum / n)
    }))
}

/// Divides every column by its maximum absolute value; all-zero columns stay zero.
pub fn normalize_columns_max(matrix: &mut Array2<f64>) {
    for mut column in matrix.columns_mut() {
        let peak = column.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
        if peak > f64::MIN_POSITIVE {
            column.mapv_inplace(|v| v / peak);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn tone(freq: f64, sample_rate: u32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / sample_rate as f64).sin() as f32)
            .collect()
    }

    #[test]
    fn stft_frame_count_and_peak_bin() {
        let signal = tone(1000.0, 16000, 8000);
        let spectrum = stft(&signal, 2048, 512);
        assert_eq!(spectrum.dim(), (1025, frame_count(8000, 512)));

        let middle = spectrum.column(8);
        let peak = middle
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.norm().total_cmp(&b.1.norm()))
            .map(|(bin, _)| bin)
            .unwrap();
        // 1000 Hz at 16 kHz / 2048 points is bin 128
        assert_eq!(peak, 128);
    }

    #[test]
    fn istft_reconstructs_signal() {
        let signal = tone(440.0, 16000, 6000);
        let spectrum = stft(&signal, 512, 128);
        let rebuilt = istft(&spectrum, 512, 128, signal.len());

        assert_eq!(rebuilt.len(), signal.len());
        let max_err = signal
            .iter()
            .zip(&rebuilt)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_err < 1e-4, "max error {max_err}");
    }

    #[test]
    fn mel_filters_are_non_negative_and_cover_spectrum() {
        let filters = mel_filterbank(16000, 2048, 128);
        assert_eq!(filters.dim(), (128, 1025));
        assert!(filters.iter().all(|&w| w >= 0.0));
        for row in filters.rows() {
            assert!(row.sum() > 0.0);
        }
    }

    #[test]
    fn chroma_of_a440_peaks_at_a() {
        let filters = chroma_filterbank(16000, 2048, 12, 0.0);
        let freqs = fft_frequencies(16000, 2048);
        let bin = freqs
            .iter()
            .enumerate()
            .min_by(|a, b| (a.1 - 440.0).abs().total_cmp(&(b.1 - 440.0).abs()))
            .map(|(i, _)| i)
            .unwrap();

        let column = filters.column(bin);
        let best = column
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(c, _)| c)
            .unwrap();
        // C C# D D# E F F# G G# A
        assert_eq!(best, 9);
    }

    #[test]
    fn dct_rows_are_orthonormal() {
        let basis = dct_matrix(8, 8);
        let gram = basis.dot(&basis.t());
        for i in 0..8 {
            for j in 0..8 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[[i, j]] - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn delta_of_linear_ramp_is_its_slope() {
        let data = Array2::from_shape_fn((2, 20), |(row, t)| (row as f64 + 1.0) * t as f64);
        let first = delta(&data, 1, 9).unwrap();
        let second = delta(&data, 2, 9).unwrap();

        for t in 0..20 {
            assert!((first[[0, t]] - 1.0).abs() < 1e-9);
            assert!((first[[1, t]] - 2.0).abs() < 1e-9);
            assert!(second[[0, t]].abs() < 1e-9);
        }
    }

    #[test]
    fn second_delta_of_parabola_is_constant() {
        let data = Array2::from_shape_fn((1, 15), |(_, t)| (t * t) as f64);
        let second = delta(&data, 2, 9).unwrap();
        assert!(second.iter().all(|&v| (v - 2.0).abs() < 1e-9));
    }

    #[test]
    fn delta_requires_full_window() {
        let data = Array2::<f64>::zeros((3, 5));
        assert!(matches!(
            delta(&data, 1, 9),
            Err(FeatureExtractionError::TooFewFrames { frames: 5, required: 9 })
        ));
    }

    #[test]
    fn zero_crossing_rate_of_alternating_signal() {
        let signal: Vec<f32> = (0..4096).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        let zcr = zero_crossing_rate(&signal, 2048, 512);
        // Interior frames flip on every sample after the first
        assert!((zcr[4] - 2047.0 / 2048.0).abs() < 1e-12);

        let constant = vec![0.25f32; 4096];
        assert!(zero_crossing_rate(&constant, 2048, 512).iter().all(|&z| z == 0.0));
    }

    #[test]
    fn rms_of_constant_signal() {
        let signal = vec![0.5f32; 4096];
        let rms = rms_frames(&signal, 2048, 512);
        assert_eq!(rms.len(), 9);
        assert!((rms[4] - 0.5).abs() < 1e-9);
        // First frame is half padding
        assert!((rms[0] - 0.5 * 0.5f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn centroid_rolloff_flatness_on_simple_spectra() {
        let freqs = array![0.0, 100.0, 200.0, 300.0];
        let magnitude = array![[0.0, 1.0], [0.0, 1.0], [1.0, 1.0], [0.0, 1.0]];

        let centroid = spectral_centroid(&magnitude, &freqs);
        assert!((centroid[0] - 200.0).abs() < 1e-9);
        assert!((centroid[1] - 150.0).abs() < 1e-9);

        let rolloff = spectral_rolloff(&magnitude, &freqs, 0.85);
        assert_eq!(rolloff[0], 200.0);
        assert_eq!(rolloff[1], 300.0);

        let flatness = spectral_flatness(&magnitude);
        assert!((flatness[1] - 1.0).abs() < 1e-9);
        assert!(flatness[0] < 1e-6);
    }

    #[test]
    fn power_to_db_clamps_dynamic_range() {
        let power = array![[1.0, 1e-12], [0.1, 1e-3]];
        let db = power_to_db(&power, 80.0);
        assert!((db[[0, 0]] - 0.0).abs() < 1e-9);
        assert!((db[[1, 0]] + 10.0).abs() < 1e-9);
        assert!((db[[0, 1]] + 80.0).abs() < 1e-9);
    }
}
