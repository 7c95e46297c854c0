use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::debug;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::FeatureExtractionError;

/// Mono samples tagged with their sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSignal {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioSignal {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decodes audio files to mono at a fixed sample rate.
pub struct AudioProcessor {
    target_sample_rate: u32,
}

impl AudioProcessor {
    pub fn new(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// WAV goes through hound, everything else through symphonia.
    pub fn load_audio_file<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<AudioSignal, FeatureExtractionError> {
        let path = path.as_ref();
        let is_wav = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));

        let (interleaved, channels, native_rate) = if is_wav {
            self.read_wav(path)?
        } else {
            self.read_compressed(path)?
        };

        let mono = downmix(&interleaved, channels);
        debug!(
            "Decoded {}: {} frames, {} channel(s) at {} Hz",
            path.display(),
            mono.len(),
            channels,
            native_rate
        );

        let samples = if native_rate != self.target_sample_rate && !mono.is_empty() {
            self.resample(&mono, native_rate)?
        } else {
            mono
        };

        Ok(AudioSignal::new(samples, self.target_sample_rate))
    }

    fn read_wav(&self, path: &Path) -> Result<(Vec<f32>, usize, u32), FeatureExtractionError> {
        let decode_err = |e: hound::Error| FeatureExtractionError::Decode {
            path: path.to_path_buf(),
            source: Box::new(e),
        };

        let mut reader = WavReader::open(path).map_err(decode_err)?;
        let spec = reader.spec();

        let samples = match spec.sample_format {
            SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<Vec<f32>, _>>()
                .map_err(decode_err)?,
            SampleFormat::Int => {
                let scale = (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|sample| sample as f32 / scale))
                    .collect::<Result<Vec<f32>, _>>()
                    .map_err(decode_err)?
            }
        };

        Ok((samples, spec.channels.max(1) as usize, spec.sample_rate))
    }

    fn read_compressed(
        &self,
        path: &Path,
    ) -> Result<(Vec<f32>, usize, u32), FeatureExtractionError> {
        let decode_err = |e: SymphoniaError| FeatureExtractionError::Decode {
            path: path.to_path_buf(),
            source: Box::new(e),
        };

        let file = std::fs::File::open(path).map_err(|source| FeatureExtractionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(decode_err)?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| FeatureExtractionError::Decode {
                path: path.to_path_buf(),
                source: "no audio track found".into(),
            })?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let native_rate = codec_params
            .sample_rate
            .ok_or_else(|| FeatureExtractionError::Decode {
                path: path.to_path_buf(),
                source: "sample rate not specified".into(),
            })?;
        let mut channels = codec_params.channels.map(|c| c.count()).unwrap_or(1);

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(decode_err)?;

        let mut samples = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => return Err(decode_err(e)),
            };

            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    channels = spec.channels.count().max(1);
                    let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buffer.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buffer.samples());
                }
                // A corrupt packet is skipped rather than failing the whole file
                Err(SymphoniaError::DecodeError(e)) => {
                    debug!("Skipping undecodable packet in {}: {}", path.display(), e);
                }
                Err(e) => return Err(decode_err(e)),
            }
        }

        Ok((samples, channels, native_rate))
    }

    /// Sinc resampling of mono samples from `source_rate` to the target rate.
    pub fn resample(
        &self,
        audio: &[f32],
        source_rate: u32,
    ) -> Result<Vec<f32>, FeatureExtractionError> {
        resample_mono(audio, source_rate as f64, self.target_sample_rate as f64)
    }

    /// Writes mono 32-bit float WAV.
    pub fn write_wav<P: AsRef<Path>>(
        &self,
        path: P,
        signal: &AudioSignal,
    ) -> Result<(), hound::Error> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: signal.sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(path, spec)?;
        for &sample in &signal.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()
    }
}

/// Averages interleaved frames down to one channel.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resamples one channel between arbitrary rates.
///
/// The input goes through in one chunk, then the filter delay is flushed and
/// trimmed so the output is aligned with the input and holds
/// `round(len * to_rate / from_rate)` samples.
pub(crate) fn resample_mono(
    audio: &[f32],
    from_rate: f64,
    to_rate: f64,
) -> Result<Vec<f32>, FeatureExtractionError> {
    if audio.is_empty() || from_rate == to_rate {
        return Ok(audio.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = to_rate / from_rate;
    let resample_err = |e: rubato::ResampleError| FeatureExtractionError::Resample(Box::new(e));

    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, audio.len(), 1)
        .map_err(|e| FeatureExtractionError::Resample(Box::new(e)))?;
    let delay = resampler.output_delay();
    let expected = (audio.len() as f64 * ratio).round() as usize;

    let mut output = resampler
        .process(&[audio], None)
        .map_err(resample_err)?
        .pop()
        .unwrap_or_default();

    // Each flush pushes one chunk of silence through the filter
    while output.len() < delay + expected {
        let before = output.len();
        let tail = resampler
            .process_partial::<Vec<f32>>(None, None)
            .map_err(resample_err)?;
        output.extend(tail.into_iter().next().unwrap_or_default());
        if output.len() == before {
            break;
        }
    }

    Ok(output.into_iter().skip(delay).take(expected).collect())
}
