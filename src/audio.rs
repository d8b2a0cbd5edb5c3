//! WAV file helpers shared by the producers and the playback worker.
//!
//! Samples are handled as interleaved f32 in [-1.0, 1.0]; integer WAVs are
//! scaled by `2^(bits-1)` in both directions so an untouched sample
//! survives a read/write cycle bit-exact.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use rodio::Source;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use thiserror::Error;
use tracing::debug;

/// Sample rate every synthesized artifact is normalized to.
pub const PLAYBACK_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("WAV error on {path}: {source}")]
    Wav { path: String, source: hound::Error },
    #[error("Failed to decode {path}: {message}")]
    Decode { path: String, message: String },
    #[error("Resampling failed: {0}")]
    Resample(String),
}

/// Decoded PCM audio.
#[derive(Debug, Clone, PartialEq)]
pub struct Pcm {
    pub channels: u16,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl Pcm {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

fn wav_err(path: &Path) -> impl FnOnce(hound::Error) -> AudioError + '_ {
    move |source| AudioError::Wav {
        path: path.display().to_string(),
        source,
    }
}

/// Read a WAV file, keeping its spec so it can be written back in kind.
pub fn read_wav(path: &Path) -> Result<(hound::WavSpec, Vec<f32>), AudioError> {
    let mut reader = hound::WavReader::open(path).map_err(wav_err(path))?;
    let spec = reader.spec();
    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(wav_err(path))?,
        hound::SampleFormat::Int => {
            let scale = int_scale(spec.bits_per_sample);
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()
                .map_err(wav_err(path))?
        }
    };
    Ok((spec, samples))
}

/// Write interleaved samples with the given spec.
pub fn write_wav(path: &Path, spec: hound::WavSpec, samples: &[f32]) -> Result<(), AudioError> {
    let mut writer = hound::WavWriter::create(path, spec).map_err(wav_err(path))?;
    match spec.sample_format {
        hound::SampleFormat::Float => {
            for &s in samples {
                writer.write_sample(s).map_err(wav_err(path))?;
            }
        }
        hound::SampleFormat::Int => {
            let scale = int_scale(spec.bits_per_sample);
            let (min, max) = (-scale, scale - 1.0);
            for &s in samples {
                let v = (s * scale).round().clamp(min, max) as i32;
                writer.write_sample(v).map_err(wav_err(path))?;
            }
        }
    }
    writer.finalize().map_err(wav_err(path))
}

fn int_scale(bits: u16) -> f32 {
    (1u64 << (bits.clamp(1, 32) - 1)) as f32
}

/// Audible length of a WAV file.
pub fn wav_duration(path: &Path) -> Result<Duration, AudioError> {
    let reader = hound::WavReader::open(path).map_err(wav_err(path))?;
    let rate = reader.spec().sample_rate.max(1);
    Ok(Duration::from_secs_f64(reader.duration() as f64 / rate as f64))
}

/// Decode an encoded audio file (WAV directly, anything else through rodio).
pub fn decode_file(path: &Path) -> Result<Pcm, AudioError> {
    if let Ok((spec, samples)) = read_wav(path) {
        return Ok(Pcm {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            samples,
        });
    }

    let file = File::open(path).map_err(|source| AudioError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let decoder = rodio::Decoder::new(BufReader::new(file)).map_err(|e| AudioError::Decode {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let channels = decoder.channels();
    let sample_rate = decoder.sample_rate();
    let samples: Vec<f32> = decoder.collect();
    debug!(
        "Decoded {} ({channels} ch, {sample_rate} Hz, {} samples)",
        path.display(),
        samples.len()
    );
    Ok(Pcm {
        channels,
        sample_rate,
        samples,
    })
}

/// Resample to `target_rate`; a no-op when the rate already matches.
pub fn resample(pcm: Pcm, target_rate: u32) -> Result<Pcm, AudioError> {
    if pcm.sample_rate == target_rate || pcm.frames() == 0 {
        return Ok(Pcm {
            sample_rate: target_rate,
            ..pcm
        });
    }

    debug!(
        "Resampling from {}Hz to {target_rate}Hz ({} channels)",
        pcm.sample_rate, pcm.channels
    );

    let planar = deinterleave(&pcm.samples, pcm.channels);
    let input_frames = planar[0].len();
    let mut resampler = FastFixedIn::<f32>::new(
        target_rate as f64 / pcm.sample_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        input_frames,
        pcm.channels as usize,
    )
    .map_err(|e| AudioError::Resample(e.to_string()))?;

    let output = resampler
        .process(&planar, None)
        .map_err(|e| AudioError::Resample(e.to_string()))?;

    Ok(Pcm {
        channels: pcm.channels,
        sample_rate: target_rate,
        samples: interleave(output),
    })
}

fn deinterleave(samples: &[f32], channels: u16) -> Vec<Vec<f32>> {
    let channels = channels.max(1) as usize;
    let frames = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (ch, &s) in frame.iter().enumerate() {
            planar[ch].push(s);
        }
    }
    planar
}

fn interleave(planar: Vec<Vec<f32>>) -> Vec<f32> {
    let Some(frames) = planar.first().map(Vec::len) else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(frames * planar.len());
    for i in 0..frames {
        for channel in &planar {
            out.push(channel[i]);
        }
    }
    out
}
