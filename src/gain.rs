//! Per-channel gain shaping for artifacts.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::audio::{self, AudioError};
use crate::command::CommandError;

/// Attenuation used to mute a channel.
pub const MUTE_DB: f32 = -100.0;

/// Stereo decibel adjustment; `(0, 0)` leaves the audio untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GainSpec {
    pub left_db: f32,
    pub right_db: f32,
}

impl GainSpec {
    pub fn new(left_db: f32, right_db: f32) -> Self {
        Self { left_db, right_db }
    }

    /// Build from the optional `gain` pair and `channel` keyword of a command.
    /// Only the combination of both is an error; a gain or channel that can't
    /// be understood leaves the audio untouched.
    pub fn from_request(
        gain: Option<&serde_json::Value>,
        channel: Option<&serde_json::Value>,
    ) -> Result<Self, CommandError> {
        match (gain, channel) {
            (Some(_), Some(_)) => Err(CommandError::GainAndChannel),
            (Some(gain), None) => {
                let pair = gain
                    .as_array()
                    .filter(|a| a.len() == 2)
                    .and_then(|a| Some((a[0].as_f64()?, a[1].as_f64()?)));
                Ok(match pair {
                    Some((left, right)) => Self::new(left as f32, right as f32),
                    None => {
                        warn!("Ignoring gain {gain}, expected [left_db, right_db]");
                        Self::default()
                    }
                })
            }
            (None, Some(channel)) => {
                let spec = channel.as_str().and_then(Self::for_channel);
                Ok(spec.unwrap_or_else(|| {
                    warn!("Ignoring channel {channel}, expected \"left\" or \"right\"");
                    Self::default()
                }))
            }
            (None, None) => Ok(Self::default()),
        }
    }

    /// Keep only the named channel audible.
    pub fn for_channel(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "left" => Some(Self::new(0.0, MUTE_DB)),
            "right" => Some(Self::new(MUTE_DB, 0.0)),
            _ => None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.left_db == 0.0 && self.right_db == 0.0
    }

    fn factors(&self) -> (f32, f32) {
        (db_to_factor(self.left_db), db_to_factor(self.right_db))
    }
}

fn db_to_factor(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Path of the temporary rewrite for `path` (`<stem>_edit.wav`).
fn edit_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}_edit.wav"))
}

/// Apply `spec` to the WAV at `path` in place. Mono input becomes stereo.
pub fn apply_gain(path: &Path, spec: GainSpec) -> Result<(), AudioError> {
    if spec.is_noop() {
        return Ok(());
    }
    debug!("Modifying gain of {} to {spec:?}", path.display());

    let (mut wav_spec, samples) = audio::read_wav(path)?;
    let (left, right) = spec.factors();

    let stereo: Vec<f32> = match wav_spec.channels {
        1 => samples.iter().flat_map(|&s| [s * left, s * right]).collect(),
        _ => {
            let channels = wav_spec.channels as usize;
            samples
                .chunks_exact(channels)
                .flat_map(|frame| [frame[0] * left, frame[1] * right])
                .collect()
        }
    };
    wav_spec.channels = 2;

    let edited = edit_path(path);
    audio::write_wav(&edited, wav_spec, &stereo)?;
    std::fs::rename(&edited, path).map_err(|source| AudioError::Io {
        path: edited.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::test_support::{write_mono_ramp, write_stereo_tone};
    use serde_json::json;

    #[test]
    fn channel_keywords_mute_the_other_side() {
        assert_eq!(GainSpec::for_channel("left").unwrap(), GainSpec::new(0.0, MUTE_DB));
        assert_eq!(GainSpec::for_channel("RIGHT").unwrap(), GainSpec::new(MUTE_DB, 0.0));
        assert!(GainSpec::for_channel("center").is_none());
    }

    #[test]
    fn gain_and_channel_together_are_rejected() {
        let err = GainSpec::from_request(Some(&json!([1, 2])), Some(&json!("left")));
        assert!(matches!(err, Err(CommandError::GainAndChannel)));
    }

    #[test]
    fn unusable_gain_or_channel_falls_back_to_unity() {
        for gain in [json!([1]), json!([1, 2, 3]), json!(["a", 2]), json!(6)] {
            let spec = GainSpec::from_request(Some(&gain), None).unwrap();
            assert!(spec.is_noop(), "{gain}");
        }
        for channel in [json!("center"), json!(1)] {
            let spec = GainSpec::from_request(None, Some(&channel)).unwrap();
            assert!(spec.is_noop(), "{channel}");
        }
    }

    #[test]
    fn gain_pair_is_taken_as_given() {
        let spec = GainSpec::from_request(Some(&json!([-6, 3.5])), None).unwrap();
        assert_eq!(spec, GainSpec::new(-6.0, 3.5));
        assert!(GainSpec::from_request(None, None).unwrap().is_noop());
    }

    #[test]
    fn noop_gain_does_not_touch_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_stereo_tone(&path, 8000, 10, 100, 100);
        let before = std::fs::metadata(&path).unwrap().modified().unwrap();
        apply_gain(&path, GainSpec::default()).unwrap();
        let after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn left_channel_mutes_right_and_leaves_no_edit_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_stereo_tone(&path, 8000, 50, 12000, -9000);

        apply_gain(&path, GainSpec::for_channel("left").unwrap()).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        for frame in samples.chunks_exact(2) {
            assert_eq!(frame[0], 12000);
            assert_eq!(frame[1], 0);
        }
        assert!(!dir.path().join("a_edit.wav").exists());
    }

    #[test]
    fn mono_input_is_upmixed_to_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_mono_ramp(&path, 8000, 400);

        apply_gain(&path, GainSpec::new(MUTE_DB, 0.0)).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples.len(), 800);
        assert!(samples.chunks_exact(2).all(|f| f[0] == 0));
        assert!(samples.chunks_exact(2).any(|f| f[1] != 0));
    }

    #[test]
    fn six_db_roughly_doubles_amplitude() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_stereo_tone(&path, 8000, 10, 1000, 1000);
        apply_gain(&path, GainSpec::new(6.0, 0.0)).unwrap();
        let mut reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert!((1990..=2000).contains(&samples[0]), "left was {}", samples[0]);
        assert_eq!(samples[1], 1000);
    }
}
