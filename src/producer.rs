//! Artifact producers: synthesize or copy one audio file per artifact.
//!
//! Producers run as tokio tasks on a pool bounded by a semaphore. Each one
//! owns the sending half of a watch channel; the playback worker holds the
//! receiving half inside an [`ArtifactHandle`] and never touches the file
//! while the status is still `Pending`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::{self, AudioError, PLAYBACK_SAMPLE_RATE};
use crate::config::Config;
use crate::gain::{self, GainSpec};
use crate::synth::{SpeechSynthesizer, SynthError, Voice};

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Sound file {} does not exist", .0.display())]
    MissingSound(PathBuf),
    #[error(transparent)]
    Synth(#[from] SynthError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Producer task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    Pending,
    Ready,
    Failed,
}

/// What a producer makes an artifact from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// Text to synthesize.
    Speech(String),
    /// Name of a `<name>.wav` in the sound library.
    Sound(String),
}

/// Outcome of waiting for a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    Failed,
    TimedOut,
}

/// Read side of an artifact: its name, file and production status.
#[derive(Debug)]
pub struct ArtifactHandle {
    name: String,
    path: PathBuf,
    status: watch::Receiver<ArtifactStatus>,
}

impl ArtifactHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until the producer finishes, for at most `limit`.
    pub async fn wait(&mut self, limit: Duration) -> WaitOutcome {
        let finished = tokio::time::timeout(
            limit,
            self.status.wait_for(|s| *s != ArtifactStatus::Pending),
        )
        .await
        .map(|r| r.map(|s| *s));
        match finished {
            Ok(Ok(ArtifactStatus::Ready)) => WaitOutcome::Ready,
            Ok(_) => WaitOutcome::Failed,
            Err(_) => WaitOutcome::TimedOut,
        }
    }

    /// Give up on this artifact. Its file is removed once the producer
    /// finishes, unless files are kept.
    pub fn discard(mut self, keep_files: bool) {
        if keep_files {
            return;
        }
        tokio::spawn(async move {
            let _ = self
                .status
                .wait_for(|s| *s != ArtifactStatus::Pending)
                .await
                .map(|s| *s);
            remove_if_exists(&self.path).await;
            debug!("Swept discarded artifact {}", self.name);
        });
    }
}

pub(crate) async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete {}: {e}", path.display()),
    }
}

/// Starts producers on a bounded pool.
pub struct ArtifactProducer {
    config: Arc<Config>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    permits: Arc<Semaphore>,
}

impl ArtifactProducer {
    pub fn new(config: Arc<Config>, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        let permits = Arc::new(Semaphore::new(config.playback.max_producers));
        Self {
            config,
            synthesizer,
            permits,
        }
    }

    /// Library path of a pre-recorded sound.
    pub fn sound_path(&self, name: &str) -> PathBuf {
        self.config.audio.sounds_path.join(format!("{name}.wav"))
    }

    /// Start producing one artifact in the background and return its handle.
    pub fn dispatch(&self, source: ArtifactSource, gain: GainSpec) -> ArtifactHandle {
        let name = Uuid::new_v4().to_string();
        let path = self.config.audio.temp_path.join(format!("{name}.wav"));
        let (tx, rx) = watch::channel(ArtifactStatus::Pending);

        let job = Job {
            name: name.clone(),
            path: path.clone(),
            source,
            gain,
            config: Arc::clone(&self.config),
            synthesizer: Arc::clone(&self.synthesizer),
        };
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                let _ = tx.send(ArtifactStatus::Failed);
                return;
            };
            match job.run().await {
                Ok(()) => {
                    debug!("Artifact {} ready", job.name);
                    let _ = tx.send(ArtifactStatus::Ready);
                }
                Err(e) => {
                    warn!("Producer for artifact {} failed: {e}", job.name);
                    job.cleanup_partial().await;
                    let _ = tx.send(ArtifactStatus::Failed);
                }
            }
        });

        ArtifactHandle {
            name,
            path,
            status: rx,
        }
    }
}

struct Job {
    name: String,
    path: PathBuf,
    source: ArtifactSource,
    gain: GainSpec,
    config: Arc<Config>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl Job {
    fn encoded_path(&self) -> PathBuf {
        self.path.with_extension("mp3")
    }

    async fn run(&self) -> Result<(), ProducerError> {
        match &self.source {
            ArtifactSource::Speech(text) => self.synthesize(text).await?,
            ArtifactSource::Sound(sound) => self.copy_sound(sound).await?,
        }

        if !self.gain.is_noop() {
            let path = self.path.clone();
            let spec = self.gain;
            blocking(move || gain::apply_gain(&path, spec).map_err(ProducerError::from)).await?;
        }
        Ok(())
    }

    async fn synthesize(&self, text: &str) -> Result<(), ProducerError> {
        debug!("Requesting TTS for artifact {}", self.name);
        let voice = Voice::from(&self.config.tts);
        let encoded = self.synthesizer.synthesize(text, &voice).await?;

        let encoded_path = self.encoded_path();
        tokio::fs::write(&encoded_path, &encoded)
            .await
            .map_err(|source| ProducerError::Io {
                path: encoded_path.clone(),
                source,
            })?;

        let wav_path = self.path.clone();
        let keep_file = self.config.audio.keep_file;
        blocking(move || {
            let pcm = audio::resample(audio::decode_file(&encoded_path)?, PLAYBACK_SAMPLE_RATE)?;
            let spec = hound::WavSpec {
                channels: pcm.channels,
                sample_rate: pcm.sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            audio::write_wav(&wav_path, spec, &pcm.samples)?;
            if !keep_file {
                debug!("Deleting intermediate {}", encoded_path.display());
                std::fs::remove_file(&encoded_path).map_err(|source| ProducerError::Io {
                    path: encoded_path.clone(),
                    source,
                })?;
            }
            Ok(())
        })
        .await?;

        info!("Synthesized artifact {} ({} chars)", self.name, text.chars().count());
        Ok(())
    }

    async fn copy_sound(&self, sound: &str) -> Result<(), ProducerError> {
        let source = self.config.audio.sounds_path.join(format!("{sound}.wav"));
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(ProducerError::MissingSound(source));
        }
        tokio::fs::copy(&source, &self.path)
            .await
            .map_err(|e| ProducerError::Io {
                path: source.clone(),
                source: e,
            })?;
        debug!("Copied {} to {}", source.display(), self.path.display());
        Ok(())
    }

    async fn cleanup_partial(&self) {
        if self.config.audio.keep_file {
            return;
        }
        let stem = self.path.file_stem().map(|s| s.to_string_lossy().into_owned());
        remove_if_exists(&self.path).await;
        remove_if_exists(&self.encoded_path()).await;
        if let Some(stem) = stem {
            remove_if_exists(&self.path.with_file_name(format!("{stem}_edit.wav"))).await;
        }
    }
}

async fn blocking<F>(f: F) -> Result<(), ProducerError>
where
    F: FnOnce() -> Result<(), ProducerError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProducerError::Join(e.to_string()))?
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Synthesizer that returns a short WAV after an optional delay.
    pub struct FakeSynth {
        pub delay: Duration,
        pub frames: usize,
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl FakeSynth {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                frames: 2400,
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Duration::ZERO)
            }
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynth {
        async fn synthesize(&self, _text: &str, _voice: &Voice) -> Result<Vec<u8>, SynthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(SynthError::EmptyText);
            }
            Ok(crate::audio::test_support::wav_bytes(24_000, self.frames))
        }
    }

    pub fn test_config(sounds: &Path, temp: &Path) -> Config {
        let mut config = Config::default();
        config.audio.sounds_path = sounds.to_path_buf();
        config.audio.temp_path = temp.to_path_buf();
        config.audio.disable = true;
        config
    }
}
