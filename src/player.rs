//! Playback backends.
//!
//! `PaplayBackend` runs the configured player executable and kills it when
//! the current sub-task is stopped. `SilentBackend` stands in when playback
//! is disabled and waits for the artifact's audible length instead, so
//! downstream timing is preserved.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::audio::{self, AudioError};
use crate::cancel::CancellationController;
use crate::config::AudioConfig;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Failed to launch {}: {source}", .player.display())]
    Spawn {
        player: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Audio(#[from] AudioError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Interrupted,
}

#[async_trait]
pub trait PlaybackBackend: Send + Sync {
    /// Play `path` to completion, or until stop-current is raised.
    async fn play(
        &self,
        path: &Path,
        cancel: &CancellationController,
    ) -> Result<PlaybackOutcome, PlaybackError>;
}

/// Pick the backend the audio configuration asks for.
pub fn from_config(config: &AudioConfig) -> Box<dyn PlaybackBackend> {
    if config.disable {
        Box::new(SilentBackend)
    } else {
        Box::new(PaplayBackend::new(config.player.clone(), config.device.clone()))
    }
}

pub struct PaplayBackend {
    player: PathBuf,
    device: Option<String>,
}

impl PaplayBackend {
    pub fn new(player: PathBuf, device: Option<String>) -> Self {
        Self { player, device }
    }

    fn command(&self, path: &Path) -> Command {
        let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut cmd = Command::new(&self.player);
        cmd.arg("-p");
        if let Some(device) = &self.device {
            cmd.arg("-d").arg(device);
        }
        cmd.arg(absolute).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl PlaybackBackend for PaplayBackend {
    async fn play(
        &self,
        path: &Path,
        cancel: &CancellationController,
    ) -> Result<PlaybackOutcome, PlaybackError> {
        let mut child = self
            .command(path)
            .spawn()
            .map_err(|source| PlaybackError::Spawn {
                player: self.player.clone(),
                source,
            })?;

        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) if !status.success() => {
                        debug!("{} exited with {status}", self.player.display());
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Waiting for {} failed: {e}", self.player.display()),
                }
                Ok(PlaybackOutcome::Finished)
            }
            _ = cancel.current_stopped() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to terminate {}: {e}", self.player.display());
                }
                Ok(PlaybackOutcome::Interrupted)
            }
        }
    }
}

pub struct SilentBackend;

#[async_trait]
impl PlaybackBackend for SilentBackend {
    async fn play(
        &self,
        path: &Path,
        cancel: &CancellationController,
    ) -> Result<PlaybackOutcome, PlaybackError> {
        let duration = audio::wav_duration(path)?;
        warn!(
            "Skipping playback as requested by config. Waiting for {:.3} seconds.",
            duration.as_secs_f64()
        );
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(PlaybackOutcome::Finished),
            _ = cancel.current_stopped() => {
                info!("Simulated playback interrupted");
                Ok(PlaybackOutcome::Interrupted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::test_support::write_stereo_tone;
    use crate::queue::PriorityTaskQueue;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn controller() -> CancellationController {
        CancellationController::new(Arc::new(PriorityTaskQueue::new(4)), false)
    }

    #[tokio::test]
    async fn silent_backend_waits_for_the_audible_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_stereo_tone(&path, 8000, 2000, 1, 1);

        let started = Instant::now();
        let outcome = SilentBackend.play(&path, &controller()).await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Finished);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn silent_backend_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_stereo_tone(&path, 8000, 80_000, 1, 1);
        let cancel = controller();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.stop_current();
        });

        let started = Instant::now();
        let outcome = SilentBackend.play(&path, &cancel).await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn missing_player_is_a_spawn_error() {
        let backend = PaplayBackend::new(PathBuf::from("/nonexistent/paplay"), None);
        let err = backend.play(Path::new("/tmp/x.wav"), &controller()).await;
        assert!(matches!(err, Err(PlaybackError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_current_kills_the_player_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let player = dir.path().join("fake-player");
        std::fs::write(&player, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&player, std::fs::Permissions::from_mode(0o755)).unwrap();
        let wav = dir.path().join("a.wav");
        write_stereo_tone(&wav, 8000, 10, 1, 1);

        let backend = PaplayBackend::new(player, Some("sink0".into()));
        let cancel = controller();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.stop_current();
        });

        let started = Instant::now();
        let outcome = backend.play(&wav, &cancel).await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn command_passes_device_and_absolute_path() {
        let backend = PaplayBackend::new(PathBuf::from("/usr/bin/paplay"), Some("sink0".into()));
        let cmd = backend.command(Path::new("relative.wav"));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(&args[..3], &["-p", "-d", "sink0"]);
        assert!(args[3].ends_with("relative.wav"));
    }
}
