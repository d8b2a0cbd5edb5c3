//! tts-announcer: prioritized text-to-speech and sound announcements.

mod api;
mod audio;
mod cancel;
mod command;
mod config;
mod gain;
mod player;
mod producer;
mod queue;
mod synth;
mod worker;

use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use api::{StatusBoard, StatusPublisher};
use cancel::CancellationController;
use command::CommandInterpreter;
use producer::ArtifactProducer;
use queue::PriorityTaskQueue;
use worker::PlaybackWorker;

#[derive(Parser, Debug)]
#[command(name = "tts-announcer", about = "Prioritized TTS and sound announcement service")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write a default configuration to this path (if none exists) and exit
    #[arg(long, value_name = "PATH")]
    config_example: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Prefix of the command and status routes
    #[arg(long)]
    base_topic: Option<String>,

    /// Disable heartbeat
    #[arg(long)]
    no_heartbeat: bool,

    /// Skip playback and only wait for the audio length
    #[arg(long)]
    audio_disable: bool,

    /// PulseAudio sink to play on
    #[arg(long)]
    audio_device: Option<String>,

    /// Keep generated audio files after playback
    #[arg(long)]
    audio_keep_file: bool,

    #[arg(long)]
    tts_lang: Option<String>,

    #[arg(long)]
    tts_tld: Option<String>,

    /// Speak slowly
    #[arg(long)]
    tts_slow: bool,

    /// critical, error, warning, info or debug
    #[arg(long)]
    log_level: Option<String>,

    /// Colored log output
    #[arg(long)]
    log_color: bool,
}

impl Args {
    fn apply(self, config: &mut config::Config) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(username) = self.username {
            config.server.username = username;
        }
        if let Some(password) = self.password {
            config.server.password = password;
        }
        if let Some(base_topic) = self.base_topic {
            config.server.base_topic = base_topic;
        }
        if self.no_heartbeat {
            config.server.heartbeat = false;
        }
        if self.audio_disable {
            config.audio.disable = true;
        }
        if let Some(device) = self.audio_device {
            config.audio.device = Some(device);
        }
        if self.audio_keep_file {
            config.audio.keep_file = true;
        }
        if let Some(lang) = self.tts_lang {
            config.tts.lang = lang;
        }
        if let Some(tld) = self.tts_tld {
            config.tts.tld = tld;
        }
        if self.tts_slow {
            config.tts.slow = true;
        }
        if let Some(level) = self.log_level {
            config.log.level = level.to_ascii_lowercase();
        }
        if self.log_color {
            config.log.color = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = Args::parse();

    if let Some(path) = args.config_example.take() {
        if path.exists() {
            println!("{} already exists, leaving it alone", path.display());
        } else {
            config::Config::write_example(&path)?;
            println!("Wrote example configuration to {}", path.display());
        }
        return Ok(());
    }

    let mut config = config::Config::load(args.config.as_deref())?;
    config.apply_env(std::env::vars())?;
    args.apply(&mut config);
    config.validate()?;

    // RUST_LOG wins over the configured level; noisy HTTP/decoder crates stay quiet
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,reqwest=warn,symphonia=warn",
            config.log.filter_level()
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.log.color)
        .init();

    info!("tts-announcer starting");
    info!(
        "Voice: lang={} tld={} slow={}; audio disabled: {}",
        config.tts.lang, config.tts.tld, config.tts.slow, config.audio.disable
    );

    let config = Arc::new(config);
    let synthesizer = Arc::new(synth::GoogleTts::new()?);
    let producer = Arc::new(ArtifactProducer::new(config.clone(), synthesizer));
    let queue = Arc::new(PriorityTaskQueue::new(config.playback.queue_capacity));
    info!(
        "Queue holds {} batches; {} producers; producer timeout {:?}",
        queue.capacity(),
        config.playback.max_producers,
        config.playback.producer_timeout()
    );
    let cancel = CancellationController::new(queue.clone(), config.audio.keep_file);
    let interpreter = Arc::new(CommandInterpreter::new(
        producer,
        queue.clone(),
        cancel.clone(),
        config.audio.keep_file,
    ));

    let worker = PlaybackWorker::new(
        queue,
        cancel.clone(),
        player::from_config(&config.audio),
        &config,
    );
    let worker = tokio::spawn(worker.run());

    let board = Arc::new(StatusBoard::default());
    let base_topic = config.server.base_topic.clone();
    board.publish(&api::status_topic(&base_topic), api::ONLINE.into());

    if config.server.heartbeat {
        tokio::spawn(api::heartbeat(
            board.clone(),
            api::heartbeat_topic(&base_topic),
            Duration::from_secs(config.server.heartbeat_interval),
            cancel.program_token().clone(),
        ));
    }

    tokio::spawn(watch_signals(cancel.clone()));

    let state = api::ApiState::new(interpreter, board.clone(), &config.server);
    let server = api::serve(&config.server, state, cancel.program_token().clone());
    let served = supervise(server, worker, &cancel).await;

    board.publish(&api::status_topic(&base_topic), api::OFFLINE.into());
    info!("tts-announcer stopped");

    served?;
    Ok(())
}

/// Run the server until it stops. A worker that ends first stops the program.
async fn supervise<F>(
    server: F,
    mut worker: JoinHandle<()>,
    cancel: &CancellationController,
) -> std::io::Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(server);
    let finished = tokio::select! {
        served = &mut server => Finished::Server(served),
        joined = &mut worker => Finished::Worker(joined),
    };

    match finished {
        Finished::Server(served) => {
            if let Err(e) = &served {
                error!("HTTP server failed: {e}");
            }
            cancel.stop_program();
            if let Err(e) = worker.await {
                warn!("Playback worker ended abnormally: {e}");
            }
            served
        }
        Finished::Worker(joined) => {
            match joined {
                Ok(()) => warn!("Playback worker stopped, shutting down"),
                Err(e) => error!("Playback worker ended abnormally: {e}"),
            }
            cancel.stop_program();
            server.await
        }
    }
}

enum Finished {
    Server(std::io::Result<()>),
    Worker(Result<(), JoinError>),
}

/// Turn termination signals into a program stop.
async fn watch_signals(cancel: CancellationController) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut term, mut hup) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(term), Ok(hup)) => (term, hup),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Could not install signal handlers: {e}");
                let _ = tokio::signal::ctrl_c().await;
                info!("Interrupted, shutting down");
                cancel.stop_program();
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
            _ = term.recv() => info!("Received SIGTERM, shutting down"),
            _ = hup.recv() => info!("Received SIGHUP, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Interrupted, shutting down");
    }

    cancel.stop_program();
}
