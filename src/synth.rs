//! Speech synthesis backend.
//!
//! The default backend fetches MP3 audio from the Google Translate TTS
//! endpoint. Long text is split into chunks the endpoint accepts and the
//! returned MP3 streams are concatenated.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use thiserror::Error;
use tracing::debug;

use crate::config::TtsConfig;

/// Longest chunk the endpoint reliably accepts.
const MAX_CHUNK_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum SynthError {
    #[error("Nothing to synthesize")]
    EmptyText,
    #[error("Invalid TTS endpoint: {0}")]
    Url(String),
    #[error("TTS request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("TTS endpoint returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Voice parameters taken from the configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voice {
    pub lang: String,
    pub tld: String,
    pub slow: bool,
}

impl From<&TtsConfig> for Voice {
    fn from(config: &TtsConfig) -> Self {
        Self {
            lang: config.lang.clone(),
            tld: config.tld.clone(),
            slow: config.slow,
        }
    }
}

/// Turns text into encoded (MP3) audio bytes.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &Voice) -> Result<Vec<u8>, SynthError>;
}

pub struct GoogleTts {
    client: Client,
}

impl GoogleTts {
    pub fn new() -> Result<Self, SynthError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    fn chunk_url(&self, chunk: &str, voice: &Voice) -> Result<Url, SynthError> {
        Url::parse_with_params(
            &format!("https://translate.google.{}/translate_tts", voice.tld),
            &[
                ("ie", "UTF-8"),
                ("client", "tw-ob"),
                ("q", chunk),
                ("tl", voice.lang.as_str()),
                ("ttsspeed", if voice.slow { "0.3" } else { "1" }),
            ],
        )
        .map_err(|e| SynthError::Url(e.to_string()))
    }
}

#[async_trait]
impl SpeechSynthesizer for GoogleTts {
    async fn synthesize(&self, text: &str, voice: &Voice) -> Result<Vec<u8>, SynthError> {
        let chunks = split_chunks(text, MAX_CHUNK_CHARS);
        if chunks.is_empty() {
            return Err(SynthError::EmptyText);
        }

        let mut audio = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            debug!("Requesting TTS chunk {}/{} ({} chars)", i + 1, chunks.len(), chunk.len());
            let resp = self.client.get(self.chunk_url(chunk, voice)?).send().await?;
            if !resp.status().is_success() {
                return Err(SynthError::Status(resp.status()));
            }
            audio.extend_from_slice(&resp.bytes().await?);
        }
        Ok(audio)
    }
}

/// Split text on whitespace into chunks of at most `max_chars` characters.
/// Words longer than the limit are hard-split.
fn split_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            chunks.push(word.drain(..max_chars).collect());
        }
        if word.is_empty() {
            continue;
        }
        let needed = if current.is_empty() { word.len() } else { word.len() + 1 };
        if current.chars().count() + needed > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.extend(word);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
