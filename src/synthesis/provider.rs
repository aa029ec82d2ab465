//! Synthesis provider implementations.
//!
//! One [`VoiceProvider`] per vendor, selected once at voice-resolution time
//! from the voice's provider tag. Providers return raw audio bytes and know
//! nothing about caching or assembly.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::config::SynthesisConfig;
use crate::database::Voice;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("synthesis request failed: {0}")]
    Request(String),

    #[error("synthesis provider returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Distinct from other failures: the caller may re-chunk and retry.
    #[error("synthesis payload too large ({chars} chars)")]
    PayloadTooLarge { chars: usize },

    #[error("empty audio returned for non-empty text")]
    EmptyAudio,
}

#[async_trait]
pub trait VoiceProvider: Send + Sync {
    /// Synthesize `text` into audio bytes.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError>;
}

/// Build the provider for a voice from its tag.
pub fn provider_for_voice(
    client: &reqwest::Client,
    config: &SynthesisConfig,
    api_key: Option<&str>,
    voice: &Voice,
) -> Box<dyn VoiceProvider> {
    match voice.provider {
        crate::database::ProviderKind::Preset => Box::new(PresetVoice {
            client: client.clone(),
            base_url: config.preset_base_url.clone(),
            voice_name: voice.name.clone(),
            settings_json: voice.settings_json.clone(),
            api_key: api_key.map(|k| k.to_string()),
        }),
        crate::database::ProviderKind::Neural => Box::new(NeuralVoice {
            client: client.clone(),
            base_url: config.neural_base_url.clone(),
            voice_name: voice.name.clone(),
            settings_json: voice.settings_json.clone(),
            api_key: api_key.map(|k| k.to_string()),
            max_chars: config.neural_max_chars,
        }),
    }
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

async fn post_speech(
    client: &reqwest::Client,
    base_url: &str,
    api_key: Option<&str>,
    voice_name: &str,
    settings_json: Option<&str>,
    text: &str,
) -> Result<Vec<u8>, SynthesisError> {
    let settings: serde_json::Value = settings_json
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or(serde_json::Value::Null);

    let url = format!("{}/v1/speech", base_url);
    let mut request = client.post(&url).json(&json!({
        "text": text,
        "voice": voice_name,
        "settings": settings,
    }));
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let response = request
        .send()
        .await
        .map_err(|e| SynthesisError::Request(e.to_string()))?;

    let status = response.status();
    if status.as_u16() == 413 {
        return Err(SynthesisError::PayloadTooLarge { chars: text.chars().count() });
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SynthesisError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| SynthesisError::Request(e.to_string()))?;
    if bytes.is_empty() && !text.trim().is_empty() {
        return Err(SynthesisError::EmptyAudio);
    }
    Ok(bytes.to_vec())
}

/// Preset-catalog provider: text goes straight to the endpoint.
pub struct PresetVoice {
    client: reqwest::Client,
    base_url: String,
    voice_name: String,
    settings_json: Option<String>,
    api_key: Option<String>,
}

#[async_trait]
impl VoiceProvider for PresetVoice {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError> {
        post_speech(
            &self.client,
            &self.base_url,
            self.api_key.as_deref(),
            &self.voice_name,
            self.settings_json.as_deref(),
            text,
        )
        .await
    }
}

/// Neural provider with a provider-side length limit: long text is split on
/// sentence boundaries into chunks under the limit, synthesized
/// independently, and the chunk outputs concatenated.
pub struct NeuralVoice {
    client: reqwest::Client,
    base_url: String,
    voice_name: String,
    settings_json: Option<String>,
    api_key: Option<String>,
    max_chars: usize,
}

#[async_trait]
impl VoiceProvider for NeuralVoice {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError> {
        let chunks = split_into_chunks(text, self.max_chars);
        if chunks.len() > 1 {
            log::info!(
                "Splitting {} chars into {} chunks for neural synthesis",
                text.chars().count(),
                chunks.len()
            );
        }
        let mut audio = Vec::new();
        for chunk in &chunks {
            let bytes = post_speech(
                &self.client,
                &self.base_url,
                self.api_key.as_deref(),
                &self.voice_name,
                self.settings_json.as_deref(),
                chunk,
            )
            .await?;
            audio.extend_from_slice(&bytes);
        }
        Ok(audio)
    }
}

/// Split text into chunks of at most `max_chars`, preferring sentence
/// boundaries and falling back to word boundaries when one sentence alone
/// exceeds the limit.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for sentence in split_sentences(text) {
        let sentence_len = sentence.chars().count();
        if current_len + sentence_len > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if sentence_len > max_chars {
            // A single oversized sentence: hard split on word boundaries.
            for word_chunk in split_words(&sentence, max_chars) {
                let len = word_chunk.chars().count();
                if current_len + len > max_chars && !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                current.push_str(&word_chunk);
                current_len += len;
            }
        } else {
            current.push_str(&sentence);
            current_len += sentence_len;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Split on sentence-ending punctuation, keeping the punctuation and any
/// trailing whitespace with the sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | '\u{2026}') {
            // Absorb closing quotes and whitespace into this sentence.
            while let Some(&next) = chars.peek() {
                if next.is_whitespace() || matches!(next, '"' | '\u{201D}' | '\'' | ')') {
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        sentences.push(current);
    }
    sentences
}

/// Hard word-boundary split for a single oversized sentence.
fn split_words(sentence: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for word in sentence.split_inclusive(char::is_whitespace) {
        let len = word.chars().count();
        if current_len + len > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(word);
        current_len += len;
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = split_into_chunks("Hello there.", 9_000);
        assert_eq!(chunks, vec!["Hello there.".to_string()]);
    }

    #[test]
    fn test_splits_on_sentence_boundaries() {
        let text = "First sentence. Second sentence. Third sentence.";
        let chunks = split_into_chunks(text, 20);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 20, "chunk too long: {:?}", chunk);
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_oversized_sentence_splits_on_words() {
        let text = "word ".repeat(100);
        let chunks = split_into_chunks(&text, 30);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 30);
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_no_characters_lost_in_chunking() {
        let text = format!(
            "{} Then a normal close. {}",
            "An extremely long sentence without any end for a while ".repeat(10),
            "And more text follows here."
        );
        let chunks = split_into_chunks(&text, 80);
        assert_eq!(chunks.concat(), text);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 80);
        }
    }

    #[test]
    fn test_sentence_split_keeps_closing_quotes() {
        let sentences = split_sentences("\"Go away!\" she said. He left.");
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0], "\"Go away!\" ");
        assert_eq!(sentences[1], "she said. ");
        assert_eq!(sentences[2], "He left.");
    }
}
