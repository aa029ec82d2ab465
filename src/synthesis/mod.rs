//! Per-segment synthesis with a content-addressed cache.
//!
//! Every segment's audio lives at `chapter_NNN/segment_NNN.mp3` with a JSON
//! sidecar recording the `(speaker, voice, text-hash)` key it was generated
//! from. Synthesis is skipped whenever the recorded key still matches; any
//! mismatch regenerates silently. Stale files are never deleted implicitly.

pub mod provider;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::assembly::transcoder::Transcoder;
use crate::config::{load_env_value, AppConfig, SynthesisConfig};
use crate::database::{Segment, Voice};
use crate::error::PipelineError;
use crate::retry::RetryPolicy;
use provider::{provider_for_voice, VoiceProvider};

/// SHA-256 hex digest of the segment text.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Sidecar metadata recording what a cached segment file was built from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentAudioMeta {
    pub speaker_id: i64,
    pub voice_id: i64,
    pub text_hash: String,
    pub generated_at: String,
}

impl SegmentAudioMeta {
    pub fn matches(&self, speaker_id: i64, voice_id: i64, hash: &str) -> bool {
        self.speaker_id == speaker_id && self.voice_id == voice_id && self.text_hash == hash
    }
}

/// Path layout of the on-disk audio cache. The file names are a persisted
/// contract shared with existing caches and must not change.
#[derive(Debug, Clone)]
pub struct AudioCache {
    root: PathBuf,
}

impl AudioCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chapter_dir(&self, chapter_id: i64) -> PathBuf {
        self.root.join(format!("chapter_{}", chapter_id))
    }

    pub fn segment_path(&self, chapter_id: i64, idx: i64) -> PathBuf {
        self.chapter_dir(chapter_id)
            .join(format!("segment_{:03}.mp3", idx))
    }

    pub fn sidecar_path(&self, chapter_id: i64, idx: i64) -> PathBuf {
        self.chapter_dir(chapter_id)
            .join(format!("segment_{:03}.json", idx))
    }

    /// Pause inserted between segment `idx` and `idx + 1`.
    pub fn pause_path(&self, chapter_id: i64, idx: i64) -> PathBuf {
        self.chapter_dir(chapter_id)
            .join(format!("pause_{:03}.mp3", idx))
    }

    pub fn end_pause_path(&self, chapter_id: i64) -> PathBuf {
        self.chapter_dir(chapter_id).join("end_pause.mp3")
    }

    pub fn end_chapter_path(&self, chapter_id: i64) -> PathBuf {
        self.chapter_dir(chapter_id).join("end_chapter.mp3")
    }

    pub fn after_end_pause_path(&self, chapter_id: i64) -> PathBuf {
        self.chapter_dir(chapter_id).join("after_end_pause.mp3")
    }

    /// Silence clips shared across chapters, cached by duration.
    pub fn silence_path(&self, duration_ms: u64) -> PathBuf {
        self.root
            .join("silence")
            .join(format!("silence_{}.mp3", duration_ms))
    }

    pub fn chapter_output_path(&self, chapter_id: i64) -> PathBuf {
        self.root.join(format!("chapter_{}.mp3", chapter_id))
    }

    pub fn read_meta(&self, chapter_id: i64, idx: i64) -> Option<SegmentAudioMeta> {
        let content = std::fs::read_to_string(self.sidecar_path(chapter_id, idx)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn write_meta(
        &self,
        chapter_id: i64,
        idx: i64,
        meta: &SegmentAudioMeta,
    ) -> Result<(), PipelineError> {
        let path = self.sidecar_path(chapter_id, idx);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(meta)?)?;
        Ok(())
    }

    /// True when the cached file exists and its sidecar still matches the
    /// segment's current `(speaker, voice, text)` key.
    pub fn is_fresh(&self, segment: &Segment, voice_id: i64) -> bool {
        if !self.segment_path(segment.chapter_id, segment.idx).exists() {
            return false;
        }
        match self.read_meta(segment.chapter_id, segment.idx) {
            Some(meta) => meta.matches(segment.speaker_id, voice_id, &text_hash(&segment.text)),
            None => false,
        }
    }
}

pub struct VoiceSynthesizer {
    cache: AudioCache,
    config: SynthesisConfig,
    assets_dir: PathBuf,
    transcoder: Transcoder,
    retry: RetryPolicy,
    client: reqwest::Client,
    api_key: Option<String>,
    /// Provider per voice, resolved once.
    providers: Mutex<HashMap<i64, Arc<dyn VoiceProvider>>>,
}

impl VoiceSynthesizer {
    pub fn new(config: &AppConfig, cache: AudioCache) -> Self {
        let api_key = load_env_value(&config.paths.data_dir, "SYNTHESIS_API_KEY");
        if api_key.is_none() {
            log::info!("No SYNTHESIS_API_KEY in .env - providers will be called unauthenticated");
        }
        Self {
            cache,
            config: config.synthesis.clone(),
            assets_dir: config.paths.assets_dir.clone(),
            transcoder: Transcoder::new(),
            retry: RetryPolicy::from_config(&config.retry),
            client: provider::http_client(),
            api_key,
            providers: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &AudioCache {
        &self.cache
    }

    /// Make sure the segment's audio file exists and matches its current
    /// `(speaker, voice, text)` key, synthesizing only on a miss.
    pub async fn ensure_segment_audio(
        &self,
        segment: &Segment,
        voice: &Voice,
    ) -> Result<PathBuf, PipelineError> {
        let path = self.cache.segment_path(segment.chapter_id, segment.idx);

        if self.cache.is_fresh(segment, voice.id) {
            log::debug!(
                "Cache hit for chapter {} segment {}",
                segment.chapter_id,
                segment.idx
            );
            return Ok(path);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let trimmed = segment.text.trim();
        if trimmed == self.config.pause_marker {
            // Pause markers become generated silence, never a provider call.
            self.transcoder
                .generate_silence(self.config.pause_marker_ms, &path)
                .await?;
        } else if let Some(sound) = &segment.sound {
            // Sound-effect cues copy a static pre-recorded asset.
            let asset = self.assets_dir.join(format!("{}.mp3", sound));
            if !asset.exists() {
                return Err(PipelineError::Config(format!(
                    "sound asset not found: {:?}",
                    asset
                )));
            }
            std::fs::copy(&asset, &path)?;
        } else {
            let provider = self.provider_for(voice);
            log::info!(
                "Synthesizing chapter {} segment {} ({} chars, voice '{}')",
                segment.chapter_id,
                segment.idx,
                segment.text.chars().count(),
                voice.name
            );
            let audio = self
                .retry
                .run("synthesis", || provider.synthesize(&segment.text))
                .await?;
            std::fs::write(&path, audio)?;
        }

        self.cache.write_meta(
            segment.chapter_id,
            segment.idx,
            &SegmentAudioMeta {
                speaker_id: segment.speaker_id,
                voice_id: voice.id,
                text_hash: text_hash(&segment.text),
                generated_at: Utc::now().to_rfc3339(),
            },
        )?;

        Ok(path)
    }

    /// Synthesize a one-off clip (the end-of-chapter announcement) straight
    /// to `out_path`, no sidecar.
    pub async fn synthesize_clip(
        &self,
        text: &str,
        voice: &Voice,
        out_path: &Path,
    ) -> Result<(), PipelineError> {
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let provider = self.provider_for(voice);
        let audio = self
            .retry
            .run("synthesis", || provider.synthesize(text))
            .await?;
        std::fs::write(out_path, audio)?;
        Ok(())
    }

    /// Return the silence clip for a duration, generating it once.
    pub async fn ensure_silence(&self, duration_ms: u64) -> Result<PathBuf, PipelineError> {
        let path = self.cache.silence_path(duration_ms);
        if !path.exists() {
            self.transcoder.generate_silence(duration_ms, &path).await?;
        }
        Ok(path)
    }

    fn provider_for(&self, voice: &Voice) -> Arc<dyn VoiceProvider> {
        let mut providers = self.providers.lock().unwrap();
        providers
            .entry(voice.id)
            .or_insert_with(|| {
                log::debug!(
                    "Resolving {} provider for voice '{}'",
                    voice.provider,
                    voice.name
                );
                Arc::from(provider_for_voice(
                    &self.client,
                    &self.config,
                    self.api_key.as_deref(),
                    voice,
                ))
            })
            .clone()
    }
}
