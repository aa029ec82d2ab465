//! Application configuration.
//!
//! Loaded from a `config.yaml` next to the data directory, with API keys
//! pulled from a `.env` file so they stay out of the YAML.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub segmenter: SegmenterConfig,
    pub attribution: AttributionConfig,
    pub synthesis: SynthesisConfig,
    pub retry: RetryConfig,
    /// Alias → canonical character name. Every alias of a fictional entity
    /// maps to exactly one canonical name.
    pub aliases: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for the database and chapter audio caches.
    pub data_dir: PathBuf,
    /// Static sound-effect assets (`{cue}.mp3`).
    pub assets_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fablecast");
        Self {
            assets_dir: base.join("assets"),
            data_dir: base,
        }
    }
}

impl PathsConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("fablecast.db")
    }

    pub fn audio_root(&self) -> PathBuf {
        self.data_dir.join("audio")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Alert-cue prefixes; a line starting with one (any case, optionally
    /// quote-wrapped) becomes its own narration segment.
    pub alert_cues: Vec<String>,
    /// In-world proper nouns that always render in quotes and must never be
    /// treated as dialogue on their own.
    pub special_quoted_names: Vec<String>,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            alert_cues: vec!["ding!".to_string()],
            special_quoted_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    pub base_url: String,
    pub model: String,
    /// Spans per classification request.
    pub batch_size: usize,
    /// Neighboring spans included on each side of a span's context window.
    pub context_spans: usize,
    /// Per-span truncation length inside a context window.
    pub context_span_chars: usize,
    /// Delay between sequential batch calls.
    pub batch_delay_ms: u64,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            batch_size: 20,
            context_spans: 5,
            context_span_chars: 200,
            batch_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub preset_base_url: String,
    pub neural_base_url: String,
    /// Provider-side character limit for one neural request; longer text is
    /// chunked on sentence boundaries.
    pub neural_max_chars: usize,
    /// Token that produces a silence clip instead of a provider call.
    pub pause_marker: String,
    /// Duration of the pause-marker silence clip.
    pub pause_marker_ms: u64,
    /// Voice name used for the end-of-chapter clip when no narrator exists.
    pub default_voice: String,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            preset_base_url: "https://api.voicereader.example".to_string(),
            neural_base_url: "https://api.neuralspeech.example".to_string(),
            neural_max_chars: 9_000,
            pause_marker: "[pause]".to_string(),
            pause_marker_ms: 1_000,
            default_voice: "matthew".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl AppConfig {
    /// Load from a YAML file, or fall back to defaults when the file does
    /// not exist yet.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        if !path.exists() {
            log::info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("{:?}: {}", path, e)))
    }

    /// Resolve the canonical name for a (possibly aliased) character name.
    pub fn canonical_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(|s| s.as_str()).unwrap_or(name)
    }
}

/// Load a value from the `.env` file in the data directory by key name.
pub fn load_env_value(data_dir: &Path, key: &str) -> Option<String> {
    let env_path = data_dir.join(".env");
    let prefix = format!("{}=", key);
    if let Ok(content) = std::fs::read_to_string(&env_path) {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with(&prefix) {
                let value = trimmed[prefix.len()..]
                    .trim()
                    .trim_matches('"')
                    .trim_matches('\'');
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.attribution.batch_size, 20);
        assert_eq!(cfg.attribution.context_spans, 5);
        assert_eq!(cfg.synthesis.neural_max_chars, 9_000);
    }

    #[test]
    fn test_canonical_name_resolves_aliases() {
        let mut cfg = AppConfig::default();
        cfg.aliases
            .insert("Jakey".to_string(), "Jake".to_string());
        assert_eq!(cfg.canonical_name("Jakey"), "Jake");
        assert_eq!(cfg.canonical_name("Jake"), "Jake");
        assert_eq!(cfg.canonical_name("Mira"), "Mira");
    }

    #[test]
    fn test_load_env_value() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".env"),
            "NEURAL_API_KEY=\"abc123\"\nOTHER=x\n",
        )
        .unwrap();
        assert_eq!(
            load_env_value(temp.path(), "NEURAL_API_KEY"),
            Some("abc123".to_string())
        );
        assert_eq!(load_env_value(temp.path(), "MISSING"), None);
    }
}
