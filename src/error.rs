use std::path::PathBuf;
use thiserror::Error;

use crate::assembly::transcoder::TranscoderError;
use crate::attribution::classifier::ClassifierError;
use crate::synthesis::provider::SynthesisError;

/// Typed error hierarchy for the chapter pipeline.
///
/// Every failure carries the stage it came from (see [`PipelineError::stage`])
/// so callers and the pipeline error log can report where a chapter stopped.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("chapter {0} not found")]
    ChapterNotFound(i64),

    #[error("segment {idx} not found in chapter {chapter_id}")]
    SegmentNotFound { chapter_id: i64, idx: i64 },

    #[error("voice {0} not found")]
    VoiceNotFound(i64),

    #[error("speaker '{speaker}' has dialogue but no assigned voice")]
    MissingVoice { speaker: String },

    #[error("no narrator voice and no default voice configured")]
    NoDefaultVoice,

    #[error("chapter {0} has no segments to assemble")]
    NoSegments(i64),

    #[error("missing cached segment audio: {0} (run a full build first)")]
    MissingSegmentFile(PathBuf),

    #[error("classification failed: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("transcode failed: {0}")]
    Transcoder(#[from] TranscoderError),

    #[error("database error: {0}")]
    Database(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Error-kind tag recorded in the pipeline error log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChapterNotFound(_) => "ChapterNotFound",
            Self::SegmentNotFound { .. } => "SegmentNotFound",
            Self::VoiceNotFound(_) => "VoiceNotFound",
            Self::MissingVoice { .. } => "MissingVoiceAssignment",
            Self::NoDefaultVoice => "MissingVoiceAssignment",
            Self::NoSegments(_) => "NoSegments",
            Self::MissingSegmentFile(_) => "MissingSegmentFile",
            Self::Classifier(_) => "AttributionProviderError",
            Self::Synthesis(_) => "SynthesisProviderError",
            Self::Transcoder(_) => "AssemblySubprocessFailure",
            Self::Database(_) => "DatabaseError",
            Self::Io(_) => "IoError",
            Self::Config(_) => "ConfigError",
        }
    }

    /// Stage tag recorded in the pipeline error log.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::ChapterNotFound(_) | Self::SegmentNotFound { .. } | Self::Database(_) => "store",
            Self::Classifier(_) => "attribution",
            Self::VoiceNotFound(_)
            | Self::MissingVoice { .. }
            | Self::NoDefaultVoice
            | Self::Synthesis(_) => "synthesis",
            Self::NoSegments(_) | Self::MissingSegmentFile(_) | Self::Transcoder(_) => "assembly",
            Self::Io(_) | Self::Config(_) => "setup",
        }
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        PipelineError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Config(e.to_string())
    }
}
