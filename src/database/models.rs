use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stage of a chapter. Stages advance monotonically; invalidation
/// is expressed through timestamp ordering, not by resetting earlier stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStage {
    Scraped,
    SpeakersIdentified,
    AudioProcessed,
    Published,
}

impl std::fmt::Display for ChapterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scraped => write!(f, "scraped"),
            Self::SpeakersIdentified => write!(f, "speakers_identified"),
            Self::AudioProcessed => write!(f, "audio_processed"),
            Self::Published => write!(f, "published"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    Narration,
    Dialogue,
    Thought,
    Announcement,
    SoundEffect,
}

impl Default for SegmentType {
    fn default() -> Self {
        Self::Narration
    }
}

impl std::fmt::Display for SegmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Narration => write!(f, "narration"),
            Self::Dialogue => write!(f, "dialogue"),
            Self::Thought => write!(f, "thought"),
            Self::Announcement => write!(f, "announcement"),
            Self::SoundEffect => write!(f, "sound_effect"),
        }
    }
}

impl From<String> for SegmentType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "narration" => Self::Narration,
            "dialogue" => Self::Dialogue,
            "thought" => Self::Thought,
            "announcement" => Self::Announcement,
            "sound_effect" => Self::SoundEffect,
            _ => Self::Narration,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: i64,
    pub title: String,
    pub raw_text: String,
    pub scraped_at: DateTime<Utc>,
    pub speakers_identified_at: Option<DateTime<Utc>>,
    pub audio_processed_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub audio_path: Option<String>,
    pub audio_duration_secs: Option<f64>,
    pub audio_size_bytes: Option<i64>,
}

impl Chapter {
    /// Attribution after audio means the audio is stale and the next build
    /// must regenerate, even though `audio_processed_at` is still set.
    pub fn audio_is_stale(&self) -> bool {
        match (self.speakers_identified_at, self.audio_processed_at) {
            (Some(identified), Some(processed)) => identified > processed,
            _ => false,
        }
    }

    pub fn stage(&self) -> ChapterStage {
        if self.published_at.is_some() {
            ChapterStage::Published
        } else if self.audio_processed_at.is_some() && !self.audio_is_stale() {
            ChapterStage::AudioProcessed
        } else if self.speakers_identified_at.is_some() {
            ChapterStage::SpeakersIdentified
        } else {
            ChapterStage::Scraped
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub id: i64,
    pub title: String,
    pub stage: ChapterStage,
    pub audio_duration_secs: Option<f64>,
}

/// One ordered, typed, speaker-attributed span of a chapter's text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub chapter_id: i64,
    /// Unique per chapter; defines playback order.
    pub idx: i64,
    /// Exact substring of the chapter text, whitespace-preserving.
    pub text: String,
    pub segment_type: SegmentType,
    pub speaker_id: i64,
    /// Optional sound cue tag (e.g. a chime) for sound-effect segments.
    pub sound: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaker {
    pub id: i64,
    pub name: String,
    pub voice_id: Option<i64>,
    pub is_narrator: bool,
}

/// Synthesis provider behind a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Preset,
    Neural,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preset => write!(f, "preset"),
            Self::Neural => write!(f, "neural"),
        }
    }
}

impl From<String> for ProviderKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "neural" => Self::Neural,
            _ => Self::Preset,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voice {
    pub id: i64,
    pub name: String,
    pub provider: ProviderKind,
    /// Provider-specific settings blob.
    pub settings_json: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedChapter {
    pub id: i64,
    pub chapter_id: i64,
    pub status: String,
    pub added_at: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineErrorRecord {
    pub id: i64,
    pub stage: String,
    pub chapter_id: Option<i64>,
    pub error_type: String,
    pub message: String,
    pub created_at: String,
    pub resolved: bool,
}
