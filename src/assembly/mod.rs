//! Chapter assembly: pause policy, playlist construction, and the two-pass
//! transcode that turns cached segment files into one normalized chapter
//! file.
//!
//! Segments synthesized by different providers arrive at different sample
//! rates; single-pass concatenation of such inputs is unreliable, so pass 1
//! resamples everything while concatenating and pass 2 loudness-normalizes
//! the intermediate into the final output.

pub mod transcoder;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::database::{Database, Segment, SegmentType, Voice};
use crate::error::PipelineError;
use crate::synthesis::VoiceSynthesizer;
use transcoder::{EncodeProgress, Transcoder};

// Pause policy durations (ms)
const ANNOUNCEMENT_PAUSE_MS: u64 = 1_000;
const DIALOGUE_TO_NARRATION_PAUSE_MS: u64 = 750;
const SPEAKER_CHANGE_PAUSE_MS: u64 = 500;
const DEFAULT_PAUSE_MS: u64 = 300;
const END_PAUSE_MS: u64 = 2_000;

const END_CHAPTER_TEXT: &str = "End of chapter.";

/// Pause duration between two consecutive segments. Precedence order
/// matters: the first matching rule wins.
pub fn pause_between(current: &Segment, next: &Segment) -> u64 {
    let is_alert = |t: SegmentType| {
        matches!(t, SegmentType::Announcement | SegmentType::SoundEffect)
    };
    if is_alert(current.segment_type) || is_alert(next.segment_type) {
        return ANNOUNCEMENT_PAUSE_MS;
    }
    if current.segment_type == SegmentType::Dialogue
        && next.segment_type == SegmentType::Narration
    {
        return DIALOGUE_TO_NARRATION_PAUSE_MS;
    }
    if current.speaker_id != next.speaker_id {
        return SPEAKER_CHANGE_PAUSE_MS;
    }
    DEFAULT_PAUSE_MS
}

#[derive(Debug, Clone, Serialize)]
pub struct AssembledAudio {
    pub path: PathBuf,
    pub duration_secs: f64,
    pub size_bytes: i64,
}

/// How the playlist may be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildMode {
    /// Cached files expected to exist (synthesis ran upstream); the
    /// end-of-chapter clip may still be synthesized if absent.
    Full,
    /// Strictly from cache: no synthesis provider call of any kind; a
    /// missing file is fatal.
    CacheOnly,
    /// From cache, but missing files are recorded and skipped instead of
    /// failing; intermediates are kept for inspection.
    Diagnostic,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssemblyEvent {
    pub pass: String,
    pub elapsed_secs: f64,
}

/// Per-file findings from a diagnostic merge.
#[derive(Debug, Clone, Serialize)]
pub struct FileDiagnostic {
    pub role: String,
    pub path: PathBuf,
    pub exists: bool,
    pub size_bytes: u64,
    pub duration_secs: Option<f64>,
    pub format: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub chapter_id: i64,
    pub files: Vec<FileDiagnostic>,
    pub intermediate_path: PathBuf,
    pub output_path: PathBuf,
    pub output_duration_secs: f64,
    pub missing_files: usize,
}

struct PlaylistEntry {
    role: String,
    path: PathBuf,
}

pub struct AssemblyEngine {
    db: Arc<Database>,
    synthesizer: Arc<VoiceSynthesizer>,
    transcoder: Transcoder,
    default_voice_name: String,
}

impl AssemblyEngine {
    pub fn new(config: &AppConfig, db: Arc<Database>, synthesizer: Arc<VoiceSynthesizer>) -> Self {
        Self {
            db,
            synthesizer,
            transcoder: Transcoder::new(),
            default_voice_name: config.synthesis.default_voice.clone(),
        }
    }

    /// Build the final chapter audio from cached segment files.
    pub async fn assemble(
        &self,
        chapter_id: i64,
        progress: Option<mpsc::Sender<AssemblyEvent>>,
    ) -> Result<AssembledAudio, PipelineError> {
        self.build(chapter_id, BuildMode::Full, progress).await
    }

    /// Reassemble strictly from cache; never touches a synthesis provider.
    pub async fn rebuild_from_cache(
        &self,
        chapter_id: i64,
        progress: Option<mpsc::Sender<AssemblyEvent>>,
    ) -> Result<AssembledAudio, PipelineError> {
        self.build(chapter_id, BuildMode::CacheOnly, progress).await
    }

    async fn build(
        &self,
        chapter_id: i64,
        mode: BuildMode,
        progress: Option<mpsc::Sender<AssemblyEvent>>,
    ) -> Result<AssembledAudio, PipelineError> {
        let playlist = self.build_playlist(chapter_id, mode).await?;
        let inputs: Vec<PathBuf> = playlist.iter().map(|e| e.path.clone()).collect();

        let cache = self.synthesizer.cache();
        let intermediate = cache
            .chapter_dir(chapter_id)
            .join(format!("merge_{}.mp3", Uuid::new_v4()));
        let output = cache.chapter_output_path(chapter_id);

        let encode_tx = bridge_progress(progress);
        self.transcoder
            .concat_resample(&inputs, &intermediate, encode_tx.clone())
            .await?;
        self.transcoder
            .loudness_normalize(&intermediate, &output, encode_tx)
            .await?;

        let _ = std::fs::remove_file(&intermediate);

        let info = self.transcoder.probe(&output).await?;
        let size_bytes = std::fs::metadata(&output)?.len() as i64;
        log::info!(
            "Assembled chapter {}: {:.1}s, {} bytes",
            chapter_id,
            info.duration_secs,
            size_bytes
        );

        Ok(AssembledAudio {
            path: output,
            duration_secs: info.duration_secs,
            size_bytes,
        })
    }

    /// Same build as [`assemble`], recording per-file diagnostics and
    /// keeping the intermediate file. Never synthesizes; missing files are
    /// reported, not fatal.
    pub async fn debug_merge(&self, chapter_id: i64) -> Result<MergeReport, PipelineError> {
        let playlist = self.build_playlist(chapter_id, BuildMode::Diagnostic).await?;

        let mut files = Vec::with_capacity(playlist.len());
        let mut existing: Vec<PathBuf> = Vec::new();
        let mut missing = 0usize;

        for entry in &playlist {
            let mut diag = FileDiagnostic {
                role: entry.role.clone(),
                path: entry.path.clone(),
                exists: entry.path.exists(),
                size_bytes: 0,
                duration_secs: None,
                format: None,
                warnings: Vec::new(),
            };
            if diag.exists {
                diag.size_bytes = std::fs::metadata(&entry.path).map(|m| m.len()).unwrap_or(0);
                if diag.size_bytes == 0 {
                    diag.warnings.push("file is empty".to_string());
                }
                match self.transcoder.probe(&entry.path).await {
                    Ok(info) => {
                        if info.duration_secs == 0.0 {
                            diag.warnings.push("zero duration".to_string());
                        }
                        diag.duration_secs = Some(info.duration_secs);
                        diag.format = Some(info.format_name);
                    }
                    Err(e) => diag.warnings.push(format!("probe failed: {}", e)),
                }
                existing.push(entry.path.clone());
            } else {
                missing += 1;
                diag.warnings.push("file missing".to_string());
            }
            files.push(diag);
        }

        let cache = self.synthesizer.cache();
        let intermediate = cache
            .chapter_dir(chapter_id)
            .join(format!("merge_{}.mp3", Uuid::new_v4()));
        let output = cache.chapter_output_path(chapter_id);

        self.transcoder
            .concat_resample(&existing, &intermediate, None)
            .await?;
        self.transcoder
            .loudness_normalize(&intermediate, &output, None)
            .await?;
        let info = self.transcoder.probe(&output).await?;

        log::info!(
            "Debug merge for chapter {}: {} files ({} missing), output {:.1}s",
            chapter_id,
            files.len(),
            missing,
            info.duration_secs
        );

        Ok(MergeReport {
            chapter_id,
            files,
            intermediate_path: intermediate,
            output_path: output,
            output_duration_secs: info.duration_secs,
            missing_files: missing,
        })
    }

    /// Ordered list of every file in the chapter build: segment files with
    /// policy pauses between them, then the fixed closing sequence.
    async fn build_playlist(
        &self,
        chapter_id: i64,
        mode: BuildMode,
    ) -> Result<Vec<PlaylistEntry>, PipelineError> {
        let segments = self.db.get_segments(chapter_id)?;
        if segments.is_empty() {
            return Err(PipelineError::NoSegments(chapter_id));
        }

        let cache = self.synthesizer.cache();
        let mut playlist = Vec::with_capacity(segments.len() * 2 + 3);

        for (i, segment) in segments.iter().enumerate() {
            let path = cache.segment_path(chapter_id, segment.idx);
            if !path.exists() && mode != BuildMode::Diagnostic {
                return Err(PipelineError::MissingSegmentFile(path));
            }
            playlist.push(PlaylistEntry {
                role: format!("segment {}", segment.idx),
                path,
            });

            if let Some(next) = segments.get(i + 1) {
                let duration_ms = pause_between(segment, next);
                let pause = cache.pause_path(chapter_id, segment.idx);
                self.materialize_silence(duration_ms, &pause).await?;
                playlist.push(PlaylistEntry {
                    role: format!("pause {} ({} ms)", segment.idx, duration_ms),
                    path: pause,
                });
            }
        }

        // Closing sequence: a long pause, the spoken end-of-chapter marker,
        // then another long pause.
        let end_pause = cache.end_pause_path(chapter_id);
        self.materialize_silence(END_PAUSE_MS, &end_pause).await?;
        playlist.push(PlaylistEntry {
            role: "end_pause".to_string(),
            path: end_pause,
        });

        let end_chapter = cache.end_chapter_path(chapter_id);
        if !end_chapter.exists() {
            match mode {
                BuildMode::Full => {
                    let voice = self.end_chapter_voice()?;
                    self.synthesizer
                        .synthesize_clip(END_CHAPTER_TEXT, &voice, &end_chapter)
                        .await?;
                }
                BuildMode::CacheOnly => {
                    return Err(PipelineError::MissingSegmentFile(end_chapter));
                }
                BuildMode::Diagnostic => {}
            }
        }
        playlist.push(PlaylistEntry {
            role: "end_chapter".to_string(),
            path: end_chapter,
        });

        let after_end = cache.after_end_pause_path(chapter_id);
        self.materialize_silence(END_PAUSE_MS, &after_end).await?;
        playlist.push(PlaylistEntry {
            role: "after_end_pause".to_string(),
            path: after_end,
        });

        Ok(playlist)
    }

    /// Copy the duration-cached silence clip to its place in the chapter
    /// directory.
    async fn materialize_silence(
        &self,
        duration_ms: u64,
        target: &PathBuf,
    ) -> Result<(), PipelineError> {
        let source = self.synthesizer.ensure_silence(duration_ms).await?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, target)?;
        Ok(())
    }

    /// The chapter narrator's voice, or the configured default preset voice
    /// when no narrator exists.
    fn end_chapter_voice(&self) -> Result<Voice, PipelineError> {
        if let Some(narrator) = self.db.get_narrator()? {
            if let Some(voice_id) = narrator.voice_id {
                if let Some(voice) = self.db.get_voice(voice_id)? {
                    return Ok(voice);
                }
            }
        }
        self.db
            .get_voice_by_name(&self.default_voice_name)?
            .ok_or(PipelineError::NoDefaultVoice)
    }
}

/// Forward transcoder progress into the caller's assembly event channel.
fn bridge_progress(
    progress: Option<mpsc::Sender<AssemblyEvent>>,
) -> Option<mpsc::Sender<EncodeProgress>> {
    let progress = progress?;
    let (tx, mut rx) = mpsc::channel::<EncodeProgress>(32);
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            let _ = progress
                .send(AssemblyEvent {
                    pass: update.pass.to_string(),
                    elapsed_secs: update.elapsed.as_secs_f64(),
                })
                .await;
        }
    });
    Some(tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(segment_type: SegmentType, speaker_id: i64) -> Segment {
        Segment {
            chapter_id: 1,
            idx: 0,
            text: "text".to_string(),
            segment_type,
            speaker_id,
            sound: None,
        }
    }

    // =========================================================================
    // Pause policy precedence
    // =========================================================================

    #[test]
    fn test_announcement_neighbor_wins() {
        let announcement = segment(SegmentType::Announcement, 1);
        let dialogue = segment(SegmentType::Dialogue, 1);
        assert_eq!(pause_between(&announcement, &dialogue), 1_000);
        assert_eq!(pause_between(&dialogue, &announcement), 1_000);

        let sfx = segment(SegmentType::SoundEffect, 1);
        assert_eq!(pause_between(&sfx, &dialogue), 1_000);
    }

    #[test]
    fn test_dialogue_to_narration_beats_speaker_change() {
        // Same speaker: the type rule still fires before the speaker rule.
        let dialogue = segment(SegmentType::Dialogue, 1);
        let narration = segment(SegmentType::Narration, 1);
        assert_eq!(pause_between(&dialogue, &narration), 750);

        // Different speakers: type rule still wins.
        let narration_other = segment(SegmentType::Narration, 2);
        assert_eq!(pause_between(&dialogue, &narration_other), 750);
    }

    #[test]
    fn test_speaker_change() {
        let a = segment(SegmentType::Dialogue, 1);
        let b = segment(SegmentType::Dialogue, 2);
        assert_eq!(pause_between(&a, &b), 500);

        let narration_a = segment(SegmentType::Narration, 1);
        let narration_b = segment(SegmentType::Narration, 2);
        assert_eq!(pause_between(&narration_a, &narration_b), 500);
    }

    #[test]
    fn test_default_pause() {
        let a = segment(SegmentType::Dialogue, 1);
        let b = segment(SegmentType::Dialogue, 1);
        assert_eq!(pause_between(&a, &b), 300);

        let narration = segment(SegmentType::Narration, 1);
        let dialogue = segment(SegmentType::Dialogue, 1);
        // Narration into dialogue is NOT the 750 ms rule.
        assert_eq!(pause_between(&narration, &dialogue), 300);
    }

    #[test]
    fn test_thought_behaves_like_dialogue_for_speaker_rule() {
        let thought_a = segment(SegmentType::Thought, 1);
        let thought_b = segment(SegmentType::Thought, 2);
        assert_eq!(pause_between(&thought_a, &thought_b), 500);
        let thought_same = segment(SegmentType::Thought, 1);
        assert_eq!(pause_between(&thought_a, &thought_same), 300);
    }
}
