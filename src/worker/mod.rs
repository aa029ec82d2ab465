//! Chapter pipeline orchestration.
//!
//! Owns the chapter state machine (`scraped → speakers_identified →
//! audio_processed → published`), applies invalidation when upstream state
//! changes, and is the only writer of the per-chapter progress snapshots.
//! A per-chapter mutex guarantees at most one build per chapter at a time;
//! independent chapters can build concurrently.

pub mod progress;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::assembly::{AssembledAudio, AssemblyEngine, AssemblyEvent, MergeReport};
use crate::attribution::{AttributionEngine, AttributionEvent, AttributionPhase};
use crate::config::AppConfig;
use crate::database::{Chapter, Database, Segment, SegmentType, Speaker, Voice};
use crate::error::PipelineError;
use crate::synthesis::{AudioCache, VoiceSynthesizer};
use progress::{ChapterPhase, ChapterProgress, ProgressHandle, ProgressStore};

const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub struct PipelineOrchestrator {
    db: Arc<Database>,
    config: AppConfig,
    attribution: AttributionEngine,
    synthesizer: Arc<VoiceSynthesizer>,
    assembly: AssemblyEngine,
    progress: ProgressStore,
    /// One build guard per chapter; a second build request for the same
    /// chapter waits instead of racing the first.
    build_locks: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl PipelineOrchestrator {
    pub fn new(mut config: AppConfig, db: Arc<Database>) -> Self {
        // A stored classifier model overrides the config file, so the model
        // can be switched without editing config.yaml.
        if let Ok(Some(model)) = db.get_setting("classifier_model") {
            config.attribution.model = model;
        }
        let cache = AudioCache::new(config.paths.audio_root());
        let synthesizer = Arc::new(VoiceSynthesizer::new(&config, cache));
        let assembly = AssemblyEngine::new(&config, db.clone(), synthesizer.clone());
        let attribution = AttributionEngine::new(&config);
        Self {
            db,
            config,
            attribution,
            synthesizer,
            assembly,
            progress: ProgressStore::new(),
            build_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Snapshot of the chapter's most recent pipeline run, if any.
    pub async fn get_progress(&self, chapter_id: i64) -> Option<ChapterProgress> {
        self.progress.get(chapter_id).await
    }

    fn build_lock(&self, chapter_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.build_locks.lock().unwrap();
        locks
            .entry(chapter_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ========================================================================
    // Exposed operations
    // ========================================================================

    /// Run the full pipeline for a chapter: attribution if missing, then
    /// synthesis of stale/missing segment audio, then assembly. Idempotent:
    /// a chapter whose audio is current returns immediately.
    pub async fn process_chapter(
        &self,
        chapter_id: i64,
    ) -> Result<AssembledAudio, PipelineError> {
        let lock = self.build_lock(chapter_id);
        let _guard = lock.lock().await;

        let handle = self.progress.handle(chapter_id);
        handle.reset().await;

        let result = self.process_inner(chapter_id, &handle).await;
        self.finish(chapter_id, &handle, &result).await;
        result
    }

    /// Reassemble the chapter strictly from cached segment files. Never
    /// invokes a synthesis provider.
    pub async fn rebuild_from_cache(
        &self,
        chapter_id: i64,
    ) -> Result<AssembledAudio, PipelineError> {
        let lock = self.build_lock(chapter_id);
        let _guard = lock.lock().await;

        let handle = self.progress.handle(chapter_id);
        handle.reset().await;
        handle.set_phase(ChapterPhase::Encoding).await;

        let result = async {
            let audio = self
                .assembly
                .rebuild_from_cache(chapter_id, Some(self.encode_progress(&handle)))
                .await?;
            self.db.mark_audio_processed(
                chapter_id,
                &audio.path.to_string_lossy(),
                audio.duration_secs,
                audio.size_bytes,
            )?;
            Ok(audio)
        }
        .await;
        self.finish(chapter_id, &handle, &result).await;
        result
    }

    /// Diagnostic build: per-file report, intermediates kept, no synthesis.
    pub async fn debug_merge(&self, chapter_id: i64) -> Result<MergeReport, PipelineError> {
        let lock = self.build_lock(chapter_id);
        let _guard = lock.lock().await;
        self.assembly.debug_merge(chapter_id).await
    }

    /// Force one segment's audio to be regenerated, invalidating the
    /// assembled chapter audio.
    pub async fn regenerate_segment(
        &self,
        chapter_id: i64,
        idx: i64,
    ) -> Result<PathBuf, PipelineError> {
        let lock = self.build_lock(chapter_id);
        let _guard = lock.lock().await;

        let segment = self
            .db
            .get_segment(chapter_id, idx)?
            .ok_or(PipelineError::SegmentNotFound { chapter_id, idx })?;
        let speakers = self.speaker_map()?;
        let voice = self.voice_for_segment(&segment, &speakers)?;

        let cache = self.synthesizer.cache();
        let _ = std::fs::remove_file(cache.segment_path(chapter_id, idx));
        let _ = std::fs::remove_file(cache.sidecar_path(chapter_id, idx));

        let path = self.synthesizer.ensure_segment_audio(&segment, &voice).await?;
        self.invalidate_chapter_audio(chapter_id)?;
        Ok(path)
    }

    /// Reassign one segment's speaker. The previously assembled chapter
    /// audio is deleted and its metadata cleared, so the chapter is treated
    /// as unprocessed on the next build.
    pub fn update_segment_speaker(
        &self,
        chapter_id: i64,
        idx: i64,
        speaker_id: i64,
    ) -> Result<(), PipelineError> {
        self.db.update_segment_speaker(chapter_id, idx, speaker_id)?;
        self.invalidate_chapter_audio(chapter_id)?;
        log::info!(
            "Segment {}/{} reassigned to speaker {}, chapter audio invalidated",
            chapter_id,
            idx,
            speaker_id
        );
        Ok(())
    }

    /// Assign a voice to a speaker and invalidate the assembled audio of
    /// every chapter the speaker appears in. Cached segment files stay put;
    /// the next build regenerates exactly the segments whose key changed.
    pub fn set_speaker_voice(
        &self,
        speaker_id: i64,
        voice_id: Option<i64>,
    ) -> Result<(), PipelineError> {
        if let Some(voice_id) = voice_id {
            self.db
                .get_voice(voice_id)?
                .ok_or(PipelineError::VoiceNotFound(voice_id))?;
        }
        self.db.set_speaker_voice(speaker_id, voice_id)?;
        for chapter_id in self.db.chapters_for_speaker(speaker_id)? {
            self.invalidate_chapter_audio(chapter_id)?;
        }
        Ok(())
    }

    /// Merge two speakers and invalidate affected chapters' audio.
    pub fn merge_speakers(&self, source_id: i64, target_id: i64) -> Result<usize, PipelineError> {
        let affected = self.db.chapters_for_speaker(source_id)?;
        let moved = self.db.merge_speakers(source_id, target_id)?;
        for chapter_id in affected {
            self.invalidate_chapter_audio(chapter_id)?;
        }
        log::info!(
            "Merged speaker {} into {} ({} segments moved)",
            source_id,
            target_id,
            moved
        );
        Ok(moved)
    }

    // ========================================================================
    // Pipeline internals
    // ========================================================================

    async fn process_inner(
        &self,
        chapter_id: i64,
        handle: &ProgressHandle,
    ) -> Result<AssembledAudio, PipelineError> {
        let chapter = self
            .db
            .get_chapter(chapter_id)?
            .ok_or(PipelineError::ChapterNotFound(chapter_id))?;

        let mut segments = self.db.get_segments(chapter_id)?;
        if segments.is_empty() || chapter.speakers_identified_at.is_none() {
            segments = self.run_attribution(&chapter, handle).await?;
        }

        // Re-read to pick up the attribution timestamp before the staleness
        // check.
        let chapter = self
            .db
            .get_chapter(chapter_id)?
            .ok_or(PipelineError::ChapterNotFound(chapter_id))?;

        if let Some(audio) = current_audio(&chapter) {
            log::info!("Chapter {} audio is current, nothing to do", chapter_id);
            return Ok(audio);
        }

        let speakers = self.speaker_map()?;
        handle.synthesis(0, segments.len()).await;
        for (done, segment) in segments.iter().enumerate() {
            let voice = self.voice_for_segment(segment, &speakers)?;
            self.synthesizer.ensure_segment_audio(segment, &voice).await?;
            handle.synthesis(done + 1, segments.len()).await;
        }

        handle.set_phase(ChapterPhase::Encoding).await;
        let audio = self
            .assembly
            .assemble(chapter_id, Some(self.encode_progress(handle)))
            .await?;

        self.db.mark_audio_processed(
            chapter_id,
            &audio.path.to_string_lossy(),
            audio.duration_secs,
            audio.size_bytes,
        )?;

        Ok(audio)
    }

    /// Stage 1+2 attribution, persisting the resulting segments and
    /// stamping `speakers_identified_at`.
    async fn run_attribution(
        &self,
        chapter: &Chapter,
        handle: &ProgressHandle,
    ) -> Result<Vec<Segment>, PipelineError> {
        handle.set_phase(ChapterPhase::Segmenting).await;

        let known: Vec<String> = self
            .db
            .get_speakers()?
            .into_iter()
            .map(|s| s.name)
            .collect();

        let (tx, mut rx) = mpsc::channel::<AttributionEvent>(32);
        let forward = handle.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event.phase {
                    AttributionPhase::Segmenting => {
                        forward.set_phase(ChapterPhase::Segmenting).await
                    }
                    AttributionPhase::Attributing => {
                        forward
                            .attribution(event.total_spans, event.batches_done, event.batches_total)
                            .await
                    }
                    AttributionPhase::Complete | AttributionPhase::Error => {}
                }
            }
        });

        let spans = self
            .attribution
            .attribute(&chapter.raw_text, &known, Some(&tx))
            .await;
        drop(tx);
        let _ = forwarder.await;

        let mut segments = Vec::with_capacity(spans.len());
        for span in spans {
            let canonical = self.config.canonical_name(&span.speaker).to_string();
            let speaker = self.db.get_or_create_speaker(&canonical)?;
            if canonical == crate::attribution::NARRATOR
                && !speaker.is_narrator
                && self.db.get_narrator()?.is_none()
            {
                self.db.set_narrator(speaker.id)?;
            }
            segments.push(Segment {
                chapter_id: chapter.id,
                idx: span.idx as i64,
                text: span.text,
                segment_type: span.segment_type,
                speaker_id: speaker.id,
                sound: span.sound,
            });
        }

        self.db.save_segments(chapter.id, &segments)?;
        self.db.mark_speakers_identified(chapter.id)?;
        log::info!(
            "Attribution for chapter {}: {} segments, {} known speakers",
            chapter.id,
            segments.len(),
            known.len()
        );

        Ok(segments)
    }

    fn speaker_map(&self) -> Result<HashMap<i64, Speaker>, PipelineError> {
        Ok(self
            .db
            .get_speakers()?
            .into_iter()
            .map(|s| (s.id, s))
            .collect())
    }

    /// Resolve the voice a segment will be synthesized with. Dialogue and
    /// thought segments require their speaker's own voice; other types fall
    /// back to the narrator's voice, then to the configured default.
    fn voice_for_segment(
        &self,
        segment: &Segment,
        speakers: &HashMap<i64, Speaker>,
    ) -> Result<Voice, PipelineError> {
        let speaker = speakers.get(&segment.speaker_id);
        if let Some(voice_id) = speaker.and_then(|s| s.voice_id) {
            return self
                .db
                .get_voice(voice_id)?
                .ok_or(PipelineError::VoiceNotFound(voice_id));
        }

        let speaker_name = speaker
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("#{}", segment.speaker_id));

        if matches!(
            segment.segment_type,
            SegmentType::Dialogue | SegmentType::Thought
        ) {
            return Err(PipelineError::MissingVoice {
                speaker: speaker_name,
            });
        }

        if let Some(narrator) = self.db.get_narrator()? {
            if let Some(voice_id) = narrator.voice_id {
                if let Some(voice) = self.db.get_voice(voice_id)? {
                    return Ok(voice);
                }
            }
        }
        self.db
            .get_voice_by_name(&self.config.synthesis.default_voice)?
            .ok_or(PipelineError::MissingVoice {
                speaker: speaker_name,
            })
    }

    /// Delete the assembled chapter file and clear its metadata. Cached
    /// per-segment audio is left intact.
    fn invalidate_chapter_audio(&self, chapter_id: i64) -> Result<(), PipelineError> {
        let old_path = self.db.clear_chapter_audio(chapter_id)?;
        if let Some(path) = old_path {
            if Path::new(&path).exists() {
                std::fs::remove_file(&path)?;
                log::info!("Deleted stale chapter audio {}", path);
            }
        }
        Ok(())
    }

    fn encode_progress(&self, handle: &ProgressHandle) -> mpsc::Sender<AssemblyEvent> {
        let (tx, mut rx) = mpsc::channel::<AssemblyEvent>(32);
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handle.encoding(&event.pass, event.elapsed_secs).await;
            }
        });
        tx
    }

    /// Record the outcome: resolve or log pipeline errors and close out the
    /// progress snapshot.
    async fn finish(
        &self,
        chapter_id: i64,
        handle: &ProgressHandle,
        result: &Result<AssembledAudio, PipelineError>,
    ) {
        match result {
            Ok(_) => {
                handle.complete().await;
                if let Err(e) = self.db.mark_pipeline_errors_resolved(chapter_id) {
                    log::warn!("Failed to resolve pipeline errors: {}", e);
                }
            }
            Err(e) => {
                handle.fail(e.to_string()).await;
                log::error!("Chapter {} failed in {} stage: {}", chapter_id, e.stage(), e);
                if let Err(log_err) =
                    self.db
                        .log_pipeline_error(e.stage(), Some(chapter_id), e.kind(), &e.to_string())
                {
                    log::warn!("Failed to log pipeline error: {}", log_err);
                }
            }
        }
    }

    // ========================================================================
    // Queue worker
    // ========================================================================

    /// Background loop draining the chapter queue sequentially. The token
    /// only stops the loop between jobs; an in-flight build always runs to
    /// completion or failure.
    pub async fn run_queue(&self, cancel: CancellationToken) {
        log::info!("Queue worker started");

        match self.db.reset_stuck_processing() {
            Ok(0) => {}
            Ok(n) => log::info!("Reset {} stuck queue items from a previous run", n),
            Err(e) => log::warn!("Failed to reset stuck queue items: {}", e),
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let next = match self.db.next_queued_chapter() {
                Ok(next) => next,
                Err(e) => {
                    log::error!("Queue poll failed: {}", e);
                    None
                }
            };

            if let Some(chapter_id) = next {
                if let Err(e) = self.db.mark_queue_processing(chapter_id) {
                    log::error!("Failed to mark chapter {} processing: {}", chapter_id, e);
                    continue;
                }
                match self.process_chapter(chapter_id).await {
                    Ok(audio) => {
                        log::info!(
                            "Queue: chapter {} done ({:.1}s audio)",
                            chapter_id,
                            audio.duration_secs
                        );
                        if let Err(e) = self.db.mark_queue_completed(chapter_id) {
                            log::warn!("Failed to dequeue chapter {}: {}", chapter_id, e);
                        }
                    }
                    Err(e) => {
                        log::error!("Queue: chapter {} failed: {}", chapter_id, e);
                        if let Err(db_err) = self.db.mark_queue_failed(chapter_id, &e.to_string())
                        {
                            log::warn!("Failed to mark queue failure: {}", db_err);
                        }
                    }
                }
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => {}
            }
        }

        log::info!("Queue worker stopped");
    }
}

/// The chapter's existing audio, if it is present on disk and not stale.
fn current_audio(chapter: &Chapter) -> Option<AssembledAudio> {
    if chapter.audio_is_stale() || chapter.audio_processed_at.is_none() {
        return None;
    }
    let path = chapter.audio_path.as_ref()?;
    if !Path::new(path).exists() {
        return None;
    }
    Some(AssembledAudio {
        path: PathBuf::from(path),
        duration_secs: chapter.audio_duration_secs.unwrap_or(0.0),
        size_bytes: chapter.audio_size_bytes.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn setup() -> (PipelineOrchestrator, TempDir) {
        let temp = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.paths.data_dir = temp.path().to_path_buf();
        config.paths.assets_dir = temp.path().join("assets");
        let db = Arc::new(Database::new(&temp.path().join("test.db")).unwrap());
        (PipelineOrchestrator::new(config, db), temp)
    }

    fn seed_chapter(orchestrator: &PipelineOrchestrator, audio_dir: &Path) -> i64 {
        let db = orchestrator.database();
        let chapter_id = db.create_chapter("Ch", "\"Hi,\" Jake said.").unwrap();
        let jake = db.get_or_create_speaker("Jake").unwrap();
        db.save_segments(
            chapter_id,
            &[Segment {
                chapter_id,
                idx: 0,
                text: "\"Hi,\"".to_string(),
                segment_type: SegmentType::Dialogue,
                speaker_id: jake.id,
                sound: None,
            }],
        )
        .unwrap();
        db.mark_speakers_identified(chapter_id).unwrap();

        let audio_path = audio_dir.join(format!("chapter_{}.mp3", chapter_id));
        std::fs::create_dir_all(audio_dir).unwrap();
        std::fs::write(&audio_path, b"mp3").unwrap();
        db.mark_audio_processed(chapter_id, &audio_path.to_string_lossy(), 12.0, 3)
            .unwrap();
        chapter_id
    }

    #[test]
    fn test_update_segment_speaker_invalidates_audio() {
        let (orchestrator, temp) = setup();
        let chapter_id = seed_chapter(&orchestrator, &temp.path().join("audio"));
        let mira = orchestrator.database().get_or_create_speaker("Mira").unwrap();

        orchestrator
            .update_segment_speaker(chapter_id, 0, mira.id)
            .unwrap();

        let chapter = orchestrator.database().get_chapter(chapter_id).unwrap().unwrap();
        assert!(chapter.audio_path.is_none());
        assert!(chapter.audio_duration_secs.is_none());
        assert!(!temp
            .path()
            .join("audio")
            .join(format!("chapter_{}.mp3", chapter_id))
            .exists());
        assert_eq!(
            orchestrator.database().get_segments(chapter_id).unwrap()[0].speaker_id,
            mira.id
        );
    }

    #[test]
    fn test_set_speaker_voice_invalidates_affected_chapters() {
        let (orchestrator, temp) = setup();
        let chapter_id = seed_chapter(&orchestrator, &temp.path().join("audio"));
        let db = orchestrator.database();
        let jake = db.get_speaker_by_name("Jake").unwrap().unwrap();
        let voice = db.create_voice("matthew", crate::database::ProviderKind::Preset, None).unwrap();

        orchestrator.set_speaker_voice(jake.id, Some(voice)).unwrap();

        let chapter = db.get_chapter(chapter_id).unwrap().unwrap();
        assert!(chapter.audio_path.is_none());
        assert_eq!(db.get_speaker(jake.id).unwrap().unwrap().voice_id, Some(voice));
    }

    #[test]
    fn test_set_speaker_voice_rejects_unknown_voice() {
        let (orchestrator, _temp) = setup();
        let jake = orchestrator.database().get_or_create_speaker("Jake").unwrap();
        assert!(matches!(
            orchestrator.set_speaker_voice(jake.id, Some(404)),
            Err(PipelineError::VoiceNotFound(404))
        ));
    }

    #[test]
    fn test_voice_for_segment_missing_dialogue_voice_is_fatal() {
        let (orchestrator, _temp) = setup();
        let db = orchestrator.database();
        let jake = db.get_or_create_speaker("Jake").unwrap();
        let segment = Segment {
            chapter_id: 1,
            idx: 0,
            text: "\"Hi\"".to_string(),
            segment_type: SegmentType::Dialogue,
            speaker_id: jake.id,
            sound: None,
        };
        let speakers = orchestrator.speaker_map().unwrap();
        assert!(matches!(
            orchestrator.voice_for_segment(&segment, &speakers),
            Err(PipelineError::MissingVoice { .. })
        ));
    }

    #[test]
    fn test_voice_for_segment_narration_falls_back_to_narrator() {
        let (orchestrator, _temp) = setup();
        let db = orchestrator.database();
        let narrator = db.get_or_create_speaker("narrator").unwrap();
        db.set_narrator(narrator.id).unwrap();
        let voice = db
            .create_voice("matthew", crate::database::ProviderKind::Preset, None)
            .unwrap();
        db.set_speaker_voice(narrator.id, Some(voice)).unwrap();

        let someone = db.get_or_create_speaker("Someone").unwrap();
        let segment = Segment {
            chapter_id: 1,
            idx: 0,
            text: "He left.".to_string(),
            segment_type: SegmentType::Narration,
            speaker_id: someone.id,
            sound: None,
        };
        let speakers = orchestrator.speaker_map().unwrap();
        let resolved = orchestrator.voice_for_segment(&segment, &speakers).unwrap();
        assert_eq!(resolved.id, voice);
    }

    #[test]
    fn test_current_audio_checks_staleness_and_file() {
        let now = Utc::now();
        let mut chapter = Chapter {
            id: 1,
            title: "Ch".to_string(),
            raw_text: "text".to_string(),
            scraped_at: now,
            speakers_identified_at: Some(now),
            audio_processed_at: Some(now + chrono::Duration::seconds(1)),
            published_at: None,
            audio_path: Some("/nonexistent/chapter_1.mp3".to_string()),
            audio_duration_secs: Some(10.0),
            audio_size_bytes: Some(100),
        };
        // File missing → rebuild.
        assert!(current_audio(&chapter).is_none());

        // Stale ordering → rebuild even if the file existed.
        chapter.speakers_identified_at = Some(now + chrono::Duration::seconds(2));
        assert!(current_audio(&chapter).is_none());
    }

    #[tokio::test]
    async fn test_build_lock_is_shared_per_chapter() {
        let (orchestrator, _temp) = setup();
        let a = orchestrator.build_lock(1);
        let b = orchestrator.build_lock(1);
        let other = orchestrator.build_lock(2);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));

        // Holding chapter 1's lock doesn't block chapter 2.
        let _guard = a.lock().await;
        assert!(other.try_lock().is_ok());
        assert!(b.try_lock().is_err());
    }
}
