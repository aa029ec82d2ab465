// Edge-case tests for chapter, segment, speaker and voice storage
// Run with: cargo test --lib database::tests

#[cfg(test)]
mod chapter_tests {
    use crate::database::{Database, ChapterStage};
    use tempfile::TempDir;

    fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path).unwrap();
        (db, temp_dir)
    }

    // =========================================================================
    // Chapter lifecycle
    // =========================================================================

    #[test]
    fn test_create_and_get_chapter() {
        let (db, _temp) = setup_test_db();
        let id = db.create_chapter("Chapter 1", "Once upon a time.").unwrap();
        assert!(id > 0);

        let chapter = db.get_chapter(id).unwrap().unwrap();
        assert_eq!(chapter.title, "Chapter 1");
        assert_eq!(chapter.raw_text, "Once upon a time.");
        assert!(chapter.speakers_identified_at.is_none());
        assert_eq!(chapter.stage(), ChapterStage::Scraped);
    }

    #[test]
    fn test_get_missing_chapter_is_none() {
        let (db, _temp) = setup_test_db();
        assert!(db.get_chapter(999).unwrap().is_none());
    }

    #[test]
    fn test_stage_progression() {
        let (db, _temp) = setup_test_db();
        let id = db.create_chapter("Ch", "text").unwrap();

        db.mark_speakers_identified(id).unwrap();
        let chapter = db.get_chapter(id).unwrap().unwrap();
        assert_eq!(chapter.stage(), ChapterStage::SpeakersIdentified);

        db.mark_audio_processed(id, "/audio/chapter_1.mp3", 120.5, 1_000_000)
            .unwrap();
        let chapter = db.get_chapter(id).unwrap().unwrap();
        assert_eq!(chapter.stage(), ChapterStage::AudioProcessed);
        assert_eq!(chapter.audio_duration_secs, Some(120.5));

        db.mark_published(id).unwrap();
        let chapter = db.get_chapter(id).unwrap().unwrap();
        assert_eq!(chapter.stage(), ChapterStage::Published);
    }

    #[test]
    fn test_reattribution_marks_audio_stale() {
        let (db, _temp) = setup_test_db();
        let id = db.create_chapter("Ch", "text").unwrap();
        db.mark_speakers_identified(id).unwrap();
        db.mark_audio_processed(id, "/audio/chapter_1.mp3", 60.0, 500_000)
            .unwrap();

        let chapter = db.get_chapter(id).unwrap().unwrap();
        assert!(!chapter.audio_is_stale());

        // Re-running attribution after audio exists flips the ordering.
        std::thread::sleep(std::time::Duration::from_millis(5));
        db.mark_speakers_identified(id).unwrap();
        let chapter = db.get_chapter(id).unwrap().unwrap();
        assert!(chapter.audio_is_stale());
        // The audio timestamp itself is untouched.
        assert!(chapter.audio_processed_at.is_some());
    }

    #[test]
    fn test_clear_chapter_audio_returns_old_path() {
        let (db, _temp) = setup_test_db();
        let id = db.create_chapter("Ch", "text").unwrap();
        db.mark_audio_processed(id, "/audio/chapter_1.mp3", 60.0, 500_000)
            .unwrap();

        let old = db.clear_chapter_audio(id).unwrap();
        assert_eq!(old, Some("/audio/chapter_1.mp3".to_string()));

        let chapter = db.get_chapter(id).unwrap().unwrap();
        assert!(chapter.audio_path.is_none());
        assert!(chapter.audio_duration_secs.is_none());
        assert!(chapter.audio_size_bytes.is_none());
        assert_eq!(chapter.stage(), ChapterStage::Scraped);
    }

    #[test]
    fn test_mark_missing_chapter_fails() {
        let (db, _temp) = setup_test_db();
        assert!(db.mark_speakers_identified(42).is_err());
    }

    #[test]
    fn test_delete_chapter_cascades_segments() {
        let (db, _temp) = setup_test_db();
        let id = db.create_chapter("Ch", "\"Hi.\"").unwrap();
        let narrator = db.get_or_create_speaker("narrator").unwrap();
        db.save_segments(
            id,
            &[crate::database::Segment {
                chapter_id: id,
                idx: 0,
                text: "\"Hi.\"".to_string(),
                segment_type: crate::database::SegmentType::Dialogue,
                speaker_id: narrator.id,
                sound: None,
            }],
        )
        .unwrap();

        db.delete_chapter(id).unwrap();
        assert!(db.get_segments(id).unwrap().is_empty());
    }
}

#[cfg(test)]
mod segment_tests {
    use crate::database::{Database, Segment, SegmentType};
    use tempfile::TempDir;

    fn setup() -> (Database, TempDir, i64, i64) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
        let chapter_id = db.create_chapter("Ch", "text").unwrap();
        let speaker_id = db.get_or_create_speaker("Jake").unwrap().id;
        (db, temp_dir, chapter_id, speaker_id)
    }

    fn segment(chapter_id: i64, idx: i64, speaker_id: i64, text: &str) -> Segment {
        Segment {
            chapter_id,
            idx,
            text: text.to_string(),
            segment_type: SegmentType::Dialogue,
            speaker_id,
            sound: None,
        }
    }

    #[test]
    fn test_save_and_get_segments_in_order() {
        let (db, _temp, ch, sp) = setup();
        db.save_segments(
            ch,
            &[
                segment(ch, 2, sp, "third"),
                segment(ch, 0, sp, "first"),
                segment(ch, 1, sp, "second"),
            ],
        )
        .unwrap();

        let segments = db.get_segments(ch).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].text, "first");
        assert_eq!(segments[2].text, "third");
    }

    #[test]
    fn test_save_segments_replaces_existing() {
        let (db, _temp, ch, sp) = setup();
        db.save_segments(ch, &[segment(ch, 0, sp, "old")]).unwrap();
        db.save_segments(ch, &[segment(ch, 0, sp, "new"), segment(ch, 1, sp, "more")])
            .unwrap();

        let segments = db.get_segments(ch).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "new");
    }

    #[test]
    fn test_segment_text_preserves_whitespace() {
        let (db, _temp, ch, sp) = setup();
        let text = "  leading, trailing  \n and internal\t whitespace ";
        db.save_segments(ch, &[segment(ch, 0, sp, text)]).unwrap();
        assert_eq!(db.get_segments(ch).unwrap()[0].text, text);
    }

    #[test]
    fn test_segment_type_round_trips() {
        let (db, _temp, ch, sp) = setup();
        let mut announcement = segment(ch, 0, sp, "[Level Up!]");
        announcement.segment_type = SegmentType::Announcement;
        announcement.sound = Some("chime".to_string());
        db.save_segments(ch, &[announcement]).unwrap();

        let stored = &db.get_segments(ch).unwrap()[0];
        assert_eq!(stored.segment_type, SegmentType::Announcement);
        assert_eq!(stored.sound, Some("chime".to_string()));
    }

    #[test]
    fn test_update_segment_speaker() {
        let (db, _temp, ch, sp) = setup();
        db.save_segments(ch, &[segment(ch, 0, sp, "\"Hi.\"")]).unwrap();
        let mira = db.get_or_create_speaker("Mira").unwrap();

        db.update_segment_speaker(ch, 0, mira.id).unwrap();
        assert_eq!(db.get_segments(ch).unwrap()[0].speaker_id, mira.id);
    }

    #[test]
    fn test_update_missing_segment_fails() {
        let (db, _temp, ch, sp) = setup();
        assert!(db.update_segment_speaker(ch, 7, sp).is_err());
    }
}

#[cfg(test)]
mod speaker_tests {
    use crate::database::{Database, ProviderKind, Segment, SegmentType};
    use tempfile::TempDir;

    fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
        (db, temp_dir)
    }

    #[test]
    fn test_get_or_create_speaker_is_idempotent() {
        let (db, _temp) = setup_test_db();
        let first = db.get_or_create_speaker("Jake").unwrap();
        let second = db.get_or_create_speaker("Jake").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(db.get_speakers().unwrap().len(), 1);
    }

    #[test]
    fn test_set_narrator_is_exclusive() {
        let (db, _temp) = setup_test_db();
        let a = db.get_or_create_speaker("narrator").unwrap();
        let b = db.get_or_create_speaker("Jake").unwrap();

        db.set_narrator(a.id).unwrap();
        db.set_narrator(b.id).unwrap();

        let narrator = db.get_narrator().unwrap().unwrap();
        assert_eq!(narrator.id, b.id);
        assert!(!db.get_speaker(a.id).unwrap().unwrap().is_narrator);
    }

    #[test]
    fn test_merge_speakers_reassigns_segments_and_deletes_source() {
        let (db, _temp) = setup_test_db();
        let ch = db.create_chapter("Ch", "text").unwrap();
        let jake = db.get_or_create_speaker("Jake").unwrap();
        let jakey = db.get_or_create_speaker("Jakey").unwrap();
        db.save_segments(
            ch,
            &[
                Segment {
                    chapter_id: ch,
                    idx: 0,
                    text: "\"Hi.\"".to_string(),
                    segment_type: SegmentType::Dialogue,
                    speaker_id: jakey.id,
                    sound: None,
                },
                Segment {
                    chapter_id: ch,
                    idx: 1,
                    text: " he said.".to_string(),
                    segment_type: SegmentType::Narration,
                    speaker_id: jake.id,
                    sound: None,
                },
            ],
        )
        .unwrap();

        let moved = db.merge_speakers(jakey.id, jake.id).unwrap();
        assert_eq!(moved, 1);
        assert!(db.get_speaker(jakey.id).unwrap().is_none());
        let segments = db.get_segments(ch).unwrap();
        assert!(segments.iter().all(|s| s.speaker_id == jake.id));
    }

    #[test]
    fn test_merge_speaker_into_itself_fails() {
        let (db, _temp) = setup_test_db();
        let jake = db.get_or_create_speaker("Jake").unwrap();
        assert!(db.merge_speakers(jake.id, jake.id).is_err());
    }

    #[test]
    fn test_merge_into_missing_target_fails() {
        let (db, _temp) = setup_test_db();
        let jake = db.get_or_create_speaker("Jake").unwrap();
        assert!(db.merge_speakers(jake.id, 999).is_err());
    }

    #[test]
    fn test_speaker_voice_assignment() {
        let (db, _temp) = setup_test_db();
        let jake = db.get_or_create_speaker("Jake").unwrap();
        let voice = db.create_voice("matthew", ProviderKind::Preset, None).unwrap();

        db.set_speaker_voice(jake.id, Some(voice)).unwrap();
        assert_eq!(db.get_speaker(jake.id).unwrap().unwrap().voice_id, Some(voice));

        db.set_speaker_voice(jake.id, None).unwrap();
        assert_eq!(db.get_speaker(jake.id).unwrap().unwrap().voice_id, None);
    }

    #[test]
    fn test_chapters_for_speaker() {
        let (db, _temp) = setup_test_db();
        let ch1 = db.create_chapter("One", "a").unwrap();
        let ch2 = db.create_chapter("Two", "b").unwrap();
        let jake = db.get_or_create_speaker("Jake").unwrap();
        for ch in [ch1, ch2] {
            db.save_segments(
                ch,
                &[Segment {
                    chapter_id: ch,
                    idx: 0,
                    text: "x".to_string(),
                    segment_type: SegmentType::Dialogue,
                    speaker_id: jake.id,
                    sound: None,
                }],
            )
            .unwrap();
        }
        assert_eq!(db.chapters_for_speaker(jake.id).unwrap(), vec![ch1, ch2]);
    }
}

#[cfg(test)]
mod voice_and_queue_tests {
    use crate::database::{Database, ProviderKind};
    use tempfile::TempDir;

    fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
        (db, temp_dir)
    }

    #[test]
    fn test_voice_provider_round_trips() {
        let (db, _temp) = setup_test_db();
        let id = db
            .create_voice("nova", ProviderKind::Neural, Some(r#"{"stability":0.5}"#))
            .unwrap();
        let voice = db.get_voice(id).unwrap().unwrap();
        assert_eq!(voice.provider, ProviderKind::Neural);
        assert!(voice.active);
        assert_eq!(voice.settings_json.as_deref(), Some(r#"{"stability":0.5}"#));
    }

    #[test]
    fn test_duplicate_voice_name_fails() {
        let (db, _temp) = setup_test_db();
        db.create_voice("nova", ProviderKind::Neural, None).unwrap();
        assert!(db.create_voice("nova", ProviderKind::Preset, None).is_err());
    }

    #[test]
    fn test_queue_fifo_and_completion() {
        let (db, _temp) = setup_test_db();
        let a = db.create_chapter("A", "a").unwrap();
        let b = db.create_chapter("B", "b").unwrap();
        db.enqueue_chapter(a).unwrap();
        db.enqueue_chapter(b).unwrap();

        assert_eq!(db.next_queued_chapter().unwrap(), Some(a));
        db.mark_queue_processing(a).unwrap();
        assert_eq!(db.next_queued_chapter().unwrap(), Some(b));

        db.mark_queue_completed(a).unwrap();
        db.mark_queue_completed(b).unwrap();
        assert_eq!(db.next_queued_chapter().unwrap(), None);
    }

    #[test]
    fn test_reset_stuck_processing() {
        let (db, _temp) = setup_test_db();
        let a = db.create_chapter("A", "a").unwrap();
        db.enqueue_chapter(a).unwrap();
        db.mark_queue_processing(a).unwrap();

        assert_eq!(db.reset_stuck_processing().unwrap(), 1);
        assert_eq!(db.next_queued_chapter().unwrap(), Some(a));
    }

    #[test]
    fn test_requeue_failed_chapter_clears_error() {
        let (db, _temp) = setup_test_db();
        let a = db.create_chapter("A", "a").unwrap();
        db.enqueue_chapter(a).unwrap();
        db.mark_queue_failed(a, "synthesis failed").unwrap();
        assert_eq!(db.next_queued_chapter().unwrap(), None);

        db.enqueue_chapter(a).unwrap();
        assert_eq!(db.next_queued_chapter().unwrap(), Some(a));
    }

    #[test]
    fn test_pipeline_error_log() {
        let (db, _temp) = setup_test_db();
        let ch = db.create_chapter("A", "a").unwrap();
        db.log_pipeline_error("synthesis", Some(ch), "SynthesisProviderError", "timeout")
            .unwrap();
        db.log_pipeline_error("assembly", Some(ch), "AssemblySubprocessFailure", "exit 1")
            .unwrap();

        let errors = db.recent_errors(10).unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].stage, "assembly");

        assert_eq!(db.mark_pipeline_errors_resolved(ch).unwrap(), 2);
        assert!(db.recent_errors(10).unwrap().iter().all(|e| e.resolved));
    }

    #[test]
    fn test_settings_upsert() {
        let (db, _temp) = setup_test_db();
        assert_eq!(db.get_setting("classifier_model").unwrap(), None);
        db.set_setting("classifier_model", "llama3.2:3b").unwrap();
        db.set_setting("classifier_model", "llama3.2:8b").unwrap();
        assert_eq!(
            db.get_setting("classifier_model").unwrap(),
            Some("llama3.2:8b".to_string())
        );
    }
}
