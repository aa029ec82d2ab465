pub mod models;

#[cfg(test)]
mod tests;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use models::*;

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
            PRAGMA foreign_keys=ON;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chapters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                raw_text TEXT NOT NULL,
                scraped_at TEXT NOT NULL,
                speakers_identified_at TEXT,
                audio_processed_at TEXT,
                published_at TEXT,
                audio_path TEXT,
                audio_duration_secs REAL,
                audio_size_bytes INTEGER
            );

            CREATE TABLE IF NOT EXISTS segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chapter_id INTEGER NOT NULL,
                idx INTEGER NOT NULL,
                text TEXT NOT NULL,
                segment_type TEXT NOT NULL DEFAULT 'narration',
                speaker_id INTEGER NOT NULL,
                sound TEXT,
                FOREIGN KEY (chapter_id) REFERENCES chapters(id) ON DELETE CASCADE,
                UNIQUE(chapter_id, idx)
            );

            CREATE INDEX IF NOT EXISTS idx_segments_chapter ON segments(chapter_id, idx);
            CREATE INDEX IF NOT EXISTS idx_segments_speaker ON segments(speaker_id);

            CREATE TABLE IF NOT EXISTS speakers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                voice_id INTEGER,
                is_narrator INTEGER DEFAULT 0,
                created_at TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS voices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                provider TEXT NOT NULL DEFAULT 'preset',
                settings_json TEXT,
                active INTEGER DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chapter_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chapter_id INTEGER NOT NULL UNIQUE,
                status TEXT DEFAULT 'pending',
                added_at TEXT NOT NULL DEFAULT (datetime('now')),
                error_message TEXT,
                FOREIGN KEY (chapter_id) REFERENCES chapters(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_queue_status ON chapter_queue(status, added_at);

            CREATE TABLE IF NOT EXISTS pipeline_errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stage TEXT NOT NULL,
                chapter_id INTEGER,
                error_type TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT DEFAULT (datetime('now')),
                resolved INTEGER DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_errors_chapter ON pipeline_errors(chapter_id, resolved);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Chapters
    // ========================================================================

    pub fn create_chapter(&self, title: &str, raw_text: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO chapters (title, raw_text, scraped_at) VALUES (?1, ?2, ?3)",
            params![title, raw_text, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_chapter(&self, id: i64) -> Result<Option<Chapter>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, title, raw_text, scraped_at, speakers_identified_at,
                    audio_processed_at, published_at, audio_path,
                    audio_duration_secs, audio_size_bytes
             FROM chapters WHERE id = ?1",
            params![id],
            |row| {
                Ok(Chapter {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    raw_text: row.get(2)?,
                    scraped_at: parse_ts_required(row.get::<_, String>(3)?),
                    speakers_identified_at: parse_ts(row.get(4)?),
                    audio_processed_at: parse_ts(row.get(5)?),
                    published_at: parse_ts(row.get(6)?),
                    audio_path: row.get(7)?,
                    audio_duration_secs: row.get(8)?,
                    audio_size_bytes: row.get(9)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_chapters(&self) -> Result<Vec<ChapterSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, raw_text, scraped_at, speakers_identified_at,
                    audio_processed_at, published_at, audio_path,
                    audio_duration_secs, audio_size_bytes
             FROM chapters ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Chapter {
                id: row.get(0)?,
                title: row.get(1)?,
                raw_text: row.get(2)?,
                scraped_at: parse_ts_required(row.get::<_, String>(3)?),
                speakers_identified_at: parse_ts(row.get(4)?),
                audio_processed_at: parse_ts(row.get(5)?),
                published_at: parse_ts(row.get(6)?),
                audio_path: row.get(7)?,
                audio_duration_secs: row.get(8)?,
                audio_size_bytes: row.get(9)?,
            })
        })?;
        let mut chapters = Vec::new();
        for chapter in rows {
            let chapter = chapter?;
            chapters.push(ChapterSummary {
                id: chapter.id,
                title: chapter.title.clone(),
                stage: chapter.stage(),
                audio_duration_secs: chapter.audio_duration_secs,
            });
        }
        Ok(chapters)
    }

    pub fn mark_speakers_identified(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE chapters SET speakers_identified_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(anyhow!("chapter {} not found", id));
        }
        Ok(())
    }

    pub fn mark_audio_processed(
        &self,
        id: i64,
        audio_path: &str,
        duration_secs: f64,
        size_bytes: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE chapters SET audio_processed_at = ?1, audio_path = ?2,
                    audio_duration_secs = ?3, audio_size_bytes = ?4
             WHERE id = ?5",
            params![
                Utc::now().to_rfc3339(),
                audio_path,
                duration_secs,
                size_bytes,
                id
            ],
        )?;
        if updated == 0 {
            return Err(anyhow!("chapter {} not found", id));
        }
        Ok(())
    }

    pub fn mark_published(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE chapters SET published_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Clear the assembled audio columns so the chapter reads as unprocessed.
    /// The caller is responsible for removing the file itself.
    pub fn clear_chapter_audio(&self, id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let old_path: Option<String> = conn
            .query_row(
                "SELECT audio_path FROM chapters WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        conn.execute(
            "UPDATE chapters SET audio_path = NULL, audio_duration_secs = NULL,
                    audio_size_bytes = NULL, audio_processed_at = NULL
             WHERE id = ?1",
            params![id],
        )?;
        Ok(old_path)
    }

    pub fn delete_chapter(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM chapters WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ========================================================================
    // Segments
    // ========================================================================

    pub fn get_segments(&self, chapter_id: i64) -> Result<Vec<Segment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT chapter_id, idx, text, segment_type, speaker_id, sound
             FROM segments WHERE chapter_id = ?1 ORDER BY idx",
        )?;
        let rows = stmt.query_map(params![chapter_id], |row| {
            Ok(Segment {
                chapter_id: row.get(0)?,
                idx: row.get(1)?,
                text: row.get(2)?,
                segment_type: SegmentType::from(row.get::<_, String>(3)?),
                speaker_id: row.get(4)?,
                sound: row.get(5)?,
            })
        })?;
        let mut segments = Vec::new();
        for segment in rows {
            segments.push(segment?);
        }
        Ok(segments)
    }

    /// Replace a chapter's segments atomically.
    pub fn save_segments(&self, chapter_id: i64, segments: &[Segment]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM segments WHERE chapter_id = ?1",
            params![chapter_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO segments (chapter_id, idx, text, segment_type, speaker_id, sound)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for segment in segments {
                stmt.execute(params![
                    chapter_id,
                    segment.idx,
                    segment.text,
                    segment.segment_type.to_string(),
                    segment.speaker_id,
                    segment.sound,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_segment(&self, chapter_id: i64, idx: i64) -> Result<Option<Segment>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT chapter_id, idx, text, segment_type, speaker_id, sound
             FROM segments WHERE chapter_id = ?1 AND idx = ?2",
            params![chapter_id, idx],
            |row| {
                Ok(Segment {
                    chapter_id: row.get(0)?,
                    idx: row.get(1)?,
                    text: row.get(2)?,
                    segment_type: SegmentType::from(row.get::<_, String>(3)?),
                    speaker_id: row.get(4)?,
                    sound: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn update_segment_speaker(
        &self,
        chapter_id: i64,
        idx: i64,
        speaker_id: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE segments SET speaker_id = ?1 WHERE chapter_id = ?2 AND idx = ?3",
            params![speaker_id, chapter_id, idx],
        )?;
        if updated == 0 {
            return Err(anyhow!(
                "segment {} not found in chapter {}",
                idx,
                chapter_id
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Speakers
    // ========================================================================

    pub fn get_speakers(&self) -> Result<Vec<Speaker>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, voice_id, is_narrator FROM speakers ORDER BY name COLLATE NOCASE",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Speaker {
                id: row.get(0)?,
                name: row.get(1)?,
                voice_id: row.get(2)?,
                is_narrator: row.get(3)?,
            })
        })?;
        let mut speakers = Vec::new();
        for speaker in rows {
            speakers.push(speaker?);
        }
        Ok(speakers)
    }

    pub fn get_speaker(&self, id: i64) -> Result<Option<Speaker>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, voice_id, is_narrator FROM speakers WHERE id = ?1",
            params![id],
            |row| {
                Ok(Speaker {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    voice_id: row.get(2)?,
                    is_narrator: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_speaker_by_name(&self, name: &str) -> Result<Option<Speaker>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, voice_id, is_narrator FROM speakers WHERE name = ?1",
            params![name],
            |row| {
                Ok(Speaker {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    voice_id: row.get(2)?,
                    is_narrator: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Look up a speaker by canonical name, creating it if new.
    pub fn get_or_create_speaker(&self, name: &str) -> Result<Speaker> {
        if let Some(speaker) = self.get_speaker_by_name(name)? {
            return Ok(speaker);
        }
        let conn = self.conn.lock().unwrap();
        conn.execute("INSERT INTO speakers (name) VALUES (?1)", params![name])?;
        let id = conn.last_insert_rowid();
        Ok(Speaker {
            id,
            name: name.to_string(),
            voice_id: None,
            is_narrator: false,
        })
    }

    pub fn set_speaker_voice(&self, speaker_id: i64, voice_id: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE speakers SET voice_id = ?1 WHERE id = ?2",
            params![voice_id, speaker_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("speaker {} not found", speaker_id));
        }
        Ok(())
    }

    /// Mark one speaker as the narrator, clearing the flag elsewhere.
    pub fn set_narrator(&self, speaker_id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("UPDATE speakers SET is_narrator = 0", [])?;
        let updated = tx.execute(
            "UPDATE speakers SET is_narrator = 1 WHERE id = ?1",
            params![speaker_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("speaker {} not found", speaker_id));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_narrator(&self) -> Result<Option<Speaker>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, voice_id, is_narrator FROM speakers WHERE is_narrator = 1",
            [],
            |row| {
                Ok(Speaker {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    voice_id: row.get(2)?,
                    is_narrator: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Merge two speakers that turned out to be the same fictional entity:
    /// all of the source's segments move to the target, then the source row
    /// is deleted.
    pub fn merge_speakers(&self, source_id: i64, target_id: i64) -> Result<usize> {
        if source_id == target_id {
            return Err(anyhow!("cannot merge a speaker into itself"));
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let target_exists: Option<i64> = tx
            .query_row(
                "SELECT id FROM speakers WHERE id = ?1",
                params![target_id],
                |row| row.get(0),
            )
            .optional()?;
        if target_exists.is_none() {
            return Err(anyhow!("target speaker {} not found", target_id));
        }
        let moved = tx.execute(
            "UPDATE segments SET speaker_id = ?1 WHERE speaker_id = ?2",
            params![target_id, source_id],
        )?;
        let deleted = tx.execute("DELETE FROM speakers WHERE id = ?1", params![source_id])?;
        if deleted == 0 {
            return Err(anyhow!("source speaker {} not found", source_id));
        }
        tx.commit()?;
        Ok(moved)
    }

    /// Chapters whose segments reference this speaker; their audio must be
    /// invalidated when the speaker's voice changes.
    pub fn chapters_for_speaker(&self, speaker_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT chapter_id FROM segments WHERE speaker_id = ?1 ORDER BY chapter_id",
        )?;
        let rows = stmt.query_map(params![speaker_id], |row| row.get(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    // ========================================================================
    // Voices
    // ========================================================================

    pub fn create_voice(
        &self,
        name: &str,
        provider: ProviderKind,
        settings_json: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO voices (name, provider, settings_json) VALUES (?1, ?2, ?3)",
            params![name, provider.to_string(), settings_json],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_voice(&self, id: i64) -> Result<Option<Voice>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, provider, settings_json, active FROM voices WHERE id = ?1",
            params![id],
            |row| {
                Ok(Voice {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    provider: ProviderKind::from(row.get::<_, String>(2)?),
                    settings_json: row.get(3)?,
                    active: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_voice_by_name(&self, name: &str) -> Result<Option<Voice>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, provider, settings_json, active FROM voices WHERE name = ?1",
            params![name],
            |row| {
                Ok(Voice {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    provider: ProviderKind::from(row.get::<_, String>(2)?),
                    settings_json: row.get(3)?,
                    active: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_voices(&self) -> Result<Vec<Voice>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, provider, settings_json, active FROM voices ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Voice {
                id: row.get(0)?,
                name: row.get(1)?,
                provider: ProviderKind::from(row.get::<_, String>(2)?),
                settings_json: row.get(3)?,
                active: row.get(4)?,
            })
        })?;
        let mut voices = Vec::new();
        for voice in rows {
            voices.push(voice?);
        }
        Ok(voices)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ========================================================================
    // Chapter queue
    // ========================================================================

    pub fn enqueue_chapter(&self, chapter_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO chapter_queue (chapter_id, status) VALUES (?1, 'pending')
             ON CONFLICT(chapter_id) DO UPDATE SET status = 'pending', error_message = NULL",
            params![chapter_id],
        )?;
        Ok(())
    }

    pub fn next_queued_chapter(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT chapter_id FROM chapter_queue WHERE status = 'pending'
             ORDER BY added_at LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn mark_queue_processing(&self, chapter_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE chapter_queue SET status = 'processing' WHERE chapter_id = ?1",
            params![chapter_id],
        )?;
        Ok(())
    }

    pub fn mark_queue_completed(&self, chapter_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM chapter_queue WHERE chapter_id = ?1",
            params![chapter_id],
        )?;
        Ok(())
    }

    pub fn mark_queue_failed(&self, chapter_id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE chapter_queue SET status = 'failed', error_message = ?1
             WHERE chapter_id = ?2",
            params![error, chapter_id],
        )?;
        Ok(())
    }

    /// Reset items stuck in 'processing' from a previous run.
    pub fn reset_stuck_processing(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let reset = conn.execute(
            "UPDATE chapter_queue SET status = 'pending' WHERE status = 'processing'",
            [],
        )?;
        Ok(reset)
    }

    // ========================================================================
    // Pipeline error log
    // ========================================================================

    pub fn log_pipeline_error(
        &self,
        stage: &str,
        chapter_id: Option<i64>,
        error_type: &str,
        message: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pipeline_errors (stage, chapter_id, error_type, message)
             VALUES (?1, ?2, ?3, ?4)",
            params![stage, chapter_id, error_type, message],
        )?;
        Ok(())
    }

    pub fn mark_pipeline_errors_resolved(&self, chapter_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let resolved = conn.execute(
            "UPDATE pipeline_errors SET resolved = 1 WHERE chapter_id = ?1 AND resolved = 0",
            params![chapter_id],
        )?;
        Ok(resolved)
    }

    pub fn recent_errors(&self, limit: usize) -> Result<Vec<PipelineErrorRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, stage, chapter_id, error_type, message, created_at, resolved
             FROM pipeline_errors ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(PipelineErrorRecord {
                id: row.get(0)?,
                stage: row.get(1)?,
                chapter_id: row.get(2)?,
                error_type: row.get(3)?,
                message: row.get(4)?,
                created_at: row.get(5)?,
                resolved: row.get(6)?,
            })
        })?;
        let mut errors = Vec::new();
        for error in rows {
            errors.push(error?);
        }
        Ok(errors)
    }
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

fn parse_ts_required(value: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
