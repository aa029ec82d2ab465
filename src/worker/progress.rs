//! Ephemeral per-chapter progress snapshots.
//!
//! Snapshots are overwritten on each pipeline invocation and carry no
//! durability guarantee. Mutation goes through a [`ProgressHandle`] that
//! only the orchestrator can construct; readers get cloned snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterPhase {
    Idle,
    Segmenting,
    Attributing,
    Synthesizing,
    Encoding,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChapterProgress {
    pub chapter_id: i64,
    pub phase: ChapterPhase,
    pub total_spans: usize,
    pub batches_done: usize,
    pub batches_total: usize,
    pub segments_done: usize,
    pub segments_total: usize,
    pub encode_pass: Option<String>,
    pub encode_elapsed_secs: f64,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ChapterProgress {
    fn new(chapter_id: i64) -> Self {
        Self {
            chapter_id,
            phase: ChapterPhase::Idle,
            total_spans: 0,
            batches_done: 0,
            batches_total: 0,
            segments_done: 0,
            segments_total: 0,
            encode_pass: None,
            encode_elapsed_secs: 0.0,
            message: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Clone, Default)]
pub struct ProgressStore {
    inner: Arc<RwLock<HashMap<i64, ChapterProgress>>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, chapter_id: i64) -> Option<ChapterProgress> {
        self.inner.read().await.get(&chapter_id).cloned()
    }

    /// Mutating handle for one chapter's snapshot. Crate-private so the
    /// orchestrator stays the only writer.
    pub(crate) fn handle(&self, chapter_id: i64) -> ProgressHandle {
        ProgressHandle {
            store: self.clone(),
            chapter_id,
        }
    }
}

#[derive(Clone)]
pub struct ProgressHandle {
    store: ProgressStore,
    chapter_id: i64,
}

impl ProgressHandle {
    async fn update(&self, f: impl FnOnce(&mut ChapterProgress)) {
        let mut map = self.store.inner.write().await;
        let entry = map
            .entry(self.chapter_id)
            .or_insert_with(|| ChapterProgress::new(self.chapter_id));
        f(entry);
        entry.updated_at = Utc::now();
    }

    /// Fresh snapshot at the start of a pipeline invocation.
    pub async fn reset(&self) {
        let mut map = self.store.inner.write().await;
        map.insert(self.chapter_id, ChapterProgress::new(self.chapter_id));
    }

    pub async fn set_phase(&self, phase: ChapterPhase) {
        self.update(|p| p.phase = phase).await;
    }

    pub async fn attribution(&self, total_spans: usize, batches_done: usize, batches_total: usize) {
        self.update(|p| {
            p.phase = ChapterPhase::Attributing;
            p.total_spans = total_spans;
            p.batches_done = batches_done;
            p.batches_total = batches_total;
        })
        .await;
    }

    pub async fn synthesis(&self, done: usize, total: usize) {
        self.update(|p| {
            p.phase = ChapterPhase::Synthesizing;
            p.segments_done = done;
            p.segments_total = total;
        })
        .await;
    }

    pub async fn encoding(&self, pass: &str, elapsed_secs: f64) {
        let pass = pass.to_string();
        self.update(move |p| {
            p.phase = ChapterPhase::Encoding;
            p.encode_pass = Some(pass);
            p.encode_elapsed_secs = elapsed_secs;
        })
        .await;
    }

    pub async fn complete(&self) {
        self.update(|p| p.phase = ChapterPhase::Complete).await;
    }

    pub async fn fail(&self, message: String) {
        self.update(move |p| {
            p.phase = ChapterPhase::Failed;
            p.message = Some(message);
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_chapter_has_no_snapshot() {
        let store = ProgressStore::new();
        assert!(store.get(1).await.is_none());
    }

    #[tokio::test]
    async fn test_handle_updates_snapshot() {
        let store = ProgressStore::new();
        let handle = store.handle(1);

        handle.attribution(40, 1, 2).await;
        let progress = store.get(1).await.unwrap();
        assert_eq!(progress.phase, ChapterPhase::Attributing);
        assert_eq!(progress.batches_done, 1);
        assert_eq!(progress.total_spans, 40);

        handle.synthesis(3, 10).await;
        let progress = store.get(1).await.unwrap();
        assert_eq!(progress.phase, ChapterPhase::Synthesizing);
        assert_eq!(progress.segments_done, 3);
        // Earlier counters survive within the same invocation.
        assert_eq!(progress.batches_total, 2);
    }

    #[tokio::test]
    async fn test_reset_overwrites_previous_invocation() {
        let store = ProgressStore::new();
        let handle = store.handle(1);

        handle.fail("synthesis failed".to_string()).await;
        handle.reset().await;

        let progress = store.get(1).await.unwrap();
        assert_eq!(progress.phase, ChapterPhase::Idle);
        assert!(progress.message.is_none());
    }

    #[tokio::test]
    async fn test_chapters_are_independent() {
        let store = ProgressStore::new();
        store.handle(1).synthesis(1, 5).await;
        store.handle(2).fail("boom".to_string()).await;

        assert_eq!(store.get(1).await.unwrap().phase, ChapterPhase::Synthesizing);
        assert_eq!(store.get(2).await.unwrap().phase, ChapterPhase::Failed);
    }
}
