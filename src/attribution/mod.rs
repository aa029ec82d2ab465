//! Two-stage speaker attribution.
//!
//! Stage 1 runs the quote segmenter — local and infallible. Stage 2 batches
//! the resulting spans through the classification service with a context
//! window per span, writing results back by absolute index so batch-internal
//! ordering can never corrupt the chapter's global ordering. If the service
//! is unreachable or malformed, unresolved spans degrade to a deterministic
//! default instead of failing the chapter.

pub mod classifier;

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::{AppConfig, AttributionConfig};
use crate::database::SegmentType;
use crate::retry::RetryPolicy;
use crate::segmenter::{self, QuoteSegmenter, RawSpan, SpanType};
use classifier::{ClassifierClient, SpanRequest};

/// Reserved speaker names.
pub const NARRATOR: &str = "narrator";
pub const UNKNOWN_SPEAKER: &str = "unknown";
pub const ANNOUNCER: &str = "ai_announcer";

/// One span with its resolved speaker and final type.
#[derive(Debug, Clone, Serialize)]
pub struct AttributedSpan {
    pub idx: usize,
    pub text: String,
    pub segment_type: SegmentType,
    pub speaker: String,
    pub sound: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionPhase {
    Segmenting,
    Attributing,
    Complete,
    Error,
}

/// Progress event streamed to the caller. `resolved` carries the segments
/// newly classified by the most recent batch, for live UIs; it is not
/// required for correctness.
#[derive(Debug, Clone, Serialize)]
pub struct AttributionEvent {
    pub phase: AttributionPhase,
    pub total_spans: usize,
    pub batches_total: usize,
    pub batches_done: usize,
    pub resolved: Vec<AttributedSpan>,
}

struct Resolution {
    speaker: String,
    segment_type: SegmentType,
    sound: Option<String>,
}

pub struct AttributionEngine {
    segmenter: QuoteSegmenter,
    classifier: ClassifierClient,
    retry: RetryPolicy,
    config: AttributionConfig,
    aliases: HashMap<String, String>,
}

impl AttributionEngine {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            segmenter: QuoteSegmenter::new(&config.segmenter),
            classifier: ClassifierClient::new(&config.attribution),
            retry: RetryPolicy::from_config(&config.retry),
            config: config.attribution.clone(),
            aliases: config.aliases.clone(),
        }
    }

    /// Attribute a chapter's text. Always terminates with a valid span list;
    /// classification failures degrade to the deterministic default rather
    /// than erroring.
    pub async fn attribute(
        &self,
        chapter_text: &str,
        known_speakers: &[String],
        progress: Option<&mpsc::Sender<AttributionEvent>>,
    ) -> Vec<AttributedSpan> {
        send_event(
            progress,
            AttributionEvent {
                phase: AttributionPhase::Segmenting,
                total_spans: 0,
                batches_total: 0,
                batches_done: 0,
                resolved: Vec::new(),
            },
        )
        .await;

        let spans = self.segmenter.segment(chapter_text);
        if !segmenter::verify_reconstruction(chapter_text, &spans) {
            // Tolerated: the spans are still usable, but flag the input.
            log::warn!(
                "Segmentation reconstruction mismatch ({} spans, {} chars input)",
                spans.len(),
                chapter_text.len()
            );
        }

        let requests = build_span_requests(&spans, &self.config);
        let batches_total = requests.len().div_ceil(self.config.batch_size.max(1));
        let mut resolutions: Vec<Option<Resolution>> = Vec::with_capacity(spans.len());
        resolutions.resize_with(spans.len(), || None);

        for (batch_no, batch) in requests.chunks(self.config.batch_size.max(1)).enumerate() {
            let result = self
                .retry
                .run("classification batch", || {
                    self.classifier
                        .classify_batch(known_speakers, &self.aliases, batch)
                })
                .await;

            let mut newly_resolved = Vec::new();
            match result {
                Ok(classifications) => {
                    let lo = batch.first().map(|r| r.index).unwrap_or(0);
                    let hi = batch.last().map(|r| r.index).unwrap_or(0);
                    for c in classifications {
                        // An out-of-range index means the service invented a
                        // span; ignore it rather than corrupt the ordering.
                        if c.index < lo || c.index > hi {
                            log::warn!("Classifier returned out-of-batch index {}", c.index);
                            continue;
                        }
                        let speaker = self.canonicalize(&c.speaker, c.segment_type);
                        newly_resolved.push(AttributedSpan {
                            idx: c.index,
                            text: spans[c.index].text.clone(),
                            segment_type: c.segment_type,
                            speaker: speaker.clone(),
                            sound: c.sound.clone(),
                        });
                        resolutions[c.index] = Some(Resolution {
                            speaker,
                            segment_type: c.segment_type,
                            sound: c.sound,
                        });
                    }
                }
                Err(e) => {
                    log::warn!(
                        "Classification batch {}/{} failed, falling back to defaults: {}",
                        batch_no + 1,
                        batches_total,
                        e
                    );
                }
            }

            send_event(
                progress,
                AttributionEvent {
                    phase: AttributionPhase::Attributing,
                    total_spans: spans.len(),
                    batches_total,
                    batches_done: batch_no + 1,
                    resolved: newly_resolved,
                },
            )
            .await;

            if batch_no + 1 < batches_total {
                tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }
        }

        let attributed = finalize(&spans, resolutions);

        send_event(
            progress,
            AttributionEvent {
                phase: AttributionPhase::Complete,
                total_spans: attributed.len(),
                batches_total,
                batches_done: batches_total,
                resolved: Vec::new(),
            },
        )
        .await;

        attributed
    }

    /// Resolve a returned speaker name to its canonical form, falling back
    /// to the reserved names when the service left it blank.
    fn canonicalize(&self, speaker: &str, segment_type: SegmentType) -> String {
        let trimmed = speaker.trim();
        if trimmed.is_empty() {
            return default_speaker(segment_type).to_string();
        }
        if let Some(canonical) = self.aliases.get(trimmed) {
            return canonical.clone();
        }
        // Alias maps are configured by humans; tolerate case drift.
        if let Some((_, canonical)) = self
            .aliases
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(trimmed))
        {
            return canonical.clone();
        }
        trimmed.to_string()
    }
}

async fn send_event(
    progress: Option<&mpsc::Sender<AttributionEvent>>,
    event: AttributionEvent,
) {
    if let Some(tx) = progress {
        let _ = tx.send(event).await;
    }
}

fn default_speaker(segment_type: SegmentType) -> &'static str {
    match segment_type {
        SegmentType::Dialogue | SegmentType::Thought => UNKNOWN_SPEAKER,
        SegmentType::Announcement | SegmentType::SoundEffect => ANNOUNCER,
        SegmentType::Narration => NARRATOR,
    }
}

/// The deterministic fallback when the service could not resolve a span:
/// dialogue becomes `unknown`, narration becomes `narrator`.
fn fallback_for(span: &RawSpan) -> Resolution {
    let segment_type = match span.span_type {
        SpanType::Dialogue => SegmentType::Dialogue,
        SpanType::Narration => SegmentType::Narration,
    };
    Resolution {
        speaker: default_speaker(segment_type).to_string(),
        segment_type,
        sound: None,
    }
}

/// Build one request per span with its ±N-span truncated context window.
fn build_span_requests(spans: &[RawSpan], config: &AttributionConfig) -> Vec<SpanRequest> {
    spans
        .iter()
        .enumerate()
        .map(|(i, span)| {
            let lo = i.saturating_sub(config.context_spans);
            let hi = (i + config.context_spans + 1).min(spans.len());
            let context = spans[lo..hi]
                .iter()
                .map(|s| truncate_chars(s.text.trim(), config.context_span_chars))
                .collect::<Vec<_>>()
                .join(" ");
            SpanRequest {
                index: i,
                kind: match span.span_type {
                    SpanType::Narration => "narration".to_string(),
                    SpanType::Dialogue => "dialogue".to_string(),
                },
                text: span.text.clone(),
                context,
            }
        })
        .collect()
}

fn finalize(spans: &[RawSpan], resolutions: Vec<Option<Resolution>>) -> Vec<AttributedSpan> {
    spans
        .iter()
        .zip(resolutions)
        .enumerate()
        .map(|(idx, (span, resolution))| {
            let resolution = resolution.unwrap_or_else(|| fallback_for(span));
            AttributedSpan {
                idx,
                text: span.text.clone(),
                segment_type: resolution.segment_type,
                speaker: resolution.speaker,
                sound: resolution.sound,
            }
        })
        .collect()
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}
