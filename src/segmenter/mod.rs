//! Quote-aware lexical splitter.
//!
//! Partitions raw chapter prose into ordered narration/dialogue spans without
//! ever losing or duplicating a character of input: concatenating the spans
//! in order and collapsing whitespace runs reproduces the collapsed input
//! exactly. Speaker attribution happens later — this pass is fully local and
//! deterministic.

use crate::config::SegmenterConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanType {
    Narration,
    Dialogue,
}

/// One ordered span of chapter text, typed but not yet attributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSpan {
    pub span_type: SpanType,
    pub text: String,
}

const QUOTE_GLYPHS: [char; 3] = ['"', '\u{201C}', '\u{201D}'];

pub struct QuoteSegmenter {
    /// Lowercased alert-cue prefixes.
    alert_cues: Vec<String>,
    special_names: Vec<String>,
}

impl QuoteSegmenter {
    pub fn new(config: &SegmenterConfig) -> Self {
        Self {
            alert_cues: config
                .alert_cues
                .iter()
                .map(|c| c.to_lowercase())
                .collect(),
            special_names: config.special_quoted_names.clone(),
        }
    }

    /// Split `text` into ordered narration/dialogue spans.
    pub fn segment(&self, text: &str) -> Vec<RawSpan> {
        let mut spans = Vec::new();
        let mut block = String::new();

        // Alert-cue lines become standalone narration segments and never
        // enter the quote scanner, so numeric/alert lines can't be
        // misclassified as dialogue. Lines keep their terminators so the
        // reconstruction invariant holds across block boundaries.
        for line in text.split_inclusive('\n') {
            if self.is_alert_line(line) {
                self.scan_block(&block, &mut spans);
                block.clear();
                push_span(&mut spans, SpanType::Narration, line.to_string());
            } else {
                block.push_str(line);
            }
        }
        self.scan_block(&block, &mut spans);

        self.merge_special_names(spans)
    }

    /// A line beginning with a configured alert cue, in any case variant and
    /// optionally quote-wrapped.
    fn is_alert_line(&self, line: &str) -> bool {
        let trimmed = line.trim().trim_start_matches(QUOTE_GLYPHS);
        if trimmed.is_empty() {
            return false;
        }
        let lower = trimmed.to_lowercase();
        self.alert_cues.iter().any(|cue| lower.starts_with(cue))
    }

    /// Single left-to-right scan toggling on quote glyphs. An unclosed
    /// trailing quote is emitted as dialogue through end of input.
    fn scan_block(&self, block: &str, out: &mut Vec<RawSpan>) {
        if block.is_empty() {
            return;
        }
        let mut in_quote = false;
        let mut current = String::new();

        for ch in block.chars() {
            if QUOTE_GLYPHS.contains(&ch) {
                if in_quote {
                    current.push(ch);
                    push_span(out, SpanType::Dialogue, std::mem::take(&mut current));
                    in_quote = false;
                } else {
                    push_span(out, SpanType::Narration, std::mem::take(&mut current));
                    current.push(ch);
                    in_quote = true;
                }
            } else {
                current.push(ch);
            }
        }

        if !current.is_empty() {
            let span_type = if in_quote {
                SpanType::Dialogue
            } else {
                SpanType::Narration
            };
            push_span(out, span_type, current);
        }
    }

    /// Fold quoted spans that are really proper nouns (a monster's name,
    /// say) back into surrounding narration so they never trigger a voice
    /// change. Prefers the previous span, falls back to the next, and
    /// stands alone as narration if neither neighbor is narration.
    fn merge_special_names(&self, spans: Vec<RawSpan>) -> Vec<RawSpan> {
        if self.special_names.is_empty() {
            return spans;
        }

        let mut result: Vec<RawSpan> = Vec::with_capacity(spans.len());
        let mut pending_prefix = String::new();
        // After folding a name into the previous narration span, the
        // narration that follows it belongs to the same sentence and is
        // absorbed as well.
        let mut absorb_next = false;
        let mut iter = spans.into_iter().peekable();

        while let Some(span) = iter.next() {
            if span.span_type == SpanType::Dialogue && self.is_special_name(&span.text) {
                let prev_is_narration = result
                    .last()
                    .map(|s| s.span_type == SpanType::Narration)
                    .unwrap_or(false);
                if prev_is_narration {
                    result.last_mut().unwrap().text.push_str(&span.text);
                    absorb_next = true;
                } else if iter
                    .peek()
                    .map(|s| s.span_type == SpanType::Narration)
                    .unwrap_or(false)
                {
                    pending_prefix.push_str(&span.text);
                } else {
                    result.push(RawSpan {
                        span_type: SpanType::Narration,
                        text: span.text,
                    });
                }
            } else {
                if absorb_next && span.span_type == SpanType::Narration && pending_prefix.is_empty()
                {
                    result.last_mut().unwrap().text.push_str(&span.text);
                    absorb_next = false;
                    continue;
                }
                absorb_next = false;
                let text = if pending_prefix.is_empty() {
                    span.text
                } else {
                    std::mem::take(&mut pending_prefix) + &span.text
                };
                result.push(RawSpan {
                    span_type: span.span_type,
                    text,
                });
            }
        }

        if !pending_prefix.is_empty() {
            result.push(RawSpan {
                span_type: SpanType::Narration,
                text: pending_prefix,
            });
        }

        result
    }

    fn is_special_name(&self, text: &str) -> bool {
        let inner = text.trim().trim_matches(QUOTE_GLYPHS).trim();
        self.special_names.iter().any(|n| n == inner)
    }
}

/// Append a span, dropping empty ones. Whitespace-only text is re-attached
/// to the previous span instead of discarded so no character is lost.
fn push_span(out: &mut Vec<RawSpan>, span_type: SpanType, text: String) {
    if text.is_empty() {
        return;
    }
    if text.trim().is_empty() {
        if let Some(last) = out.last_mut() {
            last.text.push_str(&text);
        }
        return;
    }
    out.push(RawSpan { span_type, text });
}

/// Collapse whitespace runs to single spaces and trim.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Check the reconstruction invariant: spans concatenated in order and
/// whitespace-collapsed must equal the whitespace-collapsed input.
pub fn verify_reconstruction(text: &str, spans: &[RawSpan]) -> bool {
    let rebuilt: String = spans.iter().map(|s| s.text.as_str()).collect();
    normalize_whitespace(&rebuilt) == normalize_whitespace(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter() -> QuoteSegmenter {
        QuoteSegmenter::new(&SegmenterConfig {
            alert_cues: vec!["ding!".to_string()],
            special_quoted_names: vec!["Razorback".to_string()],
        })
    }

    fn plain_segmenter() -> QuoteSegmenter {
        QuoteSegmenter::new(&SegmenterConfig {
            alert_cues: Vec::new(),
            special_quoted_names: Vec::new(),
        })
    }

    // =========================================================================
    // Basic splitting
    // =========================================================================

    #[test]
    fn test_dialogue_then_narration() {
        let spans = plain_segmenter().segment(r#""Hello," Jake said. He walked away."#);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].span_type, SpanType::Dialogue);
        assert_eq!(spans[0].text, r#""Hello,""#);
        assert_eq!(spans[1].span_type, SpanType::Narration);
        assert_eq!(spans[1].text, " Jake said. He walked away.");
    }

    #[test]
    fn test_narration_only() {
        let spans = plain_segmenter().segment("He walked to the door and stopped.");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span_type, SpanType::Narration);
    }

    #[test]
    fn test_curly_quotes() {
        let spans = plain_segmenter().segment("She said \u{201C}come in\u{201D} and smiled.");
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[1].span_type, SpanType::Dialogue);
        assert_eq!(spans[1].text, "\u{201C}come in\u{201D}");
    }

    #[test]
    fn test_unclosed_trailing_quote_is_dialogue() {
        let spans = plain_segmenter().segment(r#"He whispered, "don't look back"#);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].span_type, SpanType::Dialogue);
        assert_eq!(spans[1].text, r#""don't look back"#);
    }

    #[test]
    fn test_empty_input() {
        assert!(plain_segmenter().segment("").is_empty());
        assert!(plain_segmenter().segment("   \n  \n").is_empty());
    }

    // =========================================================================
    // Alert cues
    // =========================================================================

    #[test]
    fn test_alert_line_is_standalone_narration() {
        let text = "He checked the panel.\nDing! Level 14 reached.\n\"Nice,\" he said.";
        let spans = segmenter().segment(text);
        let alert = spans
            .iter()
            .find(|s| s.text.contains("Level 14"))
            .expect("alert span");
        assert_eq!(alert.span_type, SpanType::Narration);
        // The alert line is its own span, not merged with neighbors.
        assert!(alert.text.trim().starts_with("Ding!"));
    }

    #[test]
    fn test_alert_line_case_and_quote_variants() {
        let s = segmenter();
        for text in ["DING! 500 XP", "ding! 500 XP", "\"Ding! 500 XP\""] {
            let spans = s.segment(text);
            assert_eq!(spans.len(), 1, "variant {:?}", text);
            assert_eq!(spans[0].span_type, SpanType::Narration, "variant {:?}", text);
        }
    }

    #[test]
    fn test_alert_line_never_becomes_dialogue() {
        // Quote-wrapped alert would otherwise toggle the quote scanner.
        let spans = segmenter().segment("\"Ding! You have slain a goblin.\"\nHe grinned.");
        assert!(spans.iter().all(|s| s.span_type == SpanType::Narration));
    }

    // =========================================================================
    // Special quoted names
    // =========================================================================

    #[test]
    fn test_special_name_merges_into_previous_narration() {
        let spans = segmenter().segment(r#"The beast known as "Razorback" charged."#);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span_type, SpanType::Narration);
        assert_eq!(spans[0].text, r#"The beast known as "Razorback" charged."#);
    }

    #[test]
    fn test_special_name_falls_back_to_next_narration() {
        let spans = segmenter().segment(r#""Razorback" charged at him."#);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span_type, SpanType::Narration);
        assert_eq!(spans[0].text, r#""Razorback" charged at him."#);
    }

    #[test]
    fn test_special_name_alone_becomes_narration() {
        let spans = segmenter().segment(r#""Razorback""#);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span_type, SpanType::Narration);
    }

    #[test]
    fn test_special_name_never_standalone_dialogue() {
        for text in [
            r#"The beast "Razorback" roared. "Run!" he yelled."#,
            r#""Razorback" it was called."#,
            r#"They feared "Razorback""#,
        ] {
            let spans = segmenter().segment(text);
            for span in &spans {
                if span.span_type == SpanType::Dialogue {
                    let inner = span.text.trim().trim_matches(QUOTE_GLYPHS).trim();
                    assert_ne!(inner, "Razorback", "input {:?}", text);
                }
            }
        }
    }

    #[test]
    fn test_non_special_dialogue_untouched() {
        let spans = segmenter().segment(r#"The beast said "hello" quietly."#);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[1].span_type, SpanType::Dialogue);
    }

    // =========================================================================
    // Reconstruction invariant
    // =========================================================================

    #[test]
    fn test_reconstruction_invariant() {
        let inputs = [
            r#""Hello," Jake said. He walked away."#,
            "Plain narration with no quotes at all.",
            "Ding! 500 XP gained.\nHe smiled.\n\"Finally,\" he said.",
            r#"A "Razorback" appeared. "Kill it!" someone screamed. "Razorback""#,
            "Unbalanced \"quote to the end",
            "Multi\n\nparagraph\n\ntext with \"dialogue\" inside.",
            "\u{201C}Curly\u{201D} and \"straight\" quotes mixed.",
            "  leading and trailing whitespace  ",
            "\"a\" \"b\" \"c\"",
        ];
        for input in inputs {
            let spans = segmenter().segment(input);
            assert!(
                verify_reconstruction(input, &spans),
                "reconstruction failed for {:?}\nspans: {:?}",
                input,
                spans
            );
        }
    }

    #[test]
    fn test_adjacent_quotes_keep_separating_whitespace() {
        let spans = plain_segmenter().segment(r#""a" "b""#);
        let rebuilt: String = spans.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(normalize_whitespace(&rebuilt), r#""a" "b""#);
    }
}
