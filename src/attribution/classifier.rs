//! Client for the hosted text-classification service.
//!
//! Sends batches of spans (with context windows and the known character
//! roster) to the service's completion endpoint and parses the structured
//! speaker assignments out of the response.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::AttributionConfig;
use crate::database::SegmentType;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classification service unreachable: {0}")]
    Unreachable(String),

    #[error("classification service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed classification response: {0}")]
    Malformed(String),
}

/// One span sent for classification.
#[derive(Debug, Clone, Serialize)]
pub struct SpanRequest {
    /// Absolute index within the chapter's span list.
    pub index: usize,
    pub kind: String,
    pub text: String,
    /// The ±N neighboring spans, truncated, joined for context.
    pub context: String,
}

/// One classified span as returned by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct SpanClassification {
    pub index: usize,
    pub speaker: String,
    #[serde(rename = "type")]
    pub segment_type: SegmentType,
    #[serde(default)]
    pub sound: Option<String>,
}

pub struct ClassifierClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl ClassifierClient {
    pub fn new(config: &AttributionConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        }
    }

    /// Classify one batch of spans. Returns the parsed per-span assignments;
    /// entries the service omitted are simply absent from the result.
    pub async fn classify_batch(
        &self,
        known_speakers: &[String],
        aliases: &std::collections::HashMap<String, String>,
        batch: &[SpanRequest],
    ) -> Result<Vec<SpanClassification>, ClassifierError> {
        let prompt = build_prompt(known_speakers, aliases, batch);

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt,
            system: Some(SYSTEM_PROMPT.to_string()),
            stream: false,
            options: Some(GenerateOptions {
                temperature: 0.2,
                num_predict: 4096,
            }),
        };

        log::info!(
            "Classifying batch of {} spans (model={})",
            batch.len(),
            self.model
        );

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ClassifierError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status { status, body });
        }

        let result: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::Malformed(e.to_string()))?;

        parse_classifications(&result.response)
    }
}

const SYSTEM_PROMPT: &str = "You are a dialogue attribution assistant for fiction. \
For each span you are given, decide who is speaking and what kind of span it is. \
Rules: a single short quoted word or phrase with no attribution verb nearby is \
emphasis, not speech - classify it as narration. Use the speaker name 'unknown' \
when the speaker is genuinely ambiguous. Bracketed system messages and alert-cue \
lines are 'announcement' or 'sound_effect' spans, not narration or dialogue. \
Always respond with valid JSON.";

fn build_prompt(
    known_speakers: &[String],
    aliases: &std::collections::HashMap<String, String>,
    batch: &[SpanRequest],
) -> String {
    let alias_lines: Vec<String> = aliases
        .iter()
        .map(|(alias, canonical)| format!("- {} is the same character as {}", alias, canonical))
        .collect();

    format!(
        "Known characters: {}\n\nAliases:\n{}\n\nSpans to classify:\n{}\n\n\
         Respond with JSON only, in the form:\n\
         {{\"classifications\": [{{\"index\": 0, \"speaker\": \"name\", \"type\": \
         \"narration|dialogue|thought|announcement|sound_effect\", \"sound\": null}}]}}",
        known_speakers.join(", "),
        if alias_lines.is_empty() {
            "(none)".to_string()
        } else {
            alias_lines.join("\n")
        },
        serde_json::to_string_pretty(batch).unwrap_or_default(),
    )
}

/// Pull span classifications out of the model's response text.
fn parse_classifications(response: &str) -> Result<Vec<SpanClassification>, ClassifierError> {
    let json = extract_json(response)
        .ok_or_else(|| ClassifierError::Malformed("no JSON object in response".to_string()))?;

    let entries = json
        .get("classifications")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ClassifierError::Malformed("missing 'classifications' array".to_string()))?;

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<SpanClassification>(entry.clone()) {
            Ok(classification) => out.push(classification),
            Err(e) => log::warn!("Skipping malformed classification entry: {}", e),
        }
    }
    Ok(out)
}

/// Extract JSON from an LLM response (handles markdown code blocks)
fn extract_json(response: &str) -> Option<serde_json::Value> {
    let trimmed = response.trim();

    // Try direct parse first
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(json);
    }

    // Try to extract from markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after_marker = &trimmed[start + 7..];
        if let Some(end) = after_marker.find("```") {
            let json_str = &after_marker[..end].trim();
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(json_str) {
                return Some(json);
            }
        }
    }

    // Try to find a JSON object in the response
    if let Some(start) = trimmed.find('{') {
        let mut depth = 0;
        let mut end = start;
        for (i, c) in trimmed[start..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = start + i + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
        if end > start {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&trimmed[start..end]) {
                return Some(json);
            }
        }
    }

    None
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}
