//! fablecast — multi-voice narrated audio pipeline for serialized fiction.
//!
//! Raw chapter text flows through the quote segmenter, the speaker
//! attribution engine, per-segment synthesis with a content-addressed cache,
//! and finally two-pass assembly into one normalized chapter file, all
//! coordinated by the pipeline orchestrator.

pub mod assembly;
pub mod attribution;
pub mod config;
pub mod database;
pub mod error;
pub mod retry;
pub mod segmenter;
pub mod synthesis;
pub mod worker;

pub use config::AppConfig;
pub use error::PipelineError;
pub use worker::PipelineOrchestrator;
