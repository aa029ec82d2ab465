use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use fablecast::config::AppConfig;
use fablecast::database::{Database, ProviderKind};
use fablecast::worker::PipelineOrchestrator;

#[derive(Parser)]
#[command(name = "fablecast", about = "Multi-voice narrated audio pipeline for serialized fiction")]
struct Cli {
    /// Path to config.yaml (defaults to <data dir>/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a chapter from a text file
    Import {
        /// Chapter title
        #[arg(long)]
        title: String,
        /// Path to the chapter text file
        file: PathBuf,
        /// Queue it for processing immediately
        #[arg(long)]
        queue: bool,
    },
    /// Run the full pipeline for a chapter
    Process { chapter_id: i64 },
    /// Reassemble a chapter strictly from cached segment audio
    Rebuild { chapter_id: i64 },
    /// Diagnostic build: per-file report, intermediates kept
    DebugMerge { chapter_id: i64 },
    /// Regenerate a single segment's audio
    Regenerate { chapter_id: i64, index: i64 },
    /// Stamp a processed chapter as published
    Publish { chapter_id: i64 },
    /// Show chapter stages, progress and recent pipeline errors
    Status {
        chapter_id: Option<i64>,
    },
    /// Speaker management
    Speakers {
        #[command(subcommand)]
        command: SpeakerCommand,
    },
    /// Voice management
    Voices {
        #[command(subcommand)]
        command: VoiceCommand,
    },
    /// Read or write a stored setting (e.g. classifier_model)
    Setting {
        key: String,
        /// New value; omit to print the current one
        value: Option<String>,
    },
    /// Drain the chapter queue until interrupted
    QueueWorker,
}

#[derive(Subcommand)]
enum SpeakerCommand {
    /// List all speakers
    List,
    /// Merge one speaker into another (aliases of the same character)
    Merge { source_id: i64, target_id: i64 },
    /// Assign a voice to a speaker
    SetVoice { speaker_id: i64, voice_id: i64 },
    /// Mark a speaker as the narrator
    SetNarrator { speaker_id: i64 },
}

#[derive(Subcommand)]
enum VoiceCommand {
    /// List all voices
    List,
    /// Register a voice
    Add {
        name: String,
        /// Provider tag: preset or neural
        #[arg(long, default_value = "preset")]
        provider: String,
        /// Provider-specific settings blob (JSON)
        #[arg(long)]
        settings: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let default_config = AppConfig::default();
    let config_path = cli
        .config
        .unwrap_or_else(|| default_config.paths.data_dir.join("config.yaml"));
    let config = AppConfig::load(&config_path)?;

    std::fs::create_dir_all(&config.paths.data_dir)?;
    let db = Arc::new(Database::new(&config.paths.db_path())?);
    let orchestrator = PipelineOrchestrator::new(config, db.clone());

    match cli.command {
        Command::Import { title, file, queue } => {
            let text = std::fs::read_to_string(&file)?;
            let chapter_id = db.create_chapter(&title, &text)?;
            println!("Imported chapter {} ({} chars)", chapter_id, text.len());
            if queue {
                db.enqueue_chapter(chapter_id)?;
                println!("Queued chapter {}", chapter_id);
            }
        }
        Command::Process { chapter_id } => {
            let audio = orchestrator.process_chapter(chapter_id).await?;
            println!(
                "Chapter {} → {:?} ({:.1}s, {} bytes)",
                chapter_id, audio.path, audio.duration_secs, audio.size_bytes
            );
        }
        Command::Rebuild { chapter_id } => {
            let audio = orchestrator.rebuild_from_cache(chapter_id).await?;
            println!(
                "Rebuilt chapter {} → {:?} ({:.1}s)",
                chapter_id, audio.path, audio.duration_secs
            );
        }
        Command::DebugMerge { chapter_id } => {
            let report = orchestrator.debug_merge(chapter_id).await?;
            println!(
                "Debug merge for chapter {}: {} files, {} missing",
                report.chapter_id,
                report.files.len(),
                report.missing_files
            );
            for file in &report.files {
                let duration = file
                    .duration_secs
                    .map(|d| format!("{:.2}s", d))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:<20} {:>9} bytes  {:>8}  {}  {}",
                    file.role,
                    file.size_bytes,
                    duration,
                    file.format.as_deref().unwrap_or("-"),
                    file.warnings.join("; "),
                );
            }
            println!("Intermediate kept at {:?}", report.intermediate_path);
            println!(
                "Output {:?} ({:.1}s)",
                report.output_path, report.output_duration_secs
            );
        }
        Command::Regenerate { chapter_id, index } => {
            let path = orchestrator.regenerate_segment(chapter_id, index).await?;
            println!("Regenerated segment {}/{} → {:?}", chapter_id, index, path);
        }
        Command::Publish { chapter_id } => {
            db.mark_published(chapter_id)?;
            println!("Chapter {} published", chapter_id);
        }
        Command::Status { chapter_id } => {
            if let Some(chapter_id) = chapter_id {
                if let Some(progress) = orchestrator.get_progress(chapter_id).await {
                    println!("{}", serde_json::to_string_pretty(&progress)?);
                } else {
                    println!("No active pipeline run for chapter {}", chapter_id);
                }
            } else {
                for chapter in db.list_chapters()? {
                    println!(
                        "{:>5}  {:<40} {:?}",
                        chapter.id, chapter.title, chapter.stage
                    );
                }
                let errors = db.recent_errors(10)?;
                if !errors.is_empty() {
                    println!("\nRecent pipeline errors:");
                    for error in errors {
                        println!(
                            "  [{}] chapter {:?} {} — {}{}",
                            error.stage,
                            error.chapter_id,
                            error.error_type,
                            error.message,
                            if error.resolved { " (resolved)" } else { "" },
                        );
                    }
                }
            }
        }
        Command::Speakers { command } => match command {
            SpeakerCommand::List => {
                for speaker in db.get_speakers()? {
                    println!(
                        "{:>5}  {:<24} voice={:<6} {}",
                        speaker.id,
                        speaker.name,
                        speaker
                            .voice_id
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        if speaker.is_narrator { "(narrator)" } else { "" },
                    );
                }
            }
            SpeakerCommand::Merge {
                source_id,
                target_id,
            } => {
                let moved = orchestrator.merge_speakers(source_id, target_id)?;
                println!(
                    "Merged speaker {} into {} ({} segments moved)",
                    source_id, target_id, moved
                );
            }
            SpeakerCommand::SetVoice {
                speaker_id,
                voice_id,
            } => {
                orchestrator.set_speaker_voice(speaker_id, Some(voice_id))?;
                println!("Speaker {} now uses voice {}", speaker_id, voice_id);
            }
            SpeakerCommand::SetNarrator { speaker_id } => {
                db.set_narrator(speaker_id)?;
                println!("Speaker {} is now the narrator", speaker_id);
            }
        },
        Command::Voices { command } => match command {
            VoiceCommand::List => {
                for voice in db.list_voices()? {
                    println!(
                        "{:>5}  {:<24} {:<7} {}",
                        voice.id,
                        voice.name,
                        voice.provider,
                        if voice.active { "active" } else { "inactive" },
                    );
                }
            }
            VoiceCommand::Add {
                name,
                provider,
                settings,
            } => {
                let provider = ProviderKind::from(provider);
                let id = db.create_voice(&name, provider, settings.as_deref())?;
                println!("Voice {} registered as {}", name, id);
            }
        },
        Command::Setting { key, value } => match value {
            Some(value) => {
                db.set_setting(&key, &value)?;
                println!("{} = {}", key, value);
            }
            None => match db.get_setting(&key)? {
                Some(value) => println!("{} = {}", key, value),
                None => println!("{} is not set", key),
            },
        },
        Command::QueueWorker => {
            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("Shutdown requested, finishing current chapter");
                    ctrl_c_cancel.cancel();
                }
            });
            orchestrator.run_queue(cancel).await;
        }
    }

    Ok(())
}
