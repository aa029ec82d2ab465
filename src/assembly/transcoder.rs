//! External transcoder wrapper (ffmpeg/ffprobe).
//!
//! Both build passes run ffmpeg as a subprocess and parse its stderr stream
//! live through [`EncodeProgressSink`], which extracts the `time=` field and
//! ignores everything else, so incidental output changes can't break
//! progress reporting.

use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodePass {
    /// Pass 1: resample everything to a common rate/layout and concatenate.
    Concat,
    /// Pass 2: loudness-normalize the intermediate into the final output.
    Normalize,
    /// Silence generation for pause clips.
    Silence,
}

impl std::fmt::Display for TranscodePass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Concat => write!(f, "concat"),
            Self::Normalize => write!(f, "normalize"),
            Self::Silence => write!(f, "silence"),
        }
    }
}

/// Elapsed media time reported by a running pass.
#[derive(Debug, Clone)]
pub struct EncodeProgress {
    pub pass: TranscodePass,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum TranscoderError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },

    #[error("{pass} pass failed ({status}): {stderr}")]
    PassFailed {
        pass: TranscodePass,
        status: String,
        stderr: String,
    },

    #[error("probe failed for {path:?}: {message}")]
    Probe { path: PathBuf, message: String },

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Parses ffmpeg stderr lines and forwards elapsed-time progress.
pub struct EncodeProgressSink {
    pass: TranscodePass,
    tx: Option<mpsc::Sender<EncodeProgress>>,
    time_re: Regex,
}

impl EncodeProgressSink {
    pub fn new(pass: TranscodePass, tx: Option<mpsc::Sender<EncodeProgress>>) -> Self {
        Self {
            pass,
            tx,
            time_re: Regex::new(r"time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").unwrap(),
        }
    }

    /// Feed one stderr line; emits a progress event when the line carries a
    /// `time=` field, silently ignores everything else.
    pub async fn observe(&self, line: &str) {
        if let Some(elapsed) = self.parse_elapsed(line) {
            if let Some(tx) = &self.tx {
                let _ = tx
                    .send(EncodeProgress {
                        pass: self.pass,
                        elapsed,
                    })
                    .await;
            }
        }
    }

    fn parse_elapsed(&self, line: &str) -> Option<Duration> {
        let caps = self.time_re.captures(line)?;
        let hours: u64 = caps[1].parse().ok()?;
        let minutes: u64 = caps[2].parse().ok()?;
        let seconds: f64 = caps[3].parse().ok()?;
        Some(Duration::from_secs_f64(
            (hours * 3600 + minutes * 60) as f64 + seconds,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub duration_secs: f64,
    pub format_name: String,
}

#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcoder {
    pub fn new() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }

    /// Pass 1: concatenate `inputs` in order, resampled to 44.1 kHz stereo.
    pub async fn concat_resample(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        progress: Option<mpsc::Sender<EncodeProgress>>,
    ) -> Result<(), TranscoderError> {
        let list_path = output.with_extension("txt");
        std::fs::write(&list_path, concat_list(inputs))?;

        let list_str = list_path.to_string_lossy();
        let output_str = output.to_string_lossy();
        let result = self
            .run_ffmpeg(
                &[
                    "-y",
                    "-f",
                    "concat",
                    "-safe",
                    "0",
                    "-i",
                    list_str.as_ref(),
                    "-ar",
                    "44100",
                    "-ac",
                    "2",
                    "-codec:a",
                    "libmp3lame",
                    "-q:a",
                    "4",
                    output_str.as_ref(),
                ],
                TranscodePass::Concat,
                progress,
            )
            .await;

        // Keep the list on failure so the inputs can be inspected.
        if result.is_ok() {
            let _ = std::fs::remove_file(&list_path);
        }
        result
    }

    /// Pass 2: loudness-normalize `input` into the final `output`.
    pub async fn loudness_normalize(
        &self,
        input: &Path,
        output: &Path,
        progress: Option<mpsc::Sender<EncodeProgress>>,
    ) -> Result<(), TranscoderError> {
        let input_str = input.to_string_lossy();
        let output_str = output.to_string_lossy();
        self.run_ffmpeg(
            &[
                "-y",
                "-i",
                input_str.as_ref(),
                "-af",
                "loudnorm=I=-16:TP=-1.5:LRA=11",
                "-ar",
                "44100",
                "-codec:a",
                "libmp3lame",
                "-q:a",
                "4",
                output_str.as_ref(),
            ],
            TranscodePass::Normalize,
            progress,
        )
        .await
    }

    /// Generate a silence clip of the given duration.
    pub async fn generate_silence(
        &self,
        duration_ms: u64,
        output: &Path,
    ) -> Result<(), TranscoderError> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let seconds = format!("{:.3}", duration_ms as f64 / 1000.0);
        let output_str = output.to_string_lossy();
        self.run_ffmpeg(
            &[
                "-y",
                "-f",
                "lavfi",
                "-i",
                "anullsrc=r=44100:cl=stereo",
                "-t",
                seconds.as_str(),
                "-codec:a",
                "libmp3lame",
                "-q:a",
                "4",
                output_str.as_ref(),
            ],
            TranscodePass::Silence,
            None,
        )
        .await
    }

    /// Duration and container format of a local audio file.
    pub async fn probe(&self, path: &Path) -> Result<ProbeInfo, TranscoderError> {
        let path_str = path.to_string_lossy();
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration,format_name",
                "-of",
                "json",
                path_str.as_ref(),
            ])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TranscoderError::Spawn {
                tool: "ffprobe".to_string(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(TranscoderError::Probe {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let json: serde_json::Value =
            serde_json::from_slice(&output.stdout).map_err(|e| TranscoderError::Probe {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let format = json.get("format").ok_or_else(|| TranscoderError::Probe {
            path: path.to_path_buf(),
            message: "no format block in probe output".to_string(),
        })?;

        let duration_secs = format
            .get("duration")
            .and_then(|d| d.as_str())
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0);
        let format_name = format
            .get("format_name")
            .and_then(|f| f.as_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(ProbeInfo {
            duration_secs,
            format_name,
        })
    }

    /// Spawn ffmpeg and stream its stderr through the progress sink.
    /// ffmpeg separates progress updates with carriage returns, so the
    /// stream is split on `\r` and each chunk's lines fed to the sink.
    async fn run_ffmpeg(
        &self,
        args: &[&str],
        pass: TranscodePass,
        progress: Option<mpsc::Sender<EncodeProgress>>,
    ) -> Result<(), TranscoderError> {
        log::info!("Running ffmpeg {} pass", pass);
        log::debug!("ffmpeg args: {:?}", args);

        let mut child = Command::new(&self.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TranscoderError::Spawn {
                tool: "ffmpeg".to_string(),
                source: e,
            })?;

        let stderr = child.stderr.take().expect("stderr was piped");
        let sink = EncodeProgressSink::new(pass, progress);
        let mut reader = BufReader::new(stderr);
        let mut tail: VecDeque<String> = VecDeque::with_capacity(12);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let n = reader.read_until(b'\r', &mut buf).await?;
            if n == 0 {
                break;
            }
            let chunk = String::from_utf8_lossy(&buf);
            for line in chunk.split('\n') {
                let line = line.trim_end_matches('\r').trim();
                if line.is_empty() {
                    continue;
                }
                sink.observe(line).await;
                if tail.len() == 12 {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(TranscoderError::PassFailed {
                pass,
                status: status.to_string(),
                stderr: tail.into_iter().collect::<Vec<_>>().join(" | "),
            });
        }
        Ok(())
    }
}

/// Build an ffmpeg concat-demuxer list. Single quotes in paths are escaped
/// with the `'\''` sequence the demuxer expects.
fn concat_list(inputs: &[PathBuf]) -> String {
    let mut list = String::new();
    for input in inputs {
        let escaped = input.to_string_lossy().replace('\'', r"'\''");
        list.push_str(&format!("file '{}'\n", escaped));
    }
    list
}
