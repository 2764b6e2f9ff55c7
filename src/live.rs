//! Continuous verification over a stream of frames.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use image::DynamicImage;
use serde::Serialize;

use crate::enrollment::has_allowed_extension;
use crate::face::{self, FaceError};
use crate::matcher::{AccessVerifier, Outcome, Verification};

pub struct Frame {
    pub label: String,
    pub image: DynamicImage,
}

pub trait FrameSource {
    /// Next frame, `None` once the source is exhausted.
    fn next_frame(&mut self) -> Option<Result<Frame, FaceError>>;
}

/// Image files of a directory in name order, optionally repeated forever.
pub struct DirectoryFrames {
    files: Vec<PathBuf>,
    position: usize,
    looping: bool,
}

impl DirectoryFrames {
    pub fn new(dir: &Path, looping: bool) -> std::io::Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && has_allowed_extension(path))
            .collect();
        files.sort();

        log::info!("{} frames in {}", files.len(), dir.display());
        Ok(Self {
            files,
            position: 0,
            looping,
        })
    }
}

impl FrameSource for DirectoryFrames {
    fn next_frame(&mut self) -> Option<Result<Frame, FaceError>> {
        if self.position == self.files.len() {
            if !self.looping || self.files.is_empty() {
                return None;
            }
            self.position = 0;
        }

        let path = &self.files[self.position];
        self.position += 1;

        let label = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let frame = std::fs::read(path)
            .map_err(|e| FaceError::Decode(format!("{}: {e}", path.display())))
            .and_then(|bytes| face::decode_image(&bytes))
            .map(|image| Frame { label, image });
        Some(frame)
    }
}

#[derive(Serialize)]
struct RecordLine<'a> {
    frame: &'a str,
    timestamp: String,
    name: Option<&'a str>,
    score: f32,
    access_granted: bool,
    outcome: Outcome,
}

/// JSON-lines record of every verified frame.
pub struct Recorder {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl Recorder {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        log::info!("recording verifications to {}", path.display());
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn record(&mut self, frame: &str, verification: &Verification) -> anyhow::Result<()> {
        let line = RecordLine {
            frame,
            timestamp: Utc::now().to_rfc3339(),
            name: verification.name.as_deref(),
            score: verification.score,
            access_granted: verification.granted(),
            outcome: verification.outcome,
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(err) = self.writer.flush() {
            log::error!("failed to flush recording {}: {err}", self.path.display());
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct LiveSummary {
    pub frames: usize,
    pub granted: usize,
    pub denied: usize,
    pub errors: usize,
}

/// Verify frames until the source runs dry or `stop` is raised. `stop` is
/// checked once per frame.
pub fn run_live(
    verifier: &AccessVerifier,
    source: &mut dyn FrameSource,
    mut recorder: Option<&mut Recorder>,
    stop: &AtomicBool,
    interval: Duration,
) -> LiveSummary {
    let mut summary = LiveSummary::default();

    while !stop.load(Ordering::SeqCst) {
        let Some(next) = source.next_frame() else {
            break;
        };

        let frame = match next {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("skipping frame: {err}");
                summary.errors += 1;
                pause(interval);
                continue;
            }
        };

        match verifier.verify(&frame.image, None) {
            Ok(verification) => {
                summary.frames += 1;
                if verification.granted() {
                    summary.granted += 1;
                } else {
                    summary.denied += 1;
                }
                if let Some(recorder) = recorder.as_deref_mut() {
                    if let Err(err) = recorder.record(&frame.label, &verification) {
                        log::error!("failed to record frame {}: {err}", frame.label);
                    }
                }
            }
            Err(err) => {
                log::error!("verification of {} failed: {err}", frame.label);
                summary.errors += 1;
            }
        }

        pause(interval);
    }

    log::info!(
        "live verification stopped: {} frames, {} granted, {} denied, {} errors",
        summary.frames,
        summary.granted,
        summary.denied,
        summary.errors
    );
    summary
}

fn pause(interval: Duration) {
    if !interval.is_zero() {
        std::thread::sleep(interval);
    }
}
