//! Building a fresh store from the enrollment tree.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rayon::prelude::*;

use super::RebuildError;
use crate::enrollment::{image_files, read_description, EnrollmentTree};
use crate::face::{self, FaceModel};
use crate::lock::FileLock;
use crate::store::{self, StoreSpec};

/// Captured output of one build, written to the execution log.
#[derive(Clone, Default)]
pub struct ExecutionLog {
    lines: Arc<Mutex<(Vec<String>, Vec<String>)>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn out(&self, line: impl Into<String>) {
        let line = line.into();
        log::debug!("{line}");
        self.with(|(out, _)| out.push(line));
    }

    pub fn err(&self, line: impl Into<String>) {
        let line = line.into();
        log::warn!("{line}");
        self.with(|(_, err)| err.push(line));
    }

    pub fn stdout(&self) -> Vec<String> {
        self.with(|(out, _)| out.clone())
    }

    pub fn stderr(&self) -> Vec<String> {
        self.with(|(_, err)| err.clone())
    }

    fn with<T>(&self, f: impl FnOnce(&mut (Vec<String>, Vec<String>)) -> T) -> T {
        match self.lines.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

pub type ProgressFn = Arc<dyn Fn(u8, &str) + Send + Sync>;

/// Handles a pipeline uses to report back and to observe cancellation.
#[derive(Clone)]
pub struct BuildContext {
    cancel: Arc<AtomicBool>,
    progress: ProgressFn,
    log: ExecutionLog,
}

impl BuildContext {
    pub fn new(cancel: Arc<AtomicBool>, progress: ProgressFn, log: ExecutionLog) -> Self {
        Self {
            cancel,
            progress,
            log,
        }
    }

    /// Context without progress reporting or outside cancellation.
    pub fn detached() -> Self {
        let progress: ProgressFn = Arc::new(|_: u8, _: &str| {});
        Self::new(Arc::new(AtomicBool::new(false)), progress, ExecutionLog::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn check_cancelled(&self) -> Result<(), RebuildError> {
        if self.is_cancelled() {
            Err(RebuildError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn progress(&self, percent: u8, message: &str) {
        (self.progress)(percent.min(100), message);
    }

    pub fn log(&self) -> &ExecutionLog {
        &self.log
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    pub identities: usize,
    pub images_used: usize,
    /// Identities left out for having too few usable images
    pub skipped: Vec<String>,
    pub store_path: PathBuf,
}

/// One full build. Implementations must check `ctx` for cancellation between
/// units of work and right before persisting anything.
pub trait RebuildPipeline: Send + Sync {
    fn build(&self, ctx: &BuildContext) -> Result<BuildReport, RebuildError>;

    /// Inputs recorded in the execution log.
    fn describe(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Walks the enrollment tree, embeds every image and saves a brand-new store.
pub struct CatalogBuilder {
    enrollment_root: PathBuf,
    spec: StoreSpec,
    model: Arc<dyn FaceModel>,
    detection_threshold: f32,
    min_images: usize,
}

impl CatalogBuilder {
    pub fn new(
        enrollment_root: PathBuf,
        spec: StoreSpec,
        model: Arc<dyn FaceModel>,
        detection_threshold: f32,
        min_images: usize,
    ) -> Self {
        Self {
            enrollment_root,
            spec,
            model,
            detection_threshold,
            min_images: min_images.max(1),
        }
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, String> {
        let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
        let image = face::decode_image(&bytes).map_err(|e| e.to_string())?;
        face::analyze(
            self.model.as_ref(),
            &image,
            self.detection_threshold,
            self.spec.dimensions,
        )
        .map(|found| found.embedding)
        .map_err(|e| e.to_string())
    }
}

impl RebuildPipeline for CatalogBuilder {
    fn describe(&self) -> Vec<(String, String)> {
        vec![
            ("Enrollment root".to_string(), self.enrollment_root.display().to_string()),
            ("Store".to_string(), self.spec.path.display().to_string()),
            ("Store kind".to_string(), self.spec.kind.to_string()),
            ("Model".to_string(), self.model.name().to_string()),
            ("Min images".to_string(), self.min_images.to_string()),
        ]
    }

    fn build(&self, ctx: &BuildContext) -> Result<BuildReport, RebuildError> {
        let lock_dir = self
            .spec
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let _lock = FileLock::try_acquire(&lock_dir)
            .map_err(|e| RebuildError::Lock(e.to_string()))?;

        let tree = EnrollmentTree::new(&self.enrollment_root)
            .map_err(|e| RebuildError::Execution(format!("enrollment root: {e}")))?;
        let dirs = tree
            .identity_dirs()
            .map_err(|e| RebuildError::Execution(format!("enrollment root: {e}")))?;

        ctx.progress(20, "Processing face images...");
        ctx.log().out(format!("found {} identity folders", dirs.len()));

        let mut db = store::create(&self.spec);
        let mut report = BuildReport {
            identities: 0,
            images_used: 0,
            skipped: Vec::new(),
            store_path: self.spec.path.clone(),
        };

        for (idx, dir) in dirs.iter().enumerate() {
            ctx.check_cancelled()?;

            let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                ctx.log().err(format!("skipping non UTF-8 folder {}", dir.display()));
                continue;
            };

            let results: Vec<(PathBuf, Result<Vec<f32>, String>)> = image_files(dir)
                .into_par_iter()
                .map(|path| {
                    let result = self.embed_image(&path);
                    (path, result)
                })
                .collect();

            let mut embeddings = Vec::with_capacity(results.len());
            for (path, result) in results {
                match result {
                    Ok(embedding) => embeddings.push(embedding),
                    Err(reason) => ctx.log().err(format!("{}: {reason}", path.display())),
                }
            }

            if embeddings.len() < self.min_images {
                ctx.log().out(format!(
                    "skipping {name}: {} usable images, {} required",
                    embeddings.len(),
                    self.min_images
                ));
                report.skipped.push(name);
            } else if let Some(mean) = face::average_embeddings(&embeddings) {
                db.add(&name, mean, embeddings.len() as u32, read_description(dir))?;
                ctx.log().out(format!("added {name} from {} images", embeddings.len()));
                report.identities += 1;
                report.images_used += embeddings.len();
            } else {
                ctx.log().err(format!("skipping {name}: embeddings cancel out"));
                report.skipped.push(name);
            }

            let done = (idx + 1) as f32 / dirs.len() as f32;
            ctx.progress(20 + (done * 50.0) as u8, &format!("Processed {}/{} identities", idx + 1, dirs.len()));
        }

        ctx.check_cancelled()?;
        db.save()?;
        ctx.progress(70, "Database saved");
        ctx.log().out(format!(
            "saved {} identities to {}",
            report.identities,
            self.spec.path.display()
        ));

        Ok(report)
    }
}
