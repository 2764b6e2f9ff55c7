//! Background rebuild of the persisted store and reload of the serving
//! process.
//!
//! A trigger that finds no rebuild running flips the status to `rebuilding`
//! and returns immediately; a supervisor thread then drives the job:
//!
//! ```text
//! trigger -> supervisor --spawn--> worker (pipeline.build)
//!                |  <---- result channel (bounded by timeout)
//!                v
//!            reloading -> notifier.notify() -> completed
//!                                   (any build error, timeout) -> failed
//! ```
//!
//! On timeout the supervisor raises the cancel flag and finalizes the job as
//! failed; the worker stops at its next cancellation check and never saves.

mod builder;
mod notify;
mod status;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;

pub use builder::{BuildContext, BuildReport, CatalogBuilder, ExecutionLog, ProgressFn, RebuildPipeline};
pub use notify::{HttpReloadNotifier, ReloadError, ReloadNotifier};
pub use status::{RebuildPhase, RebuildStatus, TriggerOutcome, TriggerSource};

use crate::eid::Eid;
use crate::storage::StorageManager;
use crate::store::StoreError;

const LOG_PREFIX: &str = "rebuild_";
const LOG_SUFFIX: &str = ".log";

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("Rebuild already in progress")]
    InProgress,

    #[error("{0}")]
    Execution(String),

    #[error("rebuild timed out after {0} seconds")]
    TimedOut(u64),

    #[error("rebuild cancelled")]
    Cancelled,

    #[error("store lock unavailable: {0}")]
    Lock(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Shared {
    status: Mutex<RebuildStatus>,
    finished: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RebuildStatus> {
        match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply `f` only while `job` is still the current job.
    fn update(&self, job: &Eid, f: impl FnOnce(&mut RebuildStatus)) {
        let mut status = self.lock();
        if status.is_job(job) {
            f(&mut status);
        }
        if !status.is_rebuilding {
            self.finished.notify_all();
        }
    }
}

#[derive(Clone)]
pub struct RebuildOrchestrator {
    shared: Arc<Shared>,
    pipeline: Arc<dyn RebuildPipeline>,
    /// `None` skips the reload phase
    notifier: Option<Arc<dyn ReloadNotifier>>,
    logs: Arc<dyn StorageManager>,
    timeout: Duration,
}

impl RebuildOrchestrator {
    pub fn new(
        pipeline: Arc<dyn RebuildPipeline>,
        notifier: Option<Arc<dyn ReloadNotifier>>,
        logs: Arc<dyn StorageManager>,
        timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                status: Mutex::new(RebuildStatus::default()),
                finished: Condvar::new(),
            }),
            pipeline,
            notifier,
            logs,
            timeout,
        }
    }

    pub fn status(&self) -> RebuildStatus {
        self.shared.lock().clone()
    }

    /// Start a rebuild unless one is running. Never blocks on the rebuild.
    pub fn trigger(&self, source: TriggerSource) -> TriggerOutcome {
        let job = Eid::new();
        let snapshot = {
            let mut status = self.shared.lock();
            if status.is_rebuilding {
                log::info!("rebuild requested by {source} while job is running, ignoring");
                return TriggerOutcome {
                    accepted: false,
                    message: RebuildError::InProgress.to_string(),
                    status: status.clone(),
                };
            }
            *status = RebuildStatus::started(job.clone(), source, &status);
            status.clone()
        };

        log::info!("rebuild {job} started (triggered by {source})");

        let this = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("rebuild-{}", job.short()))
            .spawn({
                let job = job.clone();
                move || this.supervise(job, source)
            });

        if let Err(err) = spawned {
            log::error!("failed to spawn rebuild supervisor: {err}");
            self.shared.update(&job, |status| {
                status.fail(format!("Database rebuild failed: {err}"), err.to_string())
            });
            return TriggerOutcome {
                accepted: false,
                message: format!("failed to start rebuild: {err}"),
                status: self.status(),
            };
        }

        TriggerOutcome {
            accepted: true,
            message: "Rebuild started".to_string(),
            status: snapshot,
        }
    }

    /// Block until no rebuild is running or `timeout` elapses. Returns the
    /// status at that point.
    pub fn wait(&self, timeout: Duration) -> RebuildStatus {
        let status = self.shared.lock();
        let result = self
            .shared
            .finished
            .wait_timeout_while(status, timeout, |status| status.is_rebuilding);
        match result {
            Ok((status, _)) => status.clone(),
            Err(poisoned) => poisoned.into_inner().0.clone(),
        }
    }

    /// Name and tail (at most `max_bytes`) of the most recent execution log.
    pub fn latest_log(&self, max_bytes: usize) -> Option<(String, String)> {
        let name = self
            .logs
            .list()
            .into_iter()
            .filter(|name| name.starts_with(LOG_PREFIX) && name.ends_with(LOG_SUFFIX))
            .max()?;

        let content = match self.logs.read(&name) {
            Ok(bytes) => {
                let start = bytes.len().saturating_sub(max_bytes);
                String::from_utf8_lossy(&bytes[start..]).into_owned()
            }
            Err(err) => format!("Failed to read log: {err}"),
        };
        Some((name, content))
    }

    fn supervise(self, job: Eid, source: TriggerSource) {
        let mut guard = FinalizeGuard {
            shared: self.shared.clone(),
            job: job.clone(),
            armed: true,
        };

        let started = Instant::now();
        let exec_log = ExecutionLog::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let progress: ProgressFn = {
            let shared = self.shared.clone();
            let job = job.clone();
            Arc::new(move |percent: u8, message: &str| {
                shared.update(&job, |status| {
                    if status.status == RebuildPhase::Rebuilding {
                        status.progress = percent;
                        status.message = message.to_string();
                    }
                })
            })
        };
        let ctx = BuildContext::new(cancel.clone(), progress, exec_log.clone());

        let (tx, rx) = mpsc::channel();
        let pipeline = self.pipeline.clone();
        let worker = std::thread::Builder::new()
            .name(format!("rebuild-worker-{}", job.short()))
            .spawn(move || {
                let result = pipeline.build(&ctx);
                if let Err(RebuildError::Cancelled) = &result {
                    ctx.log().err("build cancelled before saving");
                }
                let _ = tx.send(result);
            });

        let result = match worker {
            Err(err) => Err(RebuildError::Execution(format!("failed to spawn worker: {err}"))),
            Ok(_) => match rx.recv_timeout(self.timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => {
                    cancel.store(true, Ordering::SeqCst);
                    Err(RebuildError::TimedOut(self.timeout.as_secs()))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    Err(RebuildError::Execution("build worker panicked".to_string()))
                }
            },
        };

        let outcome = match result {
            Ok(report) => match &self.notifier {
                None => {
                    let message = format!(
                        "Database rebuilt successfully with {} identities",
                        report.identities
                    );
                    log::info!("rebuild {job}: {message}");
                    self.shared.update(&job, |status| {
                        status.complete(message.clone(), report.identities, None)
                    });
                    format!("completed: {message}")
                }
                Some(notifier) => {
                    self.shared.update(&job, |status| {
                        status.status = RebuildPhase::Reloading;
                        status.progress = 80;
                        status.message =
                            "Notifying serving process to reload database...".to_string();
                    });

                    match notifier.notify() {
                        Ok(count) => {
                            let message =
                                format!("Database rebuilt successfully with {count} identities");
                            log::info!("rebuild {job}: {message}");
                            self.shared.update(&job, |status| {
                                status.complete(message.clone(), report.identities, None)
                            });
                            format!("completed: {message}")
                        }
                        Err(err) => {
                            let message = format!(
                                "Database rebuilt but reload failed: {err}. Restart the serving process manually."
                            );
                            log::warn!("rebuild {job}: {message}");
                            exec_log.err(format!("reload failed: {err}"));
                            self.shared.update(&job, |status| {
                                status.complete(
                                    message.clone(),
                                    report.identities,
                                    Some(err.to_string()),
                                )
                            });
                            format!("completed with reload error: {err}")
                        }
                    }
                }
            },
            Err(err) => {
                let message = match &err {
                    RebuildError::TimedOut(secs) => {
                        format!("Database rebuild timed out after {secs} seconds")
                    }
                    other => format!("Database rebuild failed: {other}"),
                };
                log::error!("rebuild {job}: {message}");
                exec_log.err(err.to_string());
                self.shared
                    .update(&job, |status| status.fail(message.clone(), err.to_string()));
                format!("failed: {err}")
            }
        };

        self.write_log(&job, source, &exec_log, &outcome, started.elapsed());
        guard.armed = false;
    }

    fn write_log(
        &self,
        job: &Eid,
        source: TriggerSource,
        exec_log: &ExecutionLog,
        outcome: &str,
        elapsed: Duration,
    ) {
        let now = Utc::now();
        let mut text = format!(
            "Triggered by: {source}\nJob: {job}\nTime: {}\n",
            now.to_rfc3339()
        );
        for (key, value) in self.pipeline.describe() {
            text.push_str(&format!("{key}: {value}\n"));
        }
        text.push_str("\nSTDOUT:\n");
        for line in exec_log.stdout() {
            text.push_str(&line);
            text.push('\n');
        }
        text.push_str("\nSTDERR:\n");
        for line in exec_log.stderr() {
            text.push_str(&line);
            text.push('\n');
        }
        text.push_str(&format!(
            "\nOutcome: {outcome}\nDuration: {:.2}s\n",
            elapsed.as_secs_f64()
        ));

        let name = format!(
            "{LOG_PREFIX}{}_{}{LOG_SUFFIX}",
            now.format("%Y%m%d_%H%M%S%3f"),
            job.short()
        );
        if let Err(err) = self.logs.write(&name, text.as_bytes()) {
            log::error!("failed to write rebuild log {name}: {err}");
        }
    }
}

/// Finalizes the job as failed if the supervisor unwinds before finishing.
struct FinalizeGuard {
    shared: Arc<Shared>,
    job: Eid,
    armed: bool,
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if self.armed {
            log::error!("rebuild {} supervisor exited unexpectedly", self.job);
            self.shared.update(&self.job, |status| {
                if status.is_rebuilding {
                    status.fail(
                        "Database rebuild failed: supervisor exited unexpectedly".to_string(),
                        "supervisor exited unexpectedly".to_string(),
                    );
                }
            });
        }
    }
}
