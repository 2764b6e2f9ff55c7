mod rebuild;

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::rebuild::{
    BuildContext, BuildReport, RebuildError, RebuildOrchestrator, RebuildPipeline, ReloadError,
    ReloadNotifier,
};
use crate::storage::BackendLocal;

/// Solid-color PNG.
pub fn png_bytes(color: [u8; 3]) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(8, 8, image::Rgb(color));
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .unwrap();
    bytes.into_inner()
}

/// One-shot latch a pipeline blocks on until the test opens it.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }

    fn wait(&self) {
        let open = self.open.lock().unwrap();
        let _open = self.opened.wait_while(open, |open| !*open).unwrap();
    }
}

/// Waits on a gate, then delegates to `inner` (or reports an empty build).
pub struct GatedPipeline {
    pub gate: Arc<Gate>,
    pub inner: Option<Box<dyn RebuildPipeline>>,
    pub builds: AtomicUsize,
}

impl GatedPipeline {
    pub fn new(inner: Option<Box<dyn RebuildPipeline>>) -> Self {
        Self {
            gate: Arc::new(Gate::default()),
            inner,
            builds: AtomicUsize::new(0),
        }
    }
}

impl RebuildPipeline for GatedPipeline {
    fn build(&self, ctx: &BuildContext) -> Result<BuildReport, RebuildError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        ctx.log().out("waiting for gate");
        self.gate.wait();
        ctx.check_cancelled()?;

        match &self.inner {
            Some(inner) => inner.build(ctx),
            None => Ok(BuildReport {
                identities: 0,
                images_used: 0,
                skipped: Vec::new(),
                store_path: PathBuf::new(),
            }),
        }
    }

    fn describe(&self) -> Vec<(String, String)> {
        vec![("Pipeline".to_string(), "gated".to_string())]
    }
}

/// Notifier with a canned answer: `Some(count)` succeeds, `None` times out.
pub struct CannedNotifier(pub Option<usize>);

impl ReloadNotifier for CannedNotifier {
    fn notify(&self) -> Result<usize, ReloadError> {
        match self.0 {
            Some(count) => Ok(count),
            None => Err(ReloadError::Timeout(30)),
        }
    }
}

pub fn orchestrator(
    pipeline: Arc<dyn RebuildPipeline>,
    notifier: Option<Arc<dyn ReloadNotifier>>,
    logs_dir: &Path,
    timeout: Duration,
) -> RebuildOrchestrator {
    RebuildOrchestrator::new(
        pipeline,
        notifier,
        Arc::new(BackendLocal::new(logs_dir).unwrap()),
        timeout,
    )
}
