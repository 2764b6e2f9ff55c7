use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::{orchestrator, png_bytes, CannedNotifier, GatedPipeline};
use crate::enrollment::{EnrollmentTree, Upload};
use crate::face::PseudoFaceModel;
use crate::rebuild::{
    BuildContext, BuildReport, CatalogBuilder, RebuildError, RebuildPhase, RebuildPipeline,
    TriggerSource,
};
use crate::store::{self, StoreKind, StoreSpec};

const WAIT: Duration = Duration::from_secs(20);
const DIMENSIONS: usize = 16;

fn store_spec(dir: &Path) -> StoreSpec {
    StoreSpec {
        kind: StoreKind::Exact,
        path: dir.join("db").join("face_db.bin"),
        dimensions: DIMENSIONS,
    }
}

fn catalog_builder(root: &Path, spec: &StoreSpec) -> CatalogBuilder {
    CatalogBuilder::new(
        root.to_path_buf(),
        spec.clone(),
        Arc::new(PseudoFaceModel::new(DIMENSIONS)),
        0.5,
        1,
    )
}

fn upload(name: &str, color: [u8; 3]) -> Upload {
    Upload {
        filename: name.to_string(),
        data: png_bytes(color),
    }
}

#[test]
fn test_second_trigger_is_rejected_while_running() {
    let tmp = tempfile::tempdir().unwrap();
    let pipeline = Arc::new(GatedPipeline::new(None));
    let orch = orchestrator(pipeline.clone(), None, tmp.path(), WAIT);

    let first = orch.trigger(TriggerSource::Manual);
    assert!(first.accepted);
    assert!(first.status.is_rebuilding);
    assert_eq!(first.status.progress, 10);
    let job = first.status.job_id.clone();

    let second = orch.trigger(TriggerSource::Manual);
    assert!(!second.accepted);
    assert_eq!(second.message, "Rebuild already in progress");
    assert_eq!(second.status.job_id, job);

    pipeline.gate.open();
    let status = orch.wait(WAIT);
    assert_eq!(status.status, RebuildPhase::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.job_id, job);
    assert_eq!(pipeline.builds.load(Ordering::SeqCst), 1);

    let third = orch.trigger(TriggerSource::Manual);
    assert!(third.accepted);
    assert_ne!(third.status.job_id, job);
    assert!(!orch.wait(WAIT).is_rebuilding);
    assert_eq!(pipeline.builds.load(Ordering::SeqCst), 2);
}

/// Sleeps past the deadline, then writes a marker unless cancelled.
struct SlowPipeline {
    marker: std::path::PathBuf,
}

impl RebuildPipeline for SlowPipeline {
    fn build(&self, ctx: &BuildContext) -> Result<BuildReport, RebuildError> {
        std::thread::sleep(Duration::from_millis(300));
        ctx.check_cancelled()?;
        std::fs::write(&self.marker, b"saved").unwrap();
        Ok(BuildReport {
            identities: 0,
            images_used: 0,
            skipped: Vec::new(),
            store_path: self.marker.clone(),
        })
    }
}

#[test]
fn test_timeout_fails_without_saving() {
    let tmp = tempfile::tempdir().unwrap();
    let marker = tmp.path().join("saved");
    let orch = orchestrator(
        Arc::new(SlowPipeline {
            marker: marker.clone(),
        }),
        Some(Arc::new(CannedNotifier(Some(0)))),
        tmp.path(),
        Duration::from_millis(50),
    );

    assert!(orch.trigger(TriggerSource::Manual).accepted);
    let status = orch.wait(WAIT);
    assert_eq!(status.status, RebuildPhase::Failed);
    assert_eq!(status.progress, 0);
    assert!(status.message.contains("timed out"));
    assert!(status.last_error.is_some());

    std::thread::sleep(Duration::from_millis(600));
    assert!(!marker.exists());
    assert_eq!(orch.status().status, RebuildPhase::Failed);
}

#[test]
fn test_enroll_during_delete_rebuild() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("people");
    let tree = EnrollmentTree::new(&root).unwrap();
    tree.enroll("alice", "Front desk", &[upload("a.png", [200, 10, 10])])
        .unwrap();
    tree.enroll("bob", "", &[upload("b.png", [10, 200, 10])])
        .unwrap();

    let spec = store_spec(tmp.path());
    let pipeline = Arc::new(GatedPipeline::new(Some(Box::new(catalog_builder(
        &root, &spec,
    )))));
    let orch = orchestrator(
        pipeline.clone(),
        Some(Arc::new(CannedNotifier(Some(1)))),
        &tmp.path().join("logs"),
        WAIT,
    );

    tree.delete_person("bob").unwrap();
    assert!(orch.trigger(TriggerSource::Delete).accepted);

    tree.enroll("carol", "", &[upload("c.png", [10, 10, 200])])
        .unwrap();
    let enroll = orch.trigger(TriggerSource::Enroll);
    assert!(!enroll.accepted);
    assert_eq!(enroll.status.triggered_by, Some(TriggerSource::Delete));

    pipeline.gate.open();
    let status = orch.wait(WAIT);
    assert_eq!(status.status, RebuildPhase::Completed);
    assert_eq!(status.triggered_by, Some(TriggerSource::Delete));
    assert_eq!(pipeline.builds.load(Ordering::SeqCst), 1);

    let db = store::open(&spec).unwrap();
    assert!(db.get("alice").is_some());
    assert!(db.get("bob").is_none());
    assert_eq!(
        db.get("alice").unwrap().description.as_deref(),
        Some("Front desk")
    );
}

#[test]
fn test_reload_timeout_still_completes() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("people");
    let tree = EnrollmentTree::new(&root).unwrap();
    tree.enroll(
        "alice",
        "",
        &[upload("a1.png", [200, 10, 10]), upload("a2.png", [190, 20, 10])],
    )
    .unwrap();

    let spec = store_spec(tmp.path());
    std::fs::create_dir_all(spec.path.parent().unwrap()).unwrap();
    store::create(&spec).save().unwrap();

    let orch = orchestrator(
        Arc::new(catalog_builder(&root, &spec)),
        Some(Arc::new(CannedNotifier(None))),
        &tmp.path().join("logs"),
        WAIT,
    );

    assert!(orch.trigger(TriggerSource::AddImage).accepted);
    let status = orch.wait(WAIT);
    assert_eq!(status.status, RebuildPhase::Completed);
    assert_eq!(status.progress, 100);
    assert!(status.last_error.unwrap().contains("timed out"));
    assert_eq!(status.identity_count, Some(1));

    let db = store::open(&spec).unwrap();
    assert_eq!(db.len(), 1);
    assert_eq!(db.get("alice").unwrap().image_count, 2);
}

#[test]
fn test_empty_tree_saves_empty_store() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("people");
    let spec = store_spec(tmp.path());

    let orch = orchestrator(
        Arc::new(catalog_builder(&root, &spec)),
        None,
        &tmp.path().join("logs"),
        WAIT,
    );
    assert!(orch.trigger(TriggerSource::Cli).accepted);
    let status = orch.wait(WAIT);
    assert_eq!(status.status, RebuildPhase::Completed);
    assert_eq!(status.identity_count, Some(0));
    assert!(store::open(&spec).unwrap().is_empty());
}

#[test]
fn test_execution_log_is_written() {
    let tmp = tempfile::tempdir().unwrap();
    let pipeline = Arc::new(GatedPipeline::new(None));
    let orch = orchestrator(pipeline.clone(), None, tmp.path(), WAIT);
    assert!(orch.latest_log(1000).is_none());

    pipeline.gate.open();
    assert!(orch.trigger(TriggerSource::Manual).accepted);
    let status = orch.wait(WAIT);
    let job = status.job_id.unwrap();

    let (name, content) = orch.latest_log(100_000).unwrap();
    assert!(name.starts_with("rebuild_"));
    assert!(name.ends_with(&format!("_{}.log", job.short())));
    assert!(content.contains("Triggered by: manual"));
    assert!(content.contains("Pipeline: gated"));
    assert!(content.contains("waiting for gate"));
    assert!(content.contains("Outcome: completed"));

    let (_, tail) = orch.latest_log(10).unwrap();
    assert_eq!(tail.len(), 10);
}
