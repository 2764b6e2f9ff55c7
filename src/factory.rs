use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::{
    config::{Config, ModelBackend},
    enrollment::EnrollmentTree,
    face::{self, FaceModel},
    matcher::AccessVerifier,
    rebuild::{CatalogBuilder, HttpReloadNotifier, RebuildOrchestrator, ReloadNotifier},
    storage,
    store::{self, StoreHandle, StoreKind},
    web::{admin::AdminState, serve::ServeState},
};

/// Overrides for a rebuild started from the command line.
#[derive(Debug, Default, Clone)]
pub struct RebuildOverrides {
    pub enrollment_root: Option<PathBuf>,
    pub kind: Option<StoreKind>,
    pub min_images: Option<usize>,
    pub notify: bool,
}

/// Wires application components from a loaded [`Config`].
pub struct AppFactory;

impl AppFactory {
    pub fn face_model(config: &Config) -> Result<Arc<dyn FaceModel>> {
        face::from_config(config)
    }

    /// Store loaded from disk. In production an unloadable or empty store is
    /// fatal; otherwise the service starts with an empty store.
    pub fn serving_store(config: &Config) -> Result<StoreHandle> {
        let spec = config.store_spec();
        match store::open(&spec) {
            Ok(db) if db.is_empty() && config.serve.production => {
                bail!("store {} is empty", spec.path.display())
            }
            Ok(db) => {
                log::info!("loaded {} identities from {}", db.len(), spec.path.display());
                Ok(StoreHandle::new(db))
            }
            Err(err) if config.serve.production => Err(err)
                .with_context(|| format!("failed to load store {}", spec.path.display())),
            Err(err) => {
                log::warn!(
                    "failed to load store {}: {err}; starting with an empty store",
                    spec.path.display()
                );
                Ok(StoreHandle::new(store::create(&spec)))
            }
        }
    }

    pub fn verifier(config: &Config, store: StoreHandle, model: Arc<dyn FaceModel>) -> AccessVerifier {
        let rec = &config.recognition;
        AccessVerifier::new(
            store,
            model,
            rec.detection_threshold,
            rec.recognition_threshold,
            rec.top_k,
            rec.access_log_capacity,
        )
    }

    pub fn serve_state(config: &Config) -> Result<ServeState> {
        if config.serve.production && config.model.backend == ModelBackend::Pseudo {
            bail!("the pseudo face model cannot be used with serve.production enabled");
        }

        let model = Self::face_model(config)?;
        let store = Self::serving_store(config)?;
        Ok(ServeState {
            model_name: model.name().to_string(),
            verifier: Arc::new(Self::verifier(config, store, model)),
            spec: config.store_spec(),
        })
    }

    pub fn orchestrator(
        config: &Config,
        model: Arc<dyn FaceModel>,
        overrides: &RebuildOverrides,
    ) -> Result<RebuildOrchestrator> {
        let mut spec = config.store_spec();
        if let Some(kind) = overrides.kind {
            spec.kind = kind;
        }

        let builder = CatalogBuilder::new(
            overrides
                .enrollment_root
                .clone()
                .unwrap_or_else(|| config.enrollment_root()),
            spec,
            model,
            config.recognition.detection_threshold,
            overrides
                .min_images
                .unwrap_or(config.rebuild.min_images_per_identity),
        );

        let notifier: Option<Arc<dyn ReloadNotifier>> = if overrides.notify {
            Some(Arc::new(HttpReloadNotifier::new(
                &config.rebuild.reload_url,
                Duration::from_secs(config.rebuild.reload_timeout_secs),
            )?))
        } else {
            None
        };

        let logs_dir = config.logs_dir();
        let logs = storage::BackendLocal::new(&logs_dir)
            .with_context(|| format!("failed to create {}", logs_dir.display()))?;

        Ok(RebuildOrchestrator::new(
            Arc::new(builder),
            notifier,
            Arc::new(logs),
            Duration::from_secs(config.rebuild.timeout_secs),
        ))
    }

    pub fn admin_state(config: &Config) -> Result<AdminState> {
        let root = config.enrollment_root();
        let tree = EnrollmentTree::new(&root)
            .with_context(|| format!("failed to open enrollment root {}", root.display()))?;

        let model = Self::face_model(config)?;
        let overrides = RebuildOverrides {
            notify: true,
            ..Default::default()
        };

        Ok(AdminState {
            tree,
            orchestrator: Self::orchestrator(config, model, &overrides)?,
            store_path: config.store_path(),
            log_tail_bytes: config.rebuild.log_tail_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tmp: &std::path::Path) -> Config {
        let mut config = Config::default().with_base_path(tmp);
        config.model.backend = ModelBackend::Pseudo;
        config.store.dimensions = 8;
        config
    }

    #[test]
    fn test_serving_store_falls_back_to_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());

        let handle = AppFactory::serving_store(&config).unwrap();
        assert!(handle.current().is_empty());
    }

    #[test]
    fn test_production_refuses_missing_or_empty_store() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path());
        config.serve.production = true;

        assert!(AppFactory::serving_store(&config).is_err());

        store::create(&config.store_spec()).save().unwrap();
        assert!(AppFactory::serving_store(&config).is_err());
    }

    #[test]
    fn test_production_refuses_pseudo_model() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path());
        config.serve.production = true;

        let err = AppFactory::serve_state(&config).err().unwrap();
        assert!(err.to_string().contains("pseudo"));
    }
}
