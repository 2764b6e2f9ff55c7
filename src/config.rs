use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::{
    storage::{self, StorageManager},
    store::{StoreKind, StoreSpec},
};

const CONFIG_FILE: &str = "config.yaml";

/// Detector confidence required to accept a face
const DEFAULT_DETECTION_THRESHOLD: f32 = 0.6;
/// Similarity required to accept a match
const DEFAULT_RECOGNITION_THRESHOLD: f32 = 0.5;
const DEFAULT_TOP_K: usize = 5;
const DEFAULT_ACCESS_LOG_CAPACITY: usize = 1000;
const DEFAULT_DIMENSIONS: usize = 512;
const DEFAULT_REBUILD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_RELOAD_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOG_TAIL_BYTES: usize = 20_000;
const DEFAULT_MODEL_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Store file, relative to the base path unless absolute
    #[serde(default = "default_store_path")]
    pub path: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            path: default_store_path(),
            dimensions: DEFAULT_DIMENSIONS,
        }
    }
}

fn default_store_path() -> String {
    "face_db.bin".to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f32,

    #[serde(default = "default_recognition_threshold")]
    pub recognition_threshold: f32,

    /// How many ranked candidates a recognition reply carries
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_access_log_capacity")]
    pub access_log_capacity: usize,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            detection_threshold: DEFAULT_DETECTION_THRESHOLD,
            recognition_threshold: DEFAULT_RECOGNITION_THRESHOLD,
            top_k: DEFAULT_TOP_K,
            access_log_capacity: DEFAULT_ACCESS_LOG_CAPACITY,
        }
    }
}

fn default_detection_threshold() -> f32 {
    DEFAULT_DETECTION_THRESHOLD
}

fn default_recognition_threshold() -> f32 {
    DEFAULT_RECOGNITION_THRESHOLD
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_access_log_capacity() -> usize {
    DEFAULT_ACCESS_LOG_CAPACITY
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelBackend {
    /// Detector and embedder behind an HTTP endpoint
    #[default]
    Http,
    /// Deterministic stand-in for demos and tests
    Pseudo,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub backend: ModelBackend,

    #[serde(default = "default_model_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: ModelBackend::default(),
            endpoint: default_model_endpoint(),
            timeout_secs: DEFAULT_MODEL_TIMEOUT_SECS,
        }
    }
}

fn default_model_endpoint() -> String {
    "http://127.0.0.1:8500/api/faces".to_string()
}

fn default_model_timeout_secs() -> u64 {
    DEFAULT_MODEL_TIMEOUT_SECS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RebuildConfig {
    /// Identities with fewer usable images are left out of the store
    #[serde(default = "default_min_images")]
    pub min_images_per_identity: usize,

    #[serde(default = "default_rebuild_timeout_secs")]
    pub timeout_secs: u64,

    /// Reload endpoint of the serving process
    #[serde(default = "default_reload_url")]
    pub reload_url: String,

    #[serde(default = "default_reload_timeout_secs")]
    pub reload_timeout_secs: u64,

    #[serde(default = "default_log_tail_bytes")]
    pub log_tail_bytes: usize,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            min_images_per_identity: default_min_images(),
            timeout_secs: DEFAULT_REBUILD_TIMEOUT_SECS,
            reload_url: default_reload_url(),
            reload_timeout_secs: DEFAULT_RELOAD_TIMEOUT_SECS,
            log_tail_bytes: DEFAULT_LOG_TAIL_BYTES,
        }
    }
}

fn default_min_images() -> usize {
    1
}

fn default_rebuild_timeout_secs() -> u64 {
    DEFAULT_REBUILD_TIMEOUT_SECS
}

fn default_reload_url() -> String {
    "http://127.0.0.1:8000/api/database/reload".to_string()
}

fn default_reload_timeout_secs() -> u64 {
    DEFAULT_RELOAD_TIMEOUT_SECS
}

fn default_log_tail_bytes() -> usize {
    DEFAULT_LOG_TAIL_BYTES
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServeConfig {
    #[serde(default = "default_serve_listen")]
    pub listen: String,

    /// Refuse to start without a usable store or with the pseudo backend
    #[serde(default)]
    pub production: bool,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            listen: default_serve_listen(),
            production: false,
        }
    }
}

fn default_serve_listen() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
        }
    }
}

fn default_admin_listen() -> String {
    "127.0.0.1:8001".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// One folder per identity, relative to the base path unless absolute
    #[serde(default = "default_enrollment_root")]
    pub enrollment_root: String,

    /// Rebuild execution logs
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub recognition: RecognitionConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub rebuild: RebuildConfig,

    #[serde(default)]
    pub serve: ServeConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enrollment_root: default_enrollment_root(),
            logs_dir: default_logs_dir(),
            store: StoreConfig::default(),
            recognition: RecognitionConfig::default(),
            model: ModelConfig::default(),
            rebuild: RebuildConfig::default(),
            serve: ServeConfig::default(),
            admin: AdminConfig::default(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_enrollment_root() -> String {
    "people".to_string()
}

fn default_logs_dir() -> String {
    "logs".to_string()
}

/// Base directory from `FACEGATE_BASE_PATH`, falling back to
/// `~/.local/share/facegate`.
pub fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("FACEGATE_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/facegate"))
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let rec = &self.recognition;
        for (key, value) in [
            ("recognition.detection_threshold", rec.detection_threshold),
            ("recognition.recognition_threshold", rec.recognition_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{key} must be between 0.0 and 1.0, got {value}");
            }
        }

        if rec.top_k == 0 {
            bail!("recognition.top_k must be greater than 0");
        }

        if rec.access_log_capacity == 0 {
            bail!("recognition.access_log_capacity must be greater than 0");
        }

        if !(1..=u16::MAX as usize).contains(&self.store.dimensions) {
            bail!(
                "store.dimensions must be between 1 and {}, got {}",
                u16::MAX,
                self.store.dimensions
            );
        }

        if self.store.path.trim().is_empty() {
            bail!("store.path must not be empty");
        }

        if self.enrollment_root.trim().is_empty() {
            bail!("enrollment_root must not be empty");
        }

        for (key, value) in [
            ("model.timeout_secs", self.model.timeout_secs),
            ("rebuild.timeout_secs", self.rebuild.timeout_secs),
            ("rebuild.reload_timeout_secs", self.rebuild.reload_timeout_secs),
        ] {
            if value == 0 {
                bail!("{key} must be greater than 0");
            }
        }

        if self.rebuild.log_tail_bytes == 0 {
            bail!("rebuild.log_tail_bytes must be greater than 0");
        }

        url::Url::parse(&self.rebuild.reload_url)
            .with_context(|| format!("rebuild.reload_url is not a valid url: {}", self.rebuild.reload_url))?;

        if self.model.backend == ModelBackend::Http {
            url::Url::parse(&self.model.endpoint)
                .with_context(|| format!("model.endpoint is not a valid url: {}", self.model.endpoint))?;
        }

        Ok(())
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(&base_path()?)
    }

    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let store = storage::BackendLocal::new(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    /// Config rooted at `base_path` without touching the filesystem.
    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    pub fn enrollment_root(&self) -> PathBuf {
        self.resolve(&self.enrollment_root)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.resolve(&self.logs_dir)
    }

    pub fn store_path(&self) -> PathBuf {
        self.resolve(&self.store.path)
    }

    pub fn store_spec(&self) -> StoreSpec {
        StoreSpec {
            kind: self.store.kind,
            path: self.store_path(),
            dimensions: self.store.dimensions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_with(tmp.path()).unwrap();

        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert_eq!(config.recognition.recognition_threshold, 0.5);
        assert_eq!(config.recognition.detection_threshold, 0.6);
        assert_eq!(config.store.dimensions, 512);
        assert_eq!(config.rebuild.timeout_secs, 300);
        assert_eq!(config.store_path(), tmp.path().join("face_db.bin"));
    }

    #[test]
    fn test_load_fills_missing_fields_and_resaves() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "store:\n  kind: indexed\n  dimensions: 128\n",
        )
        .unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.store.kind, StoreKind::Indexed);
        assert_eq!(config.store.dimensions, 128);
        assert_eq!(config.recognition.top_k, 5);

        let saved = std::fs::read_to_string(tmp.path().join(CONFIG_FILE)).unwrap();
        assert!(saved.contains("recognition_threshold"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.recognition.recognition_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.store.dimensions = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rebuild.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rebuild.reload_url = "not a url".to_string();
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_absolute_paths_are_kept() {
        let mut config = Config::default().with_base_path("/srv/facegate");
        config.enrollment_root = "/data/people".to_string();
        assert_eq!(config.enrollment_root(), PathBuf::from("/data/people"));
        assert_eq!(config.logs_dir(), PathBuf::from("/srv/facegate/logs"));
    }
}
