//! Enrollment tree: one folder per identity holding its images and an optional
//! description file (`info.txt`, or `info.json`).

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::eid::Eid;
use crate::namespace::{validate_filename, SafeNamespace, ValidationError};

/// Image extensions accepted for upload and picked up during a rebuild.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "bmp", "webp", "gif", "tiff", "tif", "heic", "heif", "avif",
];

const INFO_TXT: &str = "info.txt";
const INFO_JSON: &str = "info.json";

#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid image {0}: {1}")]
    InvalidImage(String, String),

    #[error("at least one image is required")]
    MissingImages,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub name: String,
    pub image_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonInfo {
    pub name: String,
    pub images: Vec<String>,
    pub info: String,
}

/// An uploaded image before it is written.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrollOutcome {
    pub saved: Vec<String>,
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EnrollmentTree {
    namespace: SafeNamespace,
}

impl EnrollmentTree {
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            namespace: SafeNamespace::new(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        self.namespace.root()
    }

    /// Identity folders sorted by name.
    pub fn identity_dirs(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(self.namespace.root())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    pub fn list_identities(&self) -> std::io::Result<Vec<IdentitySummary>> {
        Ok(self
            .identity_dirs()?
            .iter()
            .filter_map(|dir| {
                let name = dir.file_name()?.to_str()?.to_string();
                Some(IdentitySummary {
                    name,
                    image_count: image_files(dir).len(),
                })
            })
            .collect())
    }

    pub fn person(&self, name: &str) -> Result<PersonInfo, EnrollmentError> {
        let dir = self.existing_person_dir(name)?;
        let images = image_files(&dir)
            .iter()
            .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
            .collect();

        Ok(PersonInfo {
            name: name.trim().to_string(),
            images,
            info: read_description(&dir).unwrap_or_default(),
        })
    }

    /// Create (or extend) an identity folder, write its description and save
    /// the valid uploads. Invalid uploads are reported in `rejected`.
    pub fn enroll(
        &self,
        name: &str,
        description: &str,
        uploads: &[Upload],
    ) -> Result<EnrollOutcome, EnrollmentError> {
        if uploads.is_empty() {
            return Err(EnrollmentError::MissingImages);
        }
        let dir = self.namespace.person_dir(name)?;
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(INFO_TXT), description)?;

        let mut outcome = EnrollOutcome::default();
        for upload in uploads {
            match self.save_upload(&dir, upload) {
                Ok(stored) => outcome.saved.push(stored),
                Err(EnrollmentError::InvalidImage(filename, reason)) => {
                    log::warn!("skipping upload {filename}: {reason}");
                    outcome.rejected.push(filename);
                }
                Err(err) => return Err(err),
            }
        }

        log::info!(
            "enrolled {} ({} saved, {} rejected)",
            dir.display(),
            outcome.saved.len(),
            outcome.rejected.len()
        );
        Ok(outcome)
    }

    /// Add one image to an existing identity. Returns the stored file name.
    pub fn add_image(&self, name: &str, upload: &Upload) -> Result<String, EnrollmentError> {
        let dir = self.existing_person_dir(name)?;
        self.save_upload(&dir, upload)
    }

    pub fn delete_image(&self, name: &str, filename: &str) -> Result<(), EnrollmentError> {
        let path = self.namespace.person_file(name, filename)?;
        if !path.is_file() {
            return Err(EnrollmentError::NotFound(format!("image {}", filename.trim())));
        }
        std::fs::remove_file(&path)?;
        log::info!("deleted image {}", path.display());
        Ok(())
    }

    pub fn delete_person(&self, name: &str) -> Result<(), EnrollmentError> {
        let dir = self.existing_person_dir(name)?;
        std::fs::remove_dir_all(&dir)?;
        log::info!("deleted identity folder {}", dir.display());
        Ok(())
    }

    /// Bytes and mime type of a stored image.
    pub fn read_image(
        &self,
        name: &str,
        filename: &str,
    ) -> Result<(Vec<u8>, String), EnrollmentError> {
        let path = self.namespace.person_file(name, filename)?;
        if !path.is_file() {
            return Err(EnrollmentError::NotFound(format!("image {}", filename.trim())));
        }
        let data = std::fs::read(&path)?;
        let mime = infer::get(&data)
            .map(|kind| kind.mime_type())
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok((data, mime))
    }

    fn existing_person_dir(&self, name: &str) -> Result<PathBuf, EnrollmentError> {
        let dir = self.namespace.person_dir(name)?;
        if !dir.is_dir() {
            return Err(EnrollmentError::NotFound(format!("person {}", name.trim())));
        }
        Ok(dir)
    }

    fn save_upload(&self, dir: &Path, upload: &Upload) -> Result<String, EnrollmentError> {
        let invalid = |reason: &str| {
            EnrollmentError::InvalidImage(upload.filename.clone(), reason.to_string())
        };

        validate_filename(&upload.filename)?;
        if !has_allowed_extension(Path::new(&upload.filename)) {
            return Err(invalid("extension not allowed"));
        }
        match infer::get(&upload.data) {
            Some(kind) if kind.matcher_type() == infer::MatcherType::Image => {}
            _ => return Err(invalid("content is not an image")),
        }

        let sanitized = sanitize_filename(&upload.filename);
        let millis = Utc::now().timestamp_millis();
        let mut stored = format!("{millis}_{sanitized}");
        if dir.join(&stored).exists() {
            stored = format!("{millis}_{}_{sanitized}", Eid::new().short());
        }
        let path = dir.join(&stored);
        self.namespace.ensure_within_root(&path)?;
        std::fs::write(&path, &upload.data)?;
        Ok(stored)
    }
}

pub fn has_allowed_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Image files of an identity folder, sorted.
pub fn image_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && has_allowed_extension(path))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

/// Description of an identity: `info.txt` verbatim, else `info.json` rendered
/// as `Key: value` lines (the `name` key is skipped). `None` when neither
/// exists or the result is blank.
pub fn read_description(dir: &Path) -> Option<String> {
    let text = match std::fs::read_to_string(dir.join(INFO_TXT)) {
        Ok(text) => text,
        Err(_) => {
            let raw = std::fs::read_to_string(dir.join(INFO_JSON)).ok()?;
            match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&raw) {
                Ok(fields) => render_fields(&fields),
                Err(err) => {
                    log::warn!("ignoring malformed {}: {err}", dir.join(INFO_JSON).display());
                    return None;
                }
            }
        }
    };

    let text = text.trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn render_fields(fields: &serde_json::Map<String, serde_json::Value>) -> String {
    fields
        .iter()
        .filter(|(key, _)| key.as_str() != "name")
        .map(|(key, value)| {
            let mut label = key.replace('_', " ");
            if let Some(first) = label.get(..1) {
                label = first.to_uppercase() + &label[1..];
            }
            match value {
                serde_json::Value::String(s) => format!("{label}: {s}"),
                other => format!("{label}: {other}"),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Keep ASCII alphanumerics, `.`, `-` and `_`; spaces become underscores;
/// leading dots are dropped.
pub fn sanitize_filename(raw: &str) -> String {
    let raw = raw.trim();
    let (stem, extension) = match raw.rsplit_once('.') {
        Some((stem, extension)) => (stem, extension),
        None => (raw, ""),
    };

    let stem: String = stem
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    let stem = match stem.trim_start_matches('.') {
        "" => "image",
        stem => stem,
    };

    let extension: String = extension
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();

    if extension.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{extension}")
    }
}
