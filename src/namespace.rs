//! Name and path validation for everything derived from identity names.
//!
//! Every filesystem create/read/delete that touches a path built from a
//! caller-supplied name goes through [`SafeNamespace`] first.

use std::path::{Component, Path, PathBuf};

/// Errors produced when a name or path is rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty name")]
    Empty,

    #[error("invalid characters in name: {0:?}")]
    InvalidCharacters(String),

    #[error("path escapes store root: {0}")]
    OutsideRoot(String),

    #[error("cannot resolve path {path}: {reason}")]
    Unresolvable { path: String, reason: String },
}

/// Validate an identity name.
///
/// Surrounding whitespace is trimmed. Empty names, traversal segments and path
/// separators are rejected; anything else (spaces included) is accepted as-is.
pub fn validate_name(raw: &str) -> Result<String, ValidationError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }

    if name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(ValidationError::InvalidCharacters(name.to_string()));
    }

    Ok(name.to_string())
}

/// Validate a file name inside an identity folder. Same rules as names.
pub fn validate_filename(raw: &str) -> Result<String, ValidationError> {
    validate_name(raw)
}

/// A filesystem root that all identity-derived paths must resolve within.
#[derive(Debug, Clone)]
pub struct SafeNamespace {
    root: PathBuf,
}

impl SafeNamespace {
    /// Create the root if needed and remember its canonical form.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = root.as_ref().canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder for an identity. The name is validated and the result checked
    /// against the root.
    pub fn person_dir(&self, raw_name: &str) -> Result<PathBuf, ValidationError> {
        let name = validate_name(raw_name)?;
        let path = self.root.join(name);
        self.ensure_within_root(&path)?;
        Ok(path)
    }

    /// File inside an identity folder.
    pub fn person_file(&self, raw_name: &str, raw_filename: &str) -> Result<PathBuf, ValidationError> {
        let dir = self.person_dir(raw_name)?;
        let filename = validate_filename(raw_filename)?;
        let path = dir.join(filename);
        self.ensure_within_root(&path)?;
        Ok(path)
    }

    /// Require `path` to resolve to a strict descendant of the root.
    pub fn ensure_within_root(&self, path: &Path) -> Result<(), ValidationError> {
        let resolved = resolve_lenient(path)?;
        if resolved != self.root && resolved.starts_with(&self.root) {
            Ok(())
        } else {
            Err(ValidationError::OutsideRoot(path.display().to_string()))
        }
    }
}

/// Canonicalize a path that may not exist yet: the deepest existing ancestor is
/// canonicalized (resolving symlinks) and the remaining components are appended
/// after lexical normalization.
fn resolve_lenient(path: &Path) -> Result<PathBuf, ValidationError> {
    let unresolvable = |reason: String| ValidationError::Unresolvable {
        path: path.display().to_string(),
        reason,
    };

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| unresolvable(e.to_string()))?
            .join(path)
    };

    let components: Vec<Component> = absolute.components().collect();
    let mut split = components.len();
    let existing = loop {
        let prefix: PathBuf = components[..split].iter().collect();
        if split > 0 && prefix.exists() {
            break prefix;
        }
        if split == 0 {
            return Err(unresolvable("no existing ancestor".to_string()));
        }
        split -= 1;
    };

    let mut resolved = existing
        .canonicalize()
        .map_err(|e| unresolvable(e.to_string()))?;

    for component in &components[split..] {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(segment) => resolved.push(segment),
            _ => {}
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name_rejects_traversal_and_separators() {
        assert_eq!(
            validate_name("../x"),
            Err(ValidationError::InvalidCharacters("../x".to_string()))
        );
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_filename(" . ").is_err());
        assert_eq!(validate_name(""), Err(ValidationError::Empty));
        assert_eq!(validate_name("   "), Err(ValidationError::Empty));
    }

    #[test]
    fn test_validate_name_accepts_spaces() {
        assert_eq!(validate_name("Jane Doe").unwrap(), "Jane Doe");
        assert_eq!(validate_name("  Jane Doe ").unwrap(), "Jane Doe");
        assert_eq!(validate_name("José Ñúñez").unwrap(), "José Ñúñez");
    }

    #[test]
    fn test_person_dir_stays_under_root() {
        let tmp = tempfile::tempdir().unwrap();
        let ns = SafeNamespace::new(tmp.path().join("people")).unwrap();

        let dir = ns.person_dir("Jane Doe").unwrap();
        assert!(dir.starts_with(ns.root()));
        assert!(!dir.exists(), "validation must not create anything");

        assert!(ns.person_dir("../x").is_err());
        assert!(!tmp.path().join("x").exists());
    }

    #[test]
    fn test_ensure_within_root_rejects_outside_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let ns = SafeNamespace::new(tmp.path().join("people")).unwrap();

        assert!(ns.ensure_within_root(&tmp.path().join("other")).is_err());
        assert!(ns.ensure_within_root(ns.root()).is_err());
        assert!(ns
            .ensure_within_root(&ns.root().join("a").join("..").join("..").join("b"))
            .is_err());
        assert!(ns.ensure_within_root(&ns.root().join("a").join("b.jpg")).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let ns = SafeNamespace::new(tmp.path().join("people")).unwrap();
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, ns.root().join("link")).unwrap();

        assert!(ns.ensure_within_root(&ns.root().join("link").join("f.jpg")).is_err());
    }
}
