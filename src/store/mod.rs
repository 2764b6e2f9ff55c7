//! Identity embedding store.
//!
//! Maps identity names to one L2-normalized embedding each and answers
//! similarity queries against them.
//!
//! # Architecture
//!
//! - `exact`: linear-scan store with true delete/update
//! - `indexed`: append-only slot index; updates and removals mark slots stale
//! - `format`: versioned binary container shared by both variants
//!
//! The variant is picked once, at construction, from a [`StoreSpec`].

mod exact;
pub mod format;
mod indexed;

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use exact::ExactStore;
pub use indexed::IndexedStore;

/// Tolerance used when checking the unit-norm invariant.
pub const NORM_TOLERANCE: f32 = 1e-5;

/// A named entity with one representative embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub embedding: Vec<f32>,
    pub image_count: u32,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a best-match query.
///
/// `name` is `None` when the best score is below the threshold or the store is
/// empty; `score` always carries the best observed score (0.0 when empty).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub name: Option<String>,
    pub score: f32,
}

impl Match {
    pub fn none() -> Self {
        Self {
            name: None,
            score: 0.0,
        }
    }
}

/// One (name, score) pair from a ranked query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredName {
    pub name: String,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Exact,
    Indexed,
}

impl StoreKind {
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            StoreKind::Exact => 0,
            StoreKind::Indexed => 1,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(StoreKind::Exact),
            1 => Some(StoreKind::Indexed),
            _ => None,
        }
    }
}

impl Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Exact => write!(f, "exact"),
            StoreKind::Indexed => write!(f, "indexed"),
        }
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exact" => Ok(StoreKind::Exact),
            "indexed" => Ok(StoreKind::Indexed),
            other => Err(format!("unknown store kind '{other}' (expected exact or indexed)")),
        }
    }
}

/// Everything needed to construct a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSpec {
    pub kind: StoreKind,
    pub path: PathBuf,
    pub dimensions: usize,
}

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Store kind mismatch: expected {expected}, file holds {got}")]
    KindMismatch { expected: StoreKind, got: StoreKind },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("Identity name cannot be empty")]
    EmptyName,
}

/// Contract shared by both store variants.
pub trait EmbeddingStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    fn dimensions(&self) -> usize;

    /// File the store saves to and loads from.
    fn path(&self) -> &Path;

    /// Number of live identities.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert an identity, overwriting any existing one with the same name.
    fn add(
        &mut self,
        name: &str,
        embedding: Vec<f32>,
        image_count: u32,
        description: Option<String>,
    ) -> Result<(), StoreError>;

    /// Replace an identity's embedding, keeping `created_at` and, when
    /// `description` is `None`, the previous description. Adds when missing.
    fn update(
        &mut self,
        name: &str,
        embedding: Vec<f32>,
        image_count: u32,
        description: Option<String>,
    ) -> Result<(), StoreError>;

    /// Remove an identity. Returns whether a live identity was removed.
    fn remove(&mut self, name: &str) -> Result<bool, StoreError>;

    fn get(&self, name: &str) -> Option<&Identity>;

    /// Live identities in insertion order.
    fn identities(&self) -> Vec<&Identity>;

    /// Best match at or above `threshold`.
    fn find_match(&self, query: &[f32], threshold: f32) -> Result<Match, StoreError>;

    /// Up to `k` identities ordered by descending score, ties in insertion order.
    fn top_scores(&self, query: &[f32], k: usize) -> Result<Vec<ScoredName>, StoreError>;

    fn clear(&mut self);

    fn save(&self) -> Result<(), StoreError>;

    /// Replace the in-memory contents with the persisted catalog. On error the
    /// current contents are left untouched.
    fn load(&mut self) -> Result<(), StoreError>;
}

/// Create an empty store of the requested variant.
pub fn create(spec: &StoreSpec) -> Box<dyn EmbeddingStore> {
    match spec.kind {
        StoreKind::Exact => Box::new(ExactStore::new(spec.path.clone(), spec.dimensions)),
        StoreKind::Indexed => Box::new(IndexedStore::new(spec.path.clone(), spec.dimensions)),
    }
}

/// Create a store and load its persisted catalog.
pub fn open(spec: &StoreSpec) -> Result<Box<dyn EmbeddingStore>, StoreError> {
    let mut store = create(spec);
    store.load()?;
    Ok(store)
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale a vector to unit length. Fails on zero (or non-finite) norm.
pub fn normalize(mut v: Vec<f32>) -> Result<Vec<f32>, StoreError> {
    let norm = l2_norm(&v);
    if !norm.is_finite() || norm < f32::EPSILON {
        return Err(StoreError::ZeroNormVector);
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    Ok(v)
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Common argument checks for insertions: non-empty name, right dimension,
/// re-normalized vector.
pub(crate) fn prepare_embedding(
    name: &str,
    embedding: Vec<f32>,
    dimensions: usize,
) -> Result<Vec<f32>, StoreError> {
    if name.is_empty() {
        return Err(StoreError::EmptyName);
    }
    if embedding.len() != dimensions {
        return Err(StoreError::DimensionMismatch {
            expected: dimensions,
            got: embedding.len(),
        });
    }
    normalize(embedding)
}

/// Queries must have the store's dimension and a non-zero norm. They are not
/// re-normalized: callers pass embedder output, which is already unit length.
pub(crate) fn check_query(query: &[f32], dimensions: usize) -> Result<(), StoreError> {
    if query.len() != dimensions {
        return Err(StoreError::DimensionMismatch {
            expected: dimensions,
            got: query.len(),
        });
    }
    if l2_norm(query) < f32::EPSILON {
        return Err(StoreError::ZeroNormVector);
    }
    Ok(())
}

/// Pick the best candidate from scores listed in insertion order. The first
/// maximum wins.
pub(crate) fn best_of<'a>(
    scored: impl Iterator<Item = (&'a str, f32)>,
    threshold: f32,
) -> Match {
    let mut best: Option<(&str, f32)> = None;
    for (name, score) in scored {
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((name, score)),
        }
    }

    match best {
        Some((name, score)) if score >= threshold => Match {
            name: Some(name.to_string()),
            score,
        },
        Some((_, score)) => Match { name: None, score },
        None => Match::none(),
    }
}

/// Rank scores listed in insertion order. The sort is stable, so equal scores
/// keep insertion order.
pub(crate) fn rank(mut scored: Vec<ScoredName>, k: usize) -> Vec<ScoredName> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(k);
    scored
}

/// Shared, swappable reference to the live store of a serving process.
///
/// Readers clone the inner `Arc` and score without holding the lock; a reload
/// replaces the reference in one write.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<RwLock<Arc<dyn EmbeddingStore>>>,
}

impl StoreHandle {
    pub fn new(store: Box<dyn EmbeddingStore>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::from(store))),
        }
    }

    pub fn current(&self) -> Arc<dyn EmbeddingStore> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new store and return its identity count.
    pub fn swap(&self, store: Box<dyn EmbeddingStore>) -> usize {
        let store: Arc<dyn EmbeddingStore> = Arc::from(store);
        let count = store.len();
        match self.inner.write() {
            Ok(mut guard) => *guard = store,
            Err(poisoned) => *poisoned.into_inner() = store,
        }
        count
    }

    /// Load the persisted catalog into a fresh instance and swap it in.
    ///
    /// Safe to call repeatedly. When loading fails the previous store stays live.
    pub fn reload(&self, spec: &StoreSpec) -> Result<usize, StoreError> {
        let fresh = open(spec)?;
        let count = self.swap(fresh);
        log::info!("reloaded {} store from {} ({} identities)", spec.kind, spec.path.display(), count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_unit_norm() {
        let v = normalize(vec![3.0, 4.0, 0.0]).unwrap();
        assert!((l2_norm(&v) - 1.0).abs() < NORM_TOLERANCE);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_rejects_zero() {
        assert!(matches!(
            normalize(vec![0.0, 0.0]),
            Err(StoreError::ZeroNormVector)
        ));
        assert!(matches!(
            normalize(vec![f32::NAN, 1.0]),
            Err(StoreError::ZeroNormVector)
        ));
    }

    #[test]
    fn test_best_of_first_maximum_wins() {
        let scored = vec![("a", 0.7), ("b", 0.9), ("c", 0.9)];
        let m = best_of(scored.into_iter(), 0.5);
        assert_eq!(m.name.as_deref(), Some("b"));
    }

    #[test]
    fn test_best_of_below_threshold_keeps_score() {
        let scored = vec![("a", 0.4), ("b", 0.45)];
        let m = best_of(scored.into_iter(), 0.5);
        assert_eq!(m.name, None);
        assert!((m.score - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_rank_is_stable_on_ties() {
        let scored = vec![
            ScoredName { name: "first".into(), score: 0.5 },
            ScoredName { name: "top".into(), score: 0.9 },
            ScoredName { name: "second".into(), score: 0.5 },
        ];
        let ranked = rank(scored, 3);
        let names: Vec<&str> = ranked.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["top", "first", "second"]);
    }

    #[test]
    fn test_store_kind_parse() {
        assert_eq!("Indexed".parse::<StoreKind>().unwrap(), StoreKind::Indexed);
        assert!("faiss".parse::<StoreKind>().is_err());
        assert_eq!(StoreKind::from_byte(StoreKind::Exact.as_byte()), Some(StoreKind::Exact));
    }

    #[test]
    fn test_handle_swap_replaces_store() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = StoreSpec {
            kind: StoreKind::Exact,
            path: tmp.path().join("db.bin"),
            dimensions: 2,
        };
        let handle = StoreHandle::new(create(&spec));
        assert_eq!(handle.current().len(), 0);

        let mut next = create(&spec);
        next.add("a", vec![1.0, 0.0], 1, None).unwrap();
        assert_eq!(handle.swap(next), 1);
        assert_eq!(handle.current().len(), 1);
    }

    #[test]
    fn test_handle_reload_failure_keeps_previous() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = StoreSpec {
            kind: StoreKind::Exact,
            path: tmp.path().join("missing.bin"),
            dimensions: 2,
        };
        let mut first = create(&spec);
        first.add("a", vec![1.0, 0.0], 1, None).unwrap();
        let handle = StoreHandle::new(first);

        assert!(handle.reload(&spec).is_err());
        assert_eq!(handle.current().len(), 1);
    }
}
