//! Exact store: a flat list scanned linearly on every query.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;

use super::{
    best_of, check_query, dot, format, prepare_embedding, rank, EmbeddingStore, Identity, Match,
    ScoredName, StoreError, StoreKind,
};

/// Identities kept in insertion order with a name lookup table.
///
/// Updates and removals act in place, so the store never holds more than one
/// entry per name.
pub struct ExactStore {
    path: PathBuf,
    dimensions: usize,
    /// Insertion order
    entries: Vec<Identity>,
    /// Name -> position in `entries`
    positions: HashMap<String, usize>,
}

impl ExactStore {
    pub fn new(path: PathBuf, dimensions: usize) -> Self {
        Self {
            path,
            dimensions,
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }

    fn insert(&mut self, identity: Identity) {
        match self.positions.get(&identity.name) {
            Some(&pos) => self.entries[pos] = identity,
            None => {
                self.positions.insert(identity.name.clone(), self.entries.len());
                self.entries.push(identity);
            }
        }
    }

    fn reindex(&mut self) {
        self.positions = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, identity)| (identity.name.clone(), pos))
            .collect();
    }
}

impl EmbeddingStore for ExactStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Exact
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn add(
        &mut self,
        name: &str,
        embedding: Vec<f32>,
        image_count: u32,
        description: Option<String>,
    ) -> Result<(), StoreError> {
        let embedding = prepare_embedding(name, embedding, self.dimensions)?;
        let now = Utc::now();
        self.insert(Identity {
            name: name.to_string(),
            embedding,
            image_count,
            description,
            created_at: now,
            updated_at: now,
        });
        Ok(())
    }

    fn update(
        &mut self,
        name: &str,
        embedding: Vec<f32>,
        image_count: u32,
        description: Option<String>,
    ) -> Result<(), StoreError> {
        let embedding = prepare_embedding(name, embedding, self.dimensions)?;
        let Some(&pos) = self.positions.get(name) else {
            return self.add(name, embedding, image_count, description);
        };

        let entry = &mut self.entries[pos];
        entry.embedding = embedding;
        entry.image_count = image_count;
        if description.is_some() {
            entry.description = description;
        }
        entry.updated_at = Utc::now();
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<bool, StoreError> {
        let Some(pos) = self.positions.remove(name) else {
            return Ok(false);
        };
        self.entries.remove(pos);
        self.reindex();
        Ok(true)
    }

    fn get(&self, name: &str) -> Option<&Identity> {
        self.positions.get(name).map(|&pos| &self.entries[pos])
    }

    fn identities(&self) -> Vec<&Identity> {
        self.entries.iter().collect()
    }

    fn find_match(&self, query: &[f32], threshold: f32) -> Result<Match, StoreError> {
        check_query(query, self.dimensions)?;
        let scored = self
            .entries
            .iter()
            .map(|identity| (identity.name.as_str(), dot(query, &identity.embedding)));
        Ok(best_of(scored, threshold))
    }

    fn top_scores(&self, query: &[f32], k: usize) -> Result<Vec<ScoredName>, StoreError> {
        check_query(query, self.dimensions)?;
        let scored = self
            .entries
            .iter()
            .map(|identity| ScoredName {
                name: identity.name.clone(),
                score: dot(query, &identity.embedding),
            })
            .collect();
        Ok(rank(scored, k))
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }

    fn save(&self) -> Result<(), StoreError> {
        format::write(
            &self.path,
            StoreKind::Exact,
            self.dimensions,
            self.entries.iter().map(|identity| (identity, false)),
        )?;
        log::debug!("saved {} identities to {}", self.entries.len(), self.path.display());
        Ok(())
    }

    fn load(&mut self) -> Result<(), StoreError> {
        let records = format::read(&self.path, StoreKind::Exact, self.dimensions)?;

        let mut fresh = ExactStore::new(self.path.clone(), self.dimensions);
        for record in records.into_iter().filter(|r| !r.stale) {
            fresh.insert(record.identity);
        }

        *self = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{l2_norm, NORM_TOLERANCE};

    fn store(dimensions: usize) -> (tempfile::TempDir, ExactStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ExactStore::new(tmp.path().join("face_db.bin"), dimensions);
        (tmp, store)
    }

    #[test]
    fn test_add_normalizes() {
        let (_tmp, mut store) = store(3);
        store.add("Alice", vec![3.0, 4.0, 0.0], 2, None).unwrap();

        let alice = store.get("Alice").unwrap();
        assert!((l2_norm(&alice.embedding) - 1.0).abs() < NORM_TOLERANCE);
        assert_eq!(alice.image_count, 2);
    }

    #[test]
    fn test_self_match_scores_one() {
        let (_tmp, mut store) = store(3);
        store.add("Alice", vec![0.2, 0.5, 0.1], 1, None).unwrap();
        let stored = store.get("Alice").unwrap().embedding.clone();

        let m = store.find_match(&stored, 0.5).unwrap();
        assert_eq!(m.name.as_deref(), Some("Alice"));
        assert!((m.score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let (_tmp, mut store) = store(3);
        store.add("Alice", vec![1.0, 0.0, 0.0], 1, None).unwrap();
        let query = [0.6, 0.8, 0.0];

        let score = store.find_match(&query, 0.0).unwrap().score;
        assert_eq!(store.find_match(&query, score).unwrap().name.as_deref(), Some("Alice"));

        let rejected = store.find_match(&query, score + 1e-6).unwrap();
        assert_eq!(rejected.name, None);
        assert!((rejected.score - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_empty_store_matches_nothing() {
        let (_tmp, store) = store(3);
        let m = store.find_match(&[1.0, 0.0, 0.0], 0.5).unwrap();
        assert_eq!(m, Match::none());
        assert!(store.top_scores(&[1.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_best_of_two_and_rejection() {
        let (_tmp, mut store) = store(3);
        store.add("Alice", vec![1.0, 0.0, 0.0], 1, None).unwrap();
        store.add("Bob", vec![0.0, 1.0, 0.0], 1, None).unwrap();

        let m = store.find_match(&[0.8, 0.6, 0.0], 0.5).unwrap();
        assert_eq!(m.name.as_deref(), Some("Alice"));
        assert!((m.score - 0.8).abs() < 1e-6);

        let m = store.find_match(&[0.0, 0.0, 1.0], 0.5).unwrap();
        assert_eq!(m.name, None);
    }

    #[test]
    fn test_update_keeps_position_and_created_at() {
        let (_tmp, mut store) = store(2);
        store.add("Alice", vec![1.0, 0.0], 1, Some("Engineer".into())).unwrap();
        store.add("Bob", vec![0.0, 1.0], 1, None).unwrap();
        let created = store.get("Alice").unwrap().created_at;

        store.update("Alice", vec![0.0, 1.0], 4, None).unwrap();

        let alice = store.get("Alice").unwrap();
        assert_eq!(alice.created_at, created);
        assert_eq!(alice.image_count, 4);
        assert_eq!(alice.description.as_deref(), Some("Engineer"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.identities()[0].name, "Alice");
    }

    #[test]
    fn test_update_missing_adds() {
        let (_tmp, mut store) = store(2);
        store.update("Carol", vec![1.0, 1.0], 1, None).unwrap();
        assert!(store.get("Carol").is_some());
    }

    #[test]
    fn test_remove_is_real_delete() {
        let (_tmp, mut store) = store(2);
        store.add("Alice", vec![1.0, 0.0], 1, None).unwrap();
        store.add("Bob", vec![0.0, 1.0], 1, None).unwrap();

        assert!(store.remove("Alice").unwrap());
        assert!(!store.remove("Alice").unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("Bob").unwrap().name, "Bob");

        let m = store.find_match(&[1.0, 0.0], 0.0).unwrap();
        assert_ne!(m.name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_rejects_bad_input() {
        let (_tmp, mut store) = store(3);
        assert!(matches!(
            store.add("Alice", vec![1.0, 0.0], 1, None),
            Err(StoreError::DimensionMismatch { expected: 3, got: 2 })
        ));
        assert!(matches!(
            store.add("Zero", vec![0.0, 0.0, 0.0], 1, None),
            Err(StoreError::ZeroNormVector)
        ));
        assert!(matches!(
            store.add("", vec![1.0, 0.0, 0.0], 1, None),
            Err(StoreError::EmptyName)
        ));
        assert!(matches!(
            store.find_match(&[0.0, 0.0, 0.0], 0.5),
            Err(StoreError::ZeroNormVector)
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let (_tmp, mut store) = store(3);
        store.add("Alice", vec![1.0, 2.0, 3.0], 5, Some("Role: Engineer".into())).unwrap();
        store.add("Bob", vec![0.0, 1.0, 0.0], 2, None).unwrap();
        store.save().unwrap();

        let mut loaded = ExactStore::new(store.path().to_path_buf(), 3);
        loaded.load().unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("Alice"), store.get("Alice"));
        assert_eq!(loaded.identities()[1].name, "Bob");
    }

    #[test]
    fn test_failed_load_keeps_contents() {
        let (_tmp, mut store) = store(3);
        store.add("Alice", vec![1.0, 0.0, 0.0], 1, None).unwrap();
        std::fs::write(store.path(), b"garbage").unwrap();

        assert!(store.load().is_err());
        assert_eq!(store.len(), 1);
    }
}
