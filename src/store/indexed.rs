//! Indexed store: an append-only slot matrix.
//!
//! Vectors live in one contiguous buffer, one row per slot. Slots are never
//! rewritten: an update appends a new slot and marks the old one stale, a
//! removal only marks the slot stale. Queries skip stale slots. A full
//! rebuild produces a fresh store without stale slots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rayon::prelude::*;

use super::{
    best_of, check_query, dot, format, prepare_embedding, rank, EmbeddingStore, Identity, Match,
    ScoredName, StoreError, StoreKind,
};

/// Slot count above which queries are scored in parallel.
const PARALLEL_SCAN_CUTOFF: usize = 4096;

#[derive(Debug, Clone)]
struct Slot {
    identity: Identity,
    stale: bool,
}

pub struct IndexedStore {
    path: PathBuf,
    dimensions: usize,
    /// Row-major, `slots.len() * dimensions` values
    vectors: Vec<f32>,
    slots: Vec<Slot>,
    /// Name -> live slot
    live: HashMap<String, usize>,
}

impl IndexedStore {
    pub fn new(path: PathBuf, dimensions: usize) -> Self {
        Self {
            path,
            dimensions,
            vectors: Vec::new(),
            slots: Vec::new(),
            live: HashMap::new(),
        }
    }

    /// Slots that no longer back a live identity.
    pub fn stale_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.stale).count()
    }

    /// Total slots, live and stale.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn row(&self, slot: usize) -> &[f32] {
        let start = slot * self.dimensions;
        &self.vectors[start..start + self.dimensions]
    }

    /// Append a slot. An existing live slot for the same name goes stale.
    fn append(&mut self, identity: Identity, stale: bool) {
        let slot = self.slots.len();
        self.vectors.extend_from_slice(&identity.embedding);
        if !stale {
            if let Some(previous) = self.live.insert(identity.name.clone(), slot) {
                self.slots[previous].stale = true;
            }
        }
        self.slots.push(Slot { identity, stale });
    }

    /// Scores of live slots in slot order.
    fn live_scores(&self, query: &[f32]) -> Vec<(usize, f32)> {
        let score = |(slot, meta): (usize, &Slot)| {
            if meta.stale {
                None
            } else {
                Some((slot, dot(query, self.row(slot))))
            }
        };

        if self.slots.len() > PARALLEL_SCAN_CUTOFF {
            self.slots.par_iter().enumerate().filter_map(score).collect()
        } else {
            self.slots.iter().enumerate().filter_map(score).collect()
        }
    }
}

impl EmbeddingStore for IndexedStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Indexed
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn len(&self) -> usize {
        self.live.len()
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
        self.append(
            Identity {
                name: name.to_string(),
                embedding,
                image_count,
                description,
                created_at: now,
                updated_at: now,
            },
            false,
        );
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
        let now = Utc::now();

        let identity = match self.get(name) {
            Some(previous) => Identity {
                name: name.to_string(),
                embedding,
                image_count,
                description: description.or_else(|| previous.description.clone()),
                created_at: previous.created_at,
                updated_at: now,
            },
            None => Identity {
                name: name.to_string(),
                embedding,
                image_count,
                description,
                created_at: now,
                updated_at: now,
            },
        };
        self.append(identity, false);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<bool, StoreError> {
        match self.live.remove(name) {
            Some(slot) => {
                self.slots[slot].stale = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn get(&self, name: &str) -> Option<&Identity> {
        self.live.get(name).map(|&slot| &self.slots[slot].identity)
    }

    fn identities(&self) -> Vec<&Identity> {
        self.slots
            .iter()
            .filter(|slot| !slot.stale)
            .map(|slot| &slot.identity)
            .collect()
    }

    fn find_match(&self, query: &[f32], threshold: f32) -> Result<Match, StoreError> {
        check_query(query, self.dimensions)?;
        let scores = self.live_scores(query);
        let scored = scores
            .iter()
            .map(|&(slot, score)| (self.slots[slot].identity.name.as_str(), score));
        Ok(best_of(scored, threshold))
    }

    fn top_scores(&self, query: &[f32], k: usize) -> Result<Vec<ScoredName>, StoreError> {
        check_query(query, self.dimensions)?;
        let scored = self
            .live_scores(query)
            .into_iter()
            .map(|(slot, score)| ScoredName {
                name: self.slots[slot].identity.name.clone(),
                score,
            })
            .collect();
        Ok(rank(scored, k))
    }

    fn clear(&mut self) {
        self.vectors.clear();
        self.slots.clear();
        self.live.clear();
    }

    fn save(&self) -> Result<(), StoreError> {
        format::write(
            &self.path,
            StoreKind::Indexed,
            self.dimensions,
            self.slots.iter().map(|slot| (&slot.identity, slot.stale)),
        )?;
        log::debug!(
            "saved {} slots ({} stale) to {}",
            self.slots.len(),
            self.stale_count(),
            self.path.display()
        );
        Ok(())
    }

    fn load(&mut self) -> Result<(), StoreError> {
        let records = format::read(&self.path, StoreKind::Indexed, self.dimensions)?;

        let mut fresh = IndexedStore::new(self.path.clone(), self.dimensions);
        fresh.vectors.reserve(records.len() * self.dimensions);
        for record in records {
            fresh.append(record.identity, record.stale);
        }

        *self = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dimensions: usize) -> (tempfile::TempDir, IndexedStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexedStore::new(tmp.path().join("face_db.idx"), dimensions);
        (tmp, store)
    }

    #[test]
    fn test_update_appends_and_marks_stale() {
        let (_tmp, mut store) = store(2);
        store.add("Alice", vec![1.0, 0.0], 1, Some("Engineer".into())).unwrap();
        store.update("Alice", vec![0.0, 1.0], 2, None).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.slot_count(), 2);
        assert_eq!(store.stale_count(), 1);

        let alice = store.get("Alice").unwrap();
        assert_eq!(alice.embedding, vec![0.0, 1.0]);
        assert_eq!(alice.description.as_deref(), Some("Engineer"));

        // the stale vector no longer matches
        let m = store.find_match(&[1.0, 0.0], 0.5).unwrap();
        assert_eq!(m.name, None);
        let m = store.find_match(&[0.0, 1.0], 0.5).unwrap();
        assert_eq!(m.name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_remove_marks_stale() {
        let (_tmp, mut store) = store(2);
        store.add("Alice", vec![1.0, 0.0], 1, None).unwrap();
        store.add("Bob", vec![0.0, 1.0], 1, None).unwrap();

        assert!(store.remove("Alice").unwrap());
        assert!(!store.remove("Alice").unwrap());
        assert!(store.get("Alice").is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(store.slot_count(), 2);

        let top = store.top_scores(&[1.0, 0.0], 5).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].name, "Bob");
    }

    #[test]
    fn test_top_scores_descending() {
        let (_tmp, mut store) = store(2);
        store.add("Low", vec![0.0, 1.0], 1, None).unwrap();
        store.add("High", vec![1.0, 0.0], 1, None).unwrap();
        store.add("Mid", vec![1.0, 1.0], 1, None).unwrap();

        let top = store.top_scores(&[1.0, 0.0], 2).unwrap();
        let names: Vec<&str> = top.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["High", "Mid"]);
    }

    #[test]
    fn test_save_and_load_preserves_stale_slots() {
        let (_tmp, mut store) = store(2);
        store.add("Alice", vec![1.0, 0.0], 1, None).unwrap();
        store.update("Alice", vec![0.0, 1.0], 2, None).unwrap();
        store.add("Bob", vec![1.0, 1.0], 1, None).unwrap();
        store.save().unwrap();

        let mut loaded = IndexedStore::new(store.path().to_path_buf(), 2);
        loaded.load().unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.stale_count(), 1);
        assert_eq!(loaded.get("Alice"), store.get("Alice"));
        let m = loaded.find_match(&[1.0, 0.0], 0.9).unwrap();
        assert_eq!(m.name, None);
    }

    #[test]
    fn test_refuses_exact_file() {
        let (tmp, store) = store(2);
        let mut exact = crate::store::ExactStore::new(tmp.path().join("exact.bin"), 2);
        exact.add("Alice", vec![1.0, 0.0], 1, None).unwrap();
        exact.save().unwrap();

        let mut indexed = IndexedStore::new(exact.path().to_path_buf(), store.dimensions());
        assert!(matches!(indexed.load(), Err(StoreError::KindMismatch { .. })));
    }

    #[test]
    fn test_parallel_scan_matches_sequential_order() {
        let (_tmp, mut store) = store(2);
        for i in 0..(PARALLEL_SCAN_CUTOFF + 10) {
            store.add(&format!("p{i}"), vec![1.0, 0.0], 1, None).unwrap();
        }
        let m = store.find_match(&[1.0, 0.0], 0.5).unwrap();
        assert_eq!(m.name.as_deref(), Some("p0"));
    }
}
