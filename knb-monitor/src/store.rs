//! Per-node collection records keyed by collection id.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionState {
    Running,
    Finished(Result<(), String>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClaimError {
    #[error("collection {0} still running")]
    StillInProgress(String),
    #[error("collection {id} failed: {message}")]
    Failed { id: String, message: String },
    #[error("unknown collection id {0}")]
    UnknownId(String),
}

#[derive(Debug, Default)]
pub struct CollectionStore {
    records: Mutex<HashMap<String, CollectionState>>,
}

impl CollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a running record unless one exists. Returns whether this
    /// caller won.
    pub fn try_begin(&self, id: &str) -> bool {
        match self.records.lock().entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(CollectionState::Running);
                true
            }
        }
    }

    pub fn complete(&self, id: &str, result: Result<(), String>) {
        self.records
            .lock()
            .insert(id.to_string(), CollectionState::Finished(result));
    }

    /// Takes a finished record out of the store. Running records stay.
    pub fn claim(&self, id: &str) -> Result<(), ClaimError> {
        let mut records = self.records.lock();
        match records.get(id) {
            None => Err(ClaimError::UnknownId(id.to_string())),
            Some(CollectionState::Running) => Err(ClaimError::StillInProgress(id.to_string())),
            Some(CollectionState::Finished(_)) => match records.remove(id) {
                Some(CollectionState::Finished(Err(message))) => Err(ClaimError::Failed {
                    id: id.to_string(),
                    message,
                }),
                _ => Ok(()),
            },
        }
    }

    pub fn state(&self, id: &str) -> Option<CollectionState> {
        self.records.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_begin_loses_and_leaves_record_alone() {
        let store = CollectionStore::new();
        assert!(store.try_begin("r1"));
        store.complete("r1", Ok(()));
        assert!(!store.try_begin("r1"));
        assert_eq!(store.state("r1"), Some(CollectionState::Finished(Ok(()))));
    }

    #[test]
    fn concurrent_begins_have_one_winner() {
        let store = Arc::new(CollectionStore::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.try_begin("same"))
            })
            .collect();
        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(winners, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn claim_follows_record_lifecycle() {
        let store = CollectionStore::new();
        assert_eq!(store.claim("r1"), Err(ClaimError::UnknownId("r1".into())));

        store.try_begin("r1");
        assert_eq!(store.claim("r1"), Err(ClaimError::StillInProgress("r1".into())));
        assert_eq!(store.state("r1"), Some(CollectionState::Running));

        store.complete("r1", Ok(()));
        assert_eq!(store.claim("r1"), Ok(()));
        assert_eq!(store.claim("r1"), Err(ClaimError::UnknownId("r1".into())));
        assert!(store.is_empty());
    }

    #[test]
    fn failed_records_report_once() {
        let store = CollectionStore::new();
        store.try_begin("r2");
        store.complete("r2", Err("perf exited with 1".into()));
        assert_eq!(
            store.claim("r2"),
            Err(ClaimError::Failed {
                id: "r2".into(),
                message: "perf exited with 1".into()
            })
        );
        assert!(store.state("r2").is_none());
    }
}
