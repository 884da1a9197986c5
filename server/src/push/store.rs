//! Mutation bookkeeping storage.
//!
//! Every mutation runs in its own transaction. The store tracks, per client,
//! the id of the last applied mutation and keeps a result record for each
//! processed one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tributary_engine::{ChangeEvent, Document, MutationResult};

use super::documents::{DocumentChange, DocumentTx};
use crate::error::StoreError;
use crate::source::{ChangeSource, MemoryChangeSource};

/// Transactional storage for push processing.
///
/// Dropping a transaction without committing it rolls it back.
#[async_trait]
pub trait MutationStore: Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;

    /// Last applied mutation id of a client, 0 when it never pushed.
    async fn last_mutation_id(
        &self,
        tx: &mut Self::Tx,
        client_group_id: &str,
        client_id: &str,
    ) -> Result<u64, StoreError>;

    async fn set_last_mutation_id(
        &self,
        tx: &mut Self::Tx,
        client_group_id: &str,
        client_id: &str,
        mutation_id: u64,
    ) -> Result<(), StoreError>;

    async fn record_result(
        &self,
        tx: &mut Self::Tx,
        client_group_id: &str,
        client_id: &str,
        mutation_id: u64,
        result: &MutationResult,
    ) -> Result<(), StoreError>;
}

/// A stored mutation outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub client_group_id: String,
    pub client_id: String,
    pub mutation_id: u64,
    pub result: MutationResult,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    counters: HashMap<(String, String), u64>,
    results: Vec<StoredResult>,
    documents: HashMap<(String, String), Document>,
    changes: Vec<DocumentChange>,
}

/// In-memory mutation store.
///
/// Transactions are serialized by a mutex and work on a staged copy of the
/// state that replaces the live one on commit.
#[derive(Clone, Default)]
pub struct MemoryMutationStore {
    state: Arc<Mutex<MemoryState>>,
    unavailable: Arc<AtomicBool>,
    feed: Option<MemoryChangeSource>,
}

/// Transaction of a [`MemoryMutationStore`].
pub struct MemoryTx {
    live: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

impl MemoryMutationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish committed document changes to `source`.
    pub fn with_change_feed(mut self, source: MemoryChangeSource) -> Self {
        self.feed = Some(source);
        self
    }

    /// Make every new transaction fail, as if the database went away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn counter(&self, client_group_id: &str, client_id: &str) -> u64 {
        let state = self.state.lock().await;
        counter_of(&state, client_group_id, client_id)
    }

    pub async fn set_counter(&self, client_group_id: &str, client_id: &str, mutation_id: u64) {
        let mut state = self.state.lock().await;
        state
            .counters
            .insert((client_group_id.to_string(), client_id.to_string()), mutation_id);
    }

    pub async fn results(&self) -> Vec<StoredResult> {
        self.state.lock().await.results.clone()
    }

    pub async fn document(&self, collection: &str, doc_id: &str) -> Option<Document> {
        let state = self.state.lock().await;
        state
            .documents
            .get(&(collection.to_string(), doc_id.to_string()))
            .cloned()
    }

    /// Committed document changes, oldest first.
    pub async fn changes(&self) -> Vec<DocumentChange> {
        self.state.lock().await.changes.clone()
    }
}

fn counter_of(state: &MemoryState, client_group_id: &str, client_id: &str) -> u64 {
    state
        .counters
        .get(&(client_group_id.to_string(), client_id.to_string()))
        .copied()
        .unwrap_or(0)
}

#[async_trait]
impl MutationStore for MemoryMutationStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        let live = self.state.clone().lock_owned().await;
        let staged = live.clone();
        Ok(MemoryTx { live, staged })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), StoreError> {
        let MemoryTx { mut live, staged } = tx;
        let published: Vec<ChangeEvent> = match &self.feed {
            Some(feed) => staged.changes[live.changes.len()..]
                .iter()
                .cloned()
                .map(|change| change.into_event(feed.database()))
                .collect(),
            None => Vec::new(),
        };
        *live = staged;
        drop(live);

        if let Some(feed) = &self.feed {
            for event in published {
                feed.publish(event).await;
            }
        }
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), StoreError> {
        drop(tx);
        Ok(())
    }

    async fn last_mutation_id(
        &self,
        tx: &mut MemoryTx,
        client_group_id: &str,
        client_id: &str,
    ) -> Result<u64, StoreError> {
        Ok(counter_of(&tx.staged, client_group_id, client_id))
    }

    async fn set_last_mutation_id(
        &self,
        tx: &mut MemoryTx,
        client_group_id: &str,
        client_id: &str,
        mutation_id: u64,
    ) -> Result<(), StoreError> {
        tx.staged
            .counters
            .insert((client_group_id.to_string(), client_id.to_string()), mutation_id);
        Ok(())
    }

    async fn record_result(
        &self,
        tx: &mut MemoryTx,
        client_group_id: &str,
        client_id: &str,
        mutation_id: u64,
        result: &MutationResult,
    ) -> Result<(), StoreError> {
        tx.staged.results.push(StoredResult {
            client_group_id: client_group_id.to_string(),
            client_id: client_id.to_string(),
            mutation_id,
            result: result.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl DocumentTx for MemoryTx {
    async fn load_document(&mut self, collection: &str, doc_id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self
            .staged
            .documents
            .get(&(collection.to_string(), doc_id.to_string()))
            .cloned())
    }

    async fn save_document(&mut self, collection: &str, doc_id: &str, document: &Document) -> Result<(), StoreError> {
        self.staged
            .documents
            .insert((collection.to_string(), doc_id.to_string()), document.clone());
        Ok(())
    }

    async fn delete_document(&mut self, collection: &str, doc_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .staged
            .documents
            .remove(&(collection.to_string(), doc_id.to_string()))
            .is_some())
    }

    async fn append_change(&mut self, change: &DocumentChange) -> Result<(), StoreError> {
        self.staged.changes.push(change.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_applies_and_rollback_discards() {
        let store = MemoryMutationStore::new();

        let mut tx = store.begin().await.unwrap();
        store.set_last_mutation_id(&mut tx, "g", "c", 3).await.unwrap();
        assert_eq!(store.last_mutation_id(&mut tx, "g", "c").await.unwrap(), 3);
        store.rollback(tx).await.unwrap();
        assert_eq!(store.counter("g", "c").await, 0);

        let mut tx = store.begin().await.unwrap();
        store.set_last_mutation_id(&mut tx, "g", "c", 4).await.unwrap();
        store.commit(tx).await.unwrap();
        assert_eq!(store.counter("g", "c").await, 4);
        // other clients are untouched
        assert_eq!(store.counter("g", "other").await, 0);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryMutationStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            store.set_last_mutation_id(&mut tx, "g", "c", 9).await.unwrap();
        }
        assert_eq!(store.counter("g", "c").await, 0);
    }

    #[tokio::test]
    async fn unavailable_store_refuses_transactions() {
        let store = MemoryMutationStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.begin().await, Err(StoreError::Unavailable(_))));
        store.set_unavailable(false);
        assert!(store.begin().await.is_ok());
    }
}
