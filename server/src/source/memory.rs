//! Channel-fed change source for tests and embedding.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Notify, RwLock};
use tributary_engine::{ChangeEvent, Document, ResumePosition};

use super::{ChangeCursor, ChangeSource, SourceError};

#[derive(Default)]
struct Shared {
    log: RwLock<Vec<ChangeEvent>>,
    appended: Notify,
    closed: AtomicBool,
    reads: AtomicUsize,
    open_cursors: AtomicUsize,
    documents: DashMap<String, Vec<Document>>,
}

/// In-memory change log. The position of the n-th published change is `n`.
#[derive(Clone)]
pub struct MemoryChangeSource {
    database: String,
    shared: Arc<Shared>,
}

impl MemoryChangeSource {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Append a change, stamping its resume position.
    pub async fn publish(&self, event: ChangeEvent) -> ResumePosition {
        self.append(event, true).await
    }

    /// Append a change that carries no resume position of its own.
    pub async fn publish_without_position(&self, event: ChangeEvent) -> ResumePosition {
        self.append(event, false).await
    }

    async fn append(&self, mut event: ChangeEvent, stamp: bool) -> ResumePosition {
        let mut log = self.shared.log.write().await;
        let position = ResumePosition::new((log.len() + 1).to_string());
        event.resume_position = stamp.then(|| position.clone());
        log.push(event);
        drop(log);
        self.shared.appended.notify_waiters();
        position
    }

    /// Replace the snapshot contents of a collection.
    pub fn seed(&self, collection: impl Into<String>, documents: Vec<Document>) {
        self.shared.documents.insert(collection.into(), documents);
    }

    /// End every stream once it is drained.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.appended.notify_waiters();
    }

    /// Changes handed out by all cursors so far.
    pub fn reads(&self) -> usize {
        self.shared.reads.load(Ordering::SeqCst)
    }

    /// Cursors not yet dropped.
    pub fn open_cursors(&self) -> usize {
        self.shared.open_cursors.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    fn database(&self) -> &str {
        &self.database
    }

    async fn open(&self, resume: Option<ResumePosition>) -> Result<Box<dyn ChangeCursor>, SourceError> {
        let start = match resume {
            Some(position) => position
                .as_str()
                .parse::<usize>()
                .map_err(|_| SourceError::InvalidPosition(position.to_string()))?,
            None => self.shared.log.read().await.len(),
        };
        self.shared.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryCursor {
            shared: self.shared.clone(),
            next_index: start,
            position: Some(ResumePosition::new(start.to_string())),
        }))
    }

    async fn current_position(&self) -> Result<ResumePosition, SourceError> {
        Ok(ResumePosition::new(self.shared.log.read().await.len().to_string()))
    }

    async fn snapshot(&self, collection: &str) -> Result<Vec<Document>, SourceError> {
        Ok(self
            .shared
            .documents
            .get(collection)
            .map(|docs| docs.value().clone())
            .unwrap_or_default())
    }
}

struct MemoryCursor {
    shared: Arc<Shared>,
    next_index: usize,
    position: Option<ResumePosition>,
}

#[async_trait]
impl ChangeCursor for MemoryCursor {
    async fn next(&mut self) -> Result<Option<ChangeEvent>, SourceError> {
        loop {
            let appended = self.shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(event) = self.shared.log.read().await.get(self.next_index).cloned() {
                self.next_index += 1;
                self.position = Some(ResumePosition::new(self.next_index.to_string()));
                self.shared.reads.fetch_add(1, Ordering::SeqCst);
                return Ok(Some(event));
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            appended.await;
        }
    }

    fn position(&self) -> Option<ResumePosition> {
        self.position.clone()
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.shared.open_cursors.fetch_sub(1, Ordering::SeqCst);
    }
}
