//! Mutation push processing.

pub mod documents;
mod processor;
mod registry;
mod store;

pub use documents::{DocumentChange, DocumentTx};
pub use processor::{CounterCheck, PushProcessor};
pub use registry::{Handler, MutationContext, MutatorError, MutatorRegistry, Param, RegistryError};
pub use store::{MemoryMutationStore, MemoryTx, MutationStore, StoredResult};

use async_trait::async_trait;
use tributary_engine::{PushRequest, PushResponse};

/// Push endpoint backend, independent of the storage in use.
#[async_trait]
pub trait PushService: Send + Sync {
    async fn push(&self, request: PushRequest) -> PushResponse;
}
