//! Push batch processing.
//!
//! Mutations are applied one at a time in request order, each in its own
//! transaction. The client's mutation counter is checked and advanced first
//! (phase 1), then the handler runs (phase 2). A failing handler is rolled
//! back and the counter is advanced again in a fresh transaction, so the
//! mutation still counts as processed.

use async_trait::async_trait;
use serde_json::Value;
use tributary_engine::{
    Mutation, MutationErrorKind, MutationResponse, MutationResult, PushRequest, PushResponse,
};

use super::registry::{MutationContext, MutatorError, MutatorRegistry};
use super::store::MutationStore;
use super::PushService;
use crate::error::StoreError;

/// Outcome of the counter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterCheck {
    /// The mutation was next in line and the counter now points at it.
    Advanced,
    /// The mutation was applied before.
    AlreadyProcessed { last: u64 },
    /// The mutation skips ahead of the counter.
    OutOfOrder { expected: u64 },
}

struct Step {
    result: MutationResult,
    /// Skip the rest of the batch.
    stop: bool,
}

impl Step {
    fn next(result: MutationResult) -> Self {
        Self { result, stop: false }
    }

    fn stop(result: MutationResult) -> Self {
        Self { result, stop: true }
    }
}

pub struct PushProcessor<S: MutationStore> {
    store: S,
    registry: MutatorRegistry<S::Tx>,
}

impl<S: MutationStore> PushProcessor<S> {
    pub fn new(store: S, registry: MutatorRegistry<S::Tx>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Apply a batch, answering every mutation that was attempted.
    pub async fn process(&self, request: &PushRequest) -> PushResponse {
        let group = request.client_group_id.as_str();
        let mut mutations = Vec::with_capacity(request.mutations.len());

        for (index, mutation) in request.mutations.iter().enumerate() {
            let step = match self.apply(group, mutation).await {
                Ok(step) => step,
                Err(e) => {
                    tracing::error!(
                        client_group_id = %group,
                        client_id = %mutation.client_id,
                        mutation_id = mutation.id,
                        error = %e,
                        "storage failure while processing mutation"
                    );
                    Step::stop(MutationResult::error(MutationErrorKind::Internal, e.to_string()))
                }
            };
            mutations.push(MutationResponse {
                id: mutation.mutation_id(),
                result: step.result,
            });
            if step.stop {
                let skipped = request.mutations.len() - index - 1;
                if skipped > 0 {
                    tracing::warn!(client_group_id = %group, skipped, "rest of push batch skipped");
                }
                break;
            }
        }

        PushResponse { mutations }
    }

    /// Phase 1: compare the mutation id with the client's counter and
    /// advance the counter when the mutation is next.
    pub async fn check_and_advance(
        &self,
        tx: &mut S::Tx,
        client_group_id: &str,
        mutation: &Mutation,
    ) -> Result<CounterCheck, StoreError> {
        let last = self
            .store
            .last_mutation_id(tx, client_group_id, &mutation.client_id)
            .await?;
        let expected = last + 1;

        if mutation.id < expected {
            return Ok(CounterCheck::AlreadyProcessed { last });
        }
        if mutation.id > expected {
            return Ok(CounterCheck::OutOfOrder { expected });
        }
        self.store
            .set_last_mutation_id(tx, client_group_id, &mutation.client_id, mutation.id)
            .await?;
        Ok(CounterCheck::Advanced)
    }

    /// Phase 2: run the mutation's handler.
    pub async fn dispatch(
        &self,
        tx: &mut S::Tx,
        client_group_id: &str,
        mutation: &Mutation,
    ) -> Result<Value, MutatorError> {
        let ctx = MutationContext {
            client_group_id,
            mutation,
        };
        self.registry.dispatch(tx, &ctx).await
    }

    async fn apply(&self, group: &str, mutation: &Mutation) -> Result<Step, StoreError> {
        let mut tx = self.store.begin().await?;
        let check = self.check_and_advance(&mut tx, group, mutation).await?;
        if let Some(step) = refused(check, mutation) {
            self.store.rollback(tx).await?;
            return Ok(step);
        }

        let err = match self.dispatch(&mut tx, group, mutation).await {
            Ok(data) => {
                let result = MutationResult::ok(data);
                self.finish(tx, group, mutation, &result).await?;
                return Ok(Step::next(result));
            }
            Err(MutatorError::Storage(e)) => {
                self.store.rollback(tx).await?;
                return Err(e);
            }
            Err(err) => err,
        };

        tracing::warn!(
            client_group_id = %group,
            client_id = %mutation.client_id,
            mutation_id = mutation.id,
            mutator = %mutation.name,
            error = %err,
            "mutator failed, rolling back"
        );
        self.store.rollback(tx).await?;

        // advance the counter without running the handler again
        let mut tx = self.store.begin().await?;
        let check = self.check_and_advance(&mut tx, group, mutation).await?;
        if let Some(step) = refused(check, mutation) {
            self.store.rollback(tx).await?;
            return Ok(step);
        }
        let result = MutationResult::error(MutationErrorKind::App, err.to_string());
        self.finish(tx, group, mutation, &result).await?;
        Ok(Step::next(result))
    }

    async fn finish(
        &self,
        mut tx: S::Tx,
        group: &str,
        mutation: &Mutation,
        result: &MutationResult,
    ) -> Result<(), StoreError> {
        self.store
            .record_result(&mut tx, group, &mutation.client_id, mutation.id, result)
            .await?;
        self.store.commit(tx).await
    }
}

fn refused(check: CounterCheck, mutation: &Mutation) -> Option<Step> {
    match check {
        CounterCheck::Advanced => None,
        CounterCheck::AlreadyProcessed { last } => Some(Step::next(MutationResult::error(
            MutationErrorKind::AlreadyProcessed,
            format!("mutation {} already processed, last is {}", mutation.id, last),
        ))),
        CounterCheck::OutOfOrder { expected } => Some(Step::stop(MutationResult::error(
            MutationErrorKind::OooMutation,
            format!("expected mutation {}, got {}", expected, mutation.id),
        ))),
    }
}

#[async_trait]
impl<S: MutationStore> PushService for PushProcessor<S> {
    async fn push(&self, request: PushRequest) -> PushResponse {
        tracing::debug!(
            client_group_id = %request.client_group_id,
            request_id = %request.request_id,
            mutations = request.mutations.len(),
            "processing push"
        );
        self.process(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::registry::Param;
    use crate::push::store::{MemoryMutationStore, MemoryTx};
    use futures::future::BoxFuture;
    use serde_json::json;
    use tributary_engine::MutationType;

    fn fails(_tx: &mut MemoryTx, _args: Vec<Value>) -> BoxFuture<'_, Result<Value, MutatorError>> {
        Box::pin(async { Err(MutatorError::Failed("room is archived".into())) })
    }

    fn noop(_tx: &mut MemoryTx, args: Vec<Value>) -> BoxFuture<'_, Result<Value, MutatorError>> {
        Box::pin(async move { Ok(args.into_iter().next().unwrap_or(Value::Null)) })
    }

    fn processor(store: &MemoryMutationStore) -> PushProcessor<MemoryMutationStore> {
        let mut registry = MutatorRegistry::new();
        registry.register("rooms", "touch", vec![Param::mutation_id()], noop).unwrap();
        registry.register("rooms", "archive", vec![], fails).unwrap();
        PushProcessor::new(store.clone(), registry)
    }

    fn push(ids: &[(u64, &str)]) -> PushRequest {
        PushRequest {
            client_group_id: "g".into(),
            push_version: 1,
            request_id: "r".into(),
            mutations: ids
                .iter()
                .map(|(id, name)| Mutation {
                    kind: MutationType::Custom,
                    id: *id,
                    client_id: "c".into(),
                    name: (*name).into(),
                    args: vec![],
                    timestamp: 0,
                })
                .collect(),
        }
    }

    fn kinds(response: &PushResponse) -> Vec<Option<MutationErrorKind>> {
        response.mutations.iter().map(|m| m.result.error_kind()).collect()
    }

    #[tokio::test]
    async fn replay_next_and_gap() {
        let store = MemoryMutationStore::new();
        store.set_counter("g", "c", 5).await;
        let processor = processor(&store);

        let response = processor
            .process(&push(&[(5, "rooms|touch"), (6, "rooms|touch"), (8, "rooms|touch"), (9, "rooms|touch")]))
            .await;

        assert_eq!(
            kinds(&response),
            vec![
                Some(MutationErrorKind::AlreadyProcessed),
                None,
                Some(MutationErrorKind::OooMutation)
            ]
        );
        assert_eq!(response.mutations[1].result, MutationResult::ok(json!(6)));
        assert_eq!(store.counter("g", "c").await, 6);
        // replays and gaps leave no result record
        let recorded: Vec<u64> = store.results().await.iter().map(|r| r.mutation_id).collect();
        assert_eq!(recorded, vec![6]);
    }

    #[tokio::test]
    async fn handler_failure_still_advances_counter() {
        let store = MemoryMutationStore::new();
        let processor = processor(&store);

        let response = processor
            .process(&push(&[(1, "rooms|archive"), (2, "rooms|nope"), (3, "rooms|touch")]))
            .await;
        assert_eq!(
            kinds(&response),
            vec![Some(MutationErrorKind::App), Some(MutationErrorKind::App), None]
        );
        assert_eq!(store.counter("g", "c").await, 3);
        assert_eq!(store.results().await.len(), 3);

        let again = processor.process(&push(&[(1, "rooms|archive")])).await;
        assert_eq!(kinds(&again), vec![Some(MutationErrorKind::AlreadyProcessed)]);
    }

    #[tokio::test]
    async fn storage_failure_is_internal_and_stops_batch() {
        let store = MemoryMutationStore::new();
        let processor = processor(&store);
        store.set_unavailable(true);

        let response = processor.process(&push(&[(1, "rooms|touch"), (2, "rooms|touch")])).await;
        assert_eq!(kinds(&response), vec![Some(MutationErrorKind::Internal)]);

        store.set_unavailable(false);
        assert_eq!(store.counter("g", "c").await, 0);
    }

    #[tokio::test]
    async fn check_and_advance_is_separate_from_dispatch() {
        let store = MemoryMutationStore::new();
        let processor = processor(&store);
        let request = push(&[(1, "rooms|archive")]);
        let mutation = &request.mutations[0];

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            processor.check_and_advance(&mut tx, "g", mutation).await.unwrap(),
            CounterCheck::Advanced
        );
        assert_eq!(
            processor.check_and_advance(&mut tx, "g", mutation).await.unwrap(),
            CounterCheck::AlreadyProcessed { last: 1 }
        );
        assert!(processor.dispatch(&mut tx, "g", mutation).await.is_err());
        store.rollback(tx).await.unwrap();
        assert_eq!(store.counter("g", "c").await, 0);
    }
}
