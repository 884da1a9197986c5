//! Built-in `documents` mutators.
//!
//! They write the document store and append to the change log inside the
//! mutation's transaction, so a committed mutation shows up on the change
//! stream and a rolled back one never does.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tributary_engine::{ChangeEvent, ChangeKind, Document, Namespace};

use super::registry::{MutatorError, MutatorRegistry, Param, RegistryError};
use crate::error::StoreError;

pub const NAMESPACE: &str = "documents";

/// One change-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub collection: String,
    pub kind: ChangeKind,
    pub key: Document,
    pub before: Option<Document>,
    pub after: Option<Document>,
}

impl DocumentChange {
    /// The change as an upstream event of `database`.
    pub fn into_event(self, database: &str) -> ChangeEvent {
        let namespace = Namespace::new(database, self.collection);
        let mut event = match (self.kind, self.after) {
            (ChangeKind::Insert, Some(after)) => ChangeEvent::insert(namespace, after),
            (ChangeKind::Update, Some(after)) => ChangeEvent::update(namespace, self.before.clone(), after),
            (ChangeKind::Replace, Some(after)) => ChangeEvent::replace(namespace, self.before.clone(), after),
            (ChangeKind::Drop, _) => ChangeEvent::drop(namespace),
            _ => ChangeEvent::delete(namespace, self.key.clone()),
        };
        if event.before.is_none() {
            event.before = self.before;
        }
        if event.document_key.is_none() && event.kind != ChangeKind::Drop {
            event.document_key = Some(self.key);
        }
        event
    }
}

/// Document access inside a mutation transaction.
#[async_trait]
pub trait DocumentTx: Send {
    async fn load_document(&mut self, collection: &str, doc_id: &str) -> Result<Option<Document>, StoreError>;

    async fn save_document(&mut self, collection: &str, doc_id: &str, document: &Document) -> Result<(), StoreError>;

    /// Whether a document was removed.
    async fn delete_document(&mut self, collection: &str, doc_id: &str) -> Result<bool, StoreError>;

    async fn append_change(&mut self, change: &DocumentChange) -> Result<(), StoreError>;
}

/// Storage key of a document id: its canonical JSON text.
pub fn doc_id(id: &Value) -> String {
    id.to_string()
}

/// Register `documents|insert`, `update`, `replace` and `delete`.
pub fn register<Tx: DocumentTx + 'static>(registry: &mut MutatorRegistry<Tx>) -> Result<(), RegistryError> {
    registry.register(NAMESPACE, "insert", vec![Param::arg(0)], insert::<Tx>)?;
    registry.register(NAMESPACE, "update", vec![Param::arg(0)], update::<Tx>)?;
    registry.register(NAMESPACE, "replace", vec![Param::arg(0)], replace::<Tx>)?;
    registry.register(NAMESPACE, "delete", vec![Param::arg(0)], delete::<Tx>)?;
    Ok(())
}

#[derive(Deserialize)]
struct InsertArgs {
    collection: String,
    document: Document,
}

#[derive(Deserialize)]
struct UpdateArgs {
    collection: String,
    id: Value,
    set: Document,
}

#[derive(Deserialize)]
struct ReplaceArgs {
    collection: String,
    id: Value,
    document: Document,
}

#[derive(Deserialize)]
struct DeleteArgs {
    collection: String,
    id: Value,
}

fn parse<T: DeserializeOwned>(args: Vec<Value>) -> Result<T, MutatorError> {
    let arg = args
        .into_iter()
        .next()
        .ok_or_else(|| MutatorError::InvalidArgs("expected one argument".into()))?;
    serde_json::from_value(arg).map_err(|e| MutatorError::InvalidArgs(e.to_string()))
}

fn key(id: &Value) -> Document {
    let mut key = Document::new();
    key.insert("_id".into(), id.clone());
    key
}

fn check_id(document: &Document, id: &Value) -> Result<(), MutatorError> {
    match document.get("_id") {
        Some(other) if other != id => Err(MutatorError::InvalidArgs(format!(
            "_id {other} does not match {id}"
        ))),
        _ => Ok(()),
    }
}

async fn load_existing<Tx: DocumentTx>(tx: &mut Tx, collection: &str, id: &Value) -> Result<Document, MutatorError> {
    tx.load_document(collection, &doc_id(id))
        .await?
        .ok_or_else(|| MutatorError::Failed(format!("document {id} not found in {collection}")))
}

fn insert<Tx: DocumentTx>(tx: &mut Tx, args: Vec<Value>) -> BoxFuture<'_, Result<Value, MutatorError>> {
    Box::pin(async move {
        let InsertArgs { collection, mut document } = parse(args)?;
        let id = document
            .entry("_id")
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()))
            .clone();

        let stored_id = doc_id(&id);
        if tx.load_document(&collection, &stored_id).await?.is_some() {
            return Err(MutatorError::Failed(format!(
                "document {id} already exists in {collection}"
            )));
        }
        tx.save_document(&collection, &stored_id, &document).await?;
        tx.append_change(&DocumentChange {
            collection,
            kind: ChangeKind::Insert,
            key: key(&id),
            before: None,
            after: Some(document),
        })
        .await?;
        Ok(json!({ "_id": id }))
    })
}

fn update<Tx: DocumentTx>(tx: &mut Tx, args: Vec<Value>) -> BoxFuture<'_, Result<Value, MutatorError>> {
    Box::pin(async move {
        let UpdateArgs { collection, id, set } = parse(args)?;
        check_id(&set, &id)?;
        let before = load_existing(tx, &collection, &id).await?;

        let mut after = before.clone();
        after.extend(set);
        tx.save_document(&collection, &doc_id(&id), &after).await?;
        tx.append_change(&DocumentChange {
            collection,
            kind: ChangeKind::Update,
            key: key(&id),
            before: Some(before),
            after: Some(after),
        })
        .await?;
        Ok(json!({ "_id": id }))
    })
}

fn replace<Tx: DocumentTx>(tx: &mut Tx, args: Vec<Value>) -> BoxFuture<'_, Result<Value, MutatorError>> {
    Box::pin(async move {
        let ReplaceArgs {
            collection,
            id,
            mut document,
        } = parse(args)?;
        check_id(&document, &id)?;
        let before = load_existing(tx, &collection, &id).await?;

        document.insert("_id".into(), id.clone());
        tx.save_document(&collection, &doc_id(&id), &document).await?;
        tx.append_change(&DocumentChange {
            collection,
            kind: ChangeKind::Replace,
            key: key(&id),
            before: Some(before),
            after: Some(document),
        })
        .await?;
        Ok(json!({ "_id": id }))
    })
}

fn delete<Tx: DocumentTx>(tx: &mut Tx, args: Vec<Value>) -> BoxFuture<'_, Result<Value, MutatorError>> {
    Box::pin(async move {
        let DeleteArgs { collection, id } = parse(args)?;
        let before = load_existing(tx, &collection, &id).await?;

        tx.delete_document(&collection, &doc_id(&id)).await?;
        tx.append_change(&DocumentChange {
            collection,
            kind: ChangeKind::Delete,
            key: key(&id),
            before: Some(before),
            after: None,
        })
        .await?;
        Ok(Value::Null)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::registry::MutationContext;
    use crate::push::store::{MemoryMutationStore, MemoryTx, MutationStore};
    use tributary_engine::{Mutation, MutationType};

    fn registry() -> MutatorRegistry<MemoryTx> {
        let mut registry = MutatorRegistry::new();
        register(&mut registry).unwrap();
        registry
    }

    async fn run(
        registry: &MutatorRegistry<MemoryTx>,
        store: &MemoryMutationStore,
        name: &str,
        arg: Value,
    ) -> Result<Value, MutatorError> {
        let mutation = Mutation {
            kind: MutationType::Custom,
            id: 1,
            client_id: "c".into(),
            name: format!("documents|{name}"),
            args: vec![arg],
            timestamp: 0,
        };
        let mut tx = store.begin().await.unwrap();
        let out = registry
            .dispatch(&mut tx, &MutationContext { client_group_id: "g", mutation: &mutation })
            .await;
        if out.is_ok() {
            store.commit(tx).await.unwrap();
        }
        out
    }

    #[tokio::test]
    async fn document_lifecycle_logs_changes() {
        let registry = registry();
        let store = MemoryMutationStore::new();

        let out = run(&registry, &store, "insert", json!({"collection": "rooms", "document": {"_id": "r1", "t": "d"}}))
            .await
            .unwrap();
        assert_eq!(out, json!({"_id": "r1"}));

        run(&registry, &store, "update", json!({"collection": "rooms", "id": "r1", "set": {"name": "x"}}))
            .await
            .unwrap();
        let stored = store.document("rooms", "\"r1\"").await.unwrap();
        assert_eq!(Value::Object(stored), json!({"_id": "r1", "t": "d", "name": "x"}));

        run(&registry, &store, "replace", json!({"collection": "rooms", "id": "r1", "document": {"t": "p"}}))
            .await
            .unwrap();
        let stored = store.document("rooms", "\"r1\"").await.unwrap();
        assert_eq!(Value::Object(stored), json!({"_id": "r1", "t": "p"}));

        let out = run(&registry, &store, "delete", json!({"collection": "rooms", "id": "r1"}))
            .await
            .unwrap();
        assert_eq!(out, Value::Null);
        assert!(store.document("rooms", "\"r1\"").await.is_none());

        let kinds: Vec<ChangeKind> = store.changes().await.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Replace, ChangeKind::Delete]
        );
        let update = &store.changes().await[1];
        assert_eq!(update.before.as_ref().unwrap().get("name"), None);
    }

    #[tokio::test]
    async fn insert_generates_missing_ids() {
        let registry = registry();
        let store = MemoryMutationStore::new();
        let out = run(&registry, &store, "insert", json!({"collection": "rooms", "document": {"t": "d"}}))
            .await
            .unwrap();
        let id = out["_id"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn failures_leave_no_trace() {
        let registry = registry();
        let store = MemoryMutationStore::new();
        run(&registry, &store, "insert", json!({"collection": "rooms", "document": {"_id": 1}}))
            .await
            .unwrap();

        let dup = run(&registry, &store, "insert", json!({"collection": "rooms", "document": {"_id": 1}})).await;
        assert!(matches!(dup, Err(MutatorError::Failed(_))));

        let missing = run(&registry, &store, "update", json!({"collection": "rooms", "id": 2, "set": {}})).await;
        assert!(matches!(missing, Err(MutatorError::Failed(_))));

        let bad = run(&registry, &store, "delete", json!({"id": 1})).await;
        assert!(matches!(bad, Err(MutatorError::InvalidArgs(_))));

        let moved = run(&registry, &store, "replace", json!({"collection": "rooms", "id": 1, "document": {"_id": 5}})).await;
        assert!(matches!(moved, Err(MutatorError::InvalidArgs(_))));

        assert_eq!(store.changes().await.len(), 1);
    }

    #[test]
    fn changes_become_events() {
        let change = DocumentChange {
            collection: "rooms".into(),
            kind: ChangeKind::Delete,
            key: key(&json!("r1")),
            before: Some(key(&json!("r1"))),
            after: None,
        };
        let event = change.into_event("chat");
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.namespace.to_string(), "chat.rooms");
        assert_eq!(event.document_key, Some(key(&json!("r1"))));
        assert!(event.before.is_some());
    }
}
