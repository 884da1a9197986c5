//! Mutation counters, results and the document store.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tributary_engine::{Document, MutationResult};

use super::changes::CHANGE_LOG_LOCK;
use crate::error::StoreError;
use crate::push::{DocumentChange, DocumentTx, MutationStore};

pub type PgTx = Transaction<'static, Postgres>;

#[derive(Debug, Clone)]
pub struct PgMutationStore {
    pool: PgPool,
}

impl PgMutationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_db_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::Corrupt(format!("mutation id {id} out of range")))
}

#[async_trait]
impl MutationStore for PgMutationStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: PgTx) -> Result<(), StoreError> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: PgTx) -> Result<(), StoreError> {
        Ok(tx.rollback().await?)
    }

    async fn last_mutation_id(
        &self,
        tx: &mut PgTx,
        client_group_id: &str,
        client_id: &str,
    ) -> Result<u64, StoreError> {
        // make sure there is a row to lock
        sqlx::query(
            r#"
            INSERT INTO client_mutations (client_group_id, client_id, last_mutation_id)
            VALUES ($1, $2, 0)
            ON CONFLICT (client_group_id, client_id) DO NOTHING
            "#,
        )
        .bind(client_group_id)
        .bind(client_id)
        .execute(&mut **tx)
        .await?;

        let last = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT last_mutation_id FROM client_mutations
            WHERE client_group_id = $1 AND client_id = $2
            FOR UPDATE
            "#,
        )
        .bind(client_group_id)
        .bind(client_id)
        .fetch_one(&mut **tx)
        .await?;

        u64::try_from(last).map_err(|_| StoreError::Corrupt(format!("negative mutation id {last}")))
    }

    async fn set_last_mutation_id(
        &self,
        tx: &mut PgTx,
        client_group_id: &str,
        client_id: &str,
        mutation_id: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE client_mutations SET last_mutation_id = $3
            WHERE client_group_id = $1 AND client_id = $2
            "#,
        )
        .bind(client_group_id)
        .bind(client_id)
        .bind(to_db_id(mutation_id)?)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn record_result(
        &self,
        tx: &mut PgTx,
        client_group_id: &str,
        client_id: &str,
        mutation_id: u64,
        result: &MutationResult,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO mutation_results (client_group_id, client_id, mutation_id, result)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (client_group_id, client_id, mutation_id) DO UPDATE SET
                result = EXCLUDED.result,
                created_at = NOW()
            "#,
        )
        .bind(client_group_id)
        .bind(client_id)
        .bind(to_db_id(mutation_id)?)
        .bind(Json(result))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DocumentTx for PgTx {
    async fn load_document(&mut self, collection: &str, doc_id: &str) -> Result<Option<Document>, StoreError> {
        let doc = sqlx::query_scalar::<_, Json<Document>>(
            "SELECT doc FROM documents WHERE collection = $1 AND doc_id = $2 FOR UPDATE",
        )
        .bind(collection)
        .bind(doc_id)
        .fetch_optional(&mut **self)
        .await?;

        Ok(doc.map(|Json(doc)| doc))
    }

    async fn save_document(&mut self, collection: &str, doc_id: &str, document: &Document) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, doc_id, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, doc_id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(collection)
        .bind(doc_id)
        .bind(Json(document))
        .execute(&mut **self)
        .await?;

        Ok(())
    }

    async fn delete_document(&mut self, collection: &str, doc_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND doc_id = $2")
            .bind(collection)
            .bind(doc_id)
            .execute(&mut **self)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_change(&mut self, change: &DocumentChange) -> Result<(), StoreError> {
        // ids are drawn under the lock, so they follow commit order
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CHANGE_LOG_LOCK)
            .execute(&mut **self)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO change_log (collection, op_type, document_key, old_doc, new_doc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&change.collection)
        .bind(change.kind.as_str())
        .bind(Json(&change.key))
        .bind(change.before.as_ref().map(Json))
        .bind(change.after.as_ref().map(Json))
        .execute(&mut **self)
        .await?;

        Ok(())
    }
}
