//! Watermark mappings in `watermark_kv`.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::StoreError;
use crate::watermark::{WatermarkKey, WatermarkStore};

#[derive(Debug, Clone)]
pub struct PgWatermarkStore {
    pool: PgPool,
}

impl PgWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn get(&self, key: &WatermarkKey) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM watermark_kv WHERE kind = $1 AND shard_id = $2 AND key = $3",
        )
        .bind(key.kind())
        .bind(key.shard())
        .bind(key.key())
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn insert_if_absent(&self, key: &WatermarkKey, value: &str) -> Result<Option<String>, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO watermark_kv (kind, shard_id, key, value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (kind, shard_id, key) DO NOTHING
            "#,
        )
        .bind(key.kind())
        .bind(key.shard())
        .bind(key.key())
        .bind(value)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(None);
        }
        match self.get(key).await? {
            Some(existing) => Ok(Some(existing)),
            None => Err(StoreError::Corrupt(format!(
                "{} entry {}.{} vanished",
                key.kind(),
                key.shard(),
                key.key()
            ))),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &WatermarkKey,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO watermark_kv (kind, shard_id, key, value)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (kind, shard_id, key) DO NOTHING
                    "#,
                )
                .bind(key.kind())
                .bind(key.shard())
                .bind(key.key())
                .bind(new)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE watermark_kv SET value = $4
                    WHERE kind = $1 AND shard_id = $2 AND key = $3 AND value = $5
                    "#,
                )
                .bind(key.kind())
                .bind(key.shard())
                .bind(key.key())
                .bind(new)
                .bind(expected)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }
}
