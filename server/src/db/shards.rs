//! Shard state persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tributary_engine::Watermark;

use crate::error::StoreError;
use crate::gateway::{ShardState, ShardStateStore};

#[derive(Debug, Clone)]
pub struct PgShardStateStore {
    pool: PgPool,
}

impl PgShardStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn watermark(raw: Option<String>) -> Result<Option<Watermark>, StoreError> {
    raw.map(|raw| Watermark::parse(&raw).map_err(|e| StoreError::Corrupt(e.to_string())))
        .transpose()
}

fn shard_from_row(row: &sqlx::postgres::PgRow) -> Result<ShardState, StoreError> {
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    Ok(ShardState {
        shard_id: row.try_get("shard_id")?,
        last_watermark: watermark(row.try_get("last_watermark")?)?,
        last_acknowledged_watermark: watermark(row.try_get("last_acknowledged_watermark")?)?,
        updated_at,
    })
}

#[async_trait]
impl ShardStateStore for PgShardStateStore {
    async fn upsert(&self, shard_id: &str) -> Result<ShardState, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO shard_state (shard_id, updated_at)
            VALUES ($1, NOW())
            ON CONFLICT (shard_id) DO UPDATE SET updated_at = NOW()
            RETURNING shard_id, last_watermark, last_acknowledged_watermark, updated_at
            "#,
        )
        .bind(shard_id)
        .fetch_one(&self.pool)
        .await?;

        shard_from_row(&row)
    }

    async fn get(&self, shard_id: &str) -> Result<Option<ShardState>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT shard_id, last_watermark, last_acknowledged_watermark, updated_at
            FROM shard_state
            WHERE shard_id = $1
            "#,
        )
        .bind(shard_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(shard_from_row).transpose()
    }

    async fn set_last_watermark(&self, shard_id: &str, watermark: &Watermark) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO shard_state (shard_id, last_watermark, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (shard_id) DO UPDATE SET
                last_watermark = EXCLUDED.last_watermark,
                updated_at = NOW()
            "#,
        )
        .bind(shard_id)
        .bind(watermark.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_acknowledged(&self, shard_id: &str, watermark: &Watermark) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO shard_state (shard_id, last_acknowledged_watermark, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (shard_id) DO UPDATE SET
                last_acknowledged_watermark = EXCLUDED.last_acknowledged_watermark,
                updated_at = NOW()
            "#,
        )
        .bind(shard_id)
        .bind(watermark.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
