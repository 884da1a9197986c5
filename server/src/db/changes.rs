//! Change source over the `change_log` table.
//!
//! The resume position of a change is its decimal row id. Cursors poll for
//! rows past their position and sleep for the poll interval when caught up.
//!
//! Writers hold [`CHANGE_LOG_LOCK`] from their first append until commit, so
//! ids become visible in increasing order: once a cursor has read id N, no
//! transaction can still commit a row below N.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tributary_engine::{ChangeEvent, ChangeKind, Document, ResumePosition};

use crate::push::DocumentChange;
use crate::source::{ChangeCursor, ChangeSource, SourceError};

/// Rows fetched per poll.
const BATCH_SIZE: i64 = 100;

/// Transaction-scoped advisory lock taken before appending to `change_log`.
pub(crate) const CHANGE_LOG_LOCK: i64 = 0x7472_6962_6c6f_67;

#[derive(Debug, Clone)]
pub struct PgChangeSource {
    pool: PgPool,
    database: String,
    poll_interval: Duration,
}

impl PgChangeSource {
    pub fn new(pool: PgPool, database: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            pool,
            database: database.into(),
            poll_interval,
        }
    }

    async fn max_id(&self) -> Result<i64, SourceError> {
        let max = sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(id), 0) FROM change_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }
}

fn parse_position(position: &ResumePosition) -> Result<i64, SourceError> {
    position
        .as_str()
        .parse::<i64>()
        .ok()
        .filter(|id| *id >= 0)
        .ok_or_else(|| SourceError::InvalidPosition(position.to_string()))
}

fn parse_kind(op_type: &str) -> Result<ChangeKind, SourceError> {
    match op_type {
        "insert" => Ok(ChangeKind::Insert),
        "update" => Ok(ChangeKind::Update),
        "replace" => Ok(ChangeKind::Replace),
        "delete" => Ok(ChangeKind::Delete),
        "drop" => Ok(ChangeKind::Drop),
        other => Err(SourceError::Decode(format!("unknown op_type '{other}'"))),
    }
}

#[async_trait]
impl ChangeSource for PgChangeSource {
    fn database(&self) -> &str {
        &self.database
    }

    async fn open(&self, resume: Option<ResumePosition>) -> Result<Box<dyn ChangeCursor>, SourceError> {
        let after = match resume {
            Some(position) => parse_position(&position)?,
            None => self.max_id().await?,
        };
        tracing::debug!(after, "change cursor opened");
        Ok(Box::new(PgCursor {
            pool: self.pool.clone(),
            database: self.database.clone(),
            poll_interval: self.poll_interval,
            fetched: after,
            returned: after,
            buffer: VecDeque::new(),
        }))
    }

    async fn current_position(&self) -> Result<ResumePosition, SourceError> {
        Ok(ResumePosition::new(self.max_id().await?.to_string()))
    }

    async fn snapshot(&self, collection: &str) -> Result<Vec<Document>, SourceError> {
        let docs = sqlx::query_scalar::<_, Json<Document>>(
            "SELECT doc FROM documents WHERE collection = $1 ORDER BY doc_id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        Ok(docs.into_iter().map(|Json(doc)| doc).collect())
    }
}

struct PgCursor {
    pool: PgPool,
    database: String,
    poll_interval: Duration,
    /// Highest row id read from the table.
    fetched: i64,
    /// Row id of the last change handed out.
    returned: i64,
    buffer: VecDeque<(i64, ChangeEvent)>,
}

impl PgCursor {
    async fn fetch(&mut self) -> Result<usize, SourceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, collection, op_type, document_key, old_doc, new_doc
            FROM change_log
            WHERE id > $1
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(self.fetched)
        .bind(BATCH_SIZE)
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let op_type: String = row.try_get("op_type")?;
            let key: Option<Json<Document>> = row.try_get("document_key")?;
            let before: Option<Json<Document>> = row.try_get("old_doc")?;
            let after: Option<Json<Document>> = row.try_get("new_doc")?;

            let change = DocumentChange {
                collection: row.try_get("collection")?,
                kind: parse_kind(&op_type)?,
                key: key.map(|Json(k)| k).unwrap_or_default(),
                before: before.map(|Json(d)| d),
                after: after.map(|Json(d)| d),
            };
            let event = change
                .into_event(&self.database)
                .at(ResumePosition::new(id.to_string()));
            self.buffer.push_back((id, event));
            self.fetched = id;
        }
        Ok(rows.len())
    }
}

#[async_trait]
impl ChangeCursor for PgCursor {
    async fn next(&mut self) -> Result<Option<ChangeEvent>, SourceError> {
        loop {
            if let Some((id, event)) = self.buffer.pop_front() {
                self.returned = id;
                return Ok(Some(event));
            }
            if self.fetch().await? == 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    fn position(&self) -> Option<ResumePosition> {
        Some(ResumePosition::new(self.returned.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_row_ids() {
        assert_eq!(parse_position(&ResumePosition::new("42")).unwrap(), 42);
        assert!(matches!(
            parse_position(&ResumePosition::new("-1")),
            Err(SourceError::InvalidPosition(_))
        ));
        assert!(matches!(
            parse_position(&ResumePosition::new("8263A1")),
            Err(SourceError::InvalidPosition(_))
        ));
    }

    #[test]
    fn op_types_map_to_kinds() {
        assert_eq!(parse_kind("replace").unwrap(), ChangeKind::Replace);
        assert!(matches!(parse_kind("truncate"), Err(SourceError::Decode(_))));
    }
}
