//! Postgres-backed `moderation_results` table.
//!
//! Expected shape (provisioned outside this service):
//!
//! ```sql
//! CREATE TABLE moderation_results (
//!     id            SERIAL PRIMARY KEY,
//!     item_id       INTEGER NOT NULL,
//!     status        VARCHAR(20) NOT NULL,
//!     is_violation  BOOLEAN,
//!     probability   DOUBLE PRECISION,
//!     error_message TEXT,
//!     created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     processed_at  TIMESTAMPTZ
//! );
//! ```

use moderation_domain::DomainResult;
use moderation_domain::error::DomainError;
use moderation_domain::moderation::{
    ModerationStatus, ModerationTask, NewModerationTask, TaskChanges,
};
use moderation_domain::ports::BoxFuture;
use moderation_domain::ports::store::ModerationStore;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Error as SqlxError, FromRow};
use time::OffsetDateTime;

use crate::config::AppConfig;

const FOREIGN_KEY_VIOLATION: &str = "23503";

const COLUMNS: &str = "id::BIGINT AS id, item_id::BIGINT AS item_id, status, is_violation, \
     probability::DOUBLE PRECISION AS probability, error_message, created_at, processed_at";

pub async fn connect_pool(config: &AppConfig) -> DomainResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(map_sqlx_error)
}

/// Connectivity problems are worth retrying; a missing parent row means the subject
/// is gone; everything else is a bug or a schema mismatch.
pub(crate) fn map_sqlx_error(err: SqlxError) -> DomainError {
    match &err {
        SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => {
            DomainError::Transient(err.to_string())
        }
        SqlxError::Database(db) if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
            DomainError::not_found(db.message().to_string())
        }
        _ => DomainError::Unexpected(err.to_string()),
    }
}

#[derive(Debug, FromRow)]
struct ModerationRow {
    id: i64,
    item_id: i64,
    status: String,
    is_violation: Option<bool>,
    probability: Option<f64>,
    error_message: Option<String>,
    created_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
}

impl TryFrom<ModerationRow> for ModerationTask {
    type Error = DomainError;

    fn try_from(row: ModerationRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<ModerationStatus>().map_err(|_| {
            DomainError::Unexpected(format!(
                "moderation task {} has unknown status '{}'",
                row.id, row.status
            ))
        })?;
        Ok(Self {
            task_id: row.id,
            subject_id: row.item_id,
            status,
            is_violation: row.is_violation,
            probability: row.probability,
            error_message: row.error_message,
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

fn into_tasks(rows: Vec<ModerationRow>) -> DomainResult<Vec<ModerationTask>> {
    rows.into_iter().map(ModerationTask::try_from).collect()
}

fn into_task(row: Option<ModerationRow>) -> DomainResult<Option<ModerationTask>> {
    row.map(ModerationTask::try_from).transpose()
}

#[derive(Clone)]
pub struct PgModerationStore {
    pool: PgPool,
}

impl PgModerationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn latest_matching(
        &self,
        subject_id: i64,
        completed_only: bool,
    ) -> DomainResult<Option<ModerationTask>> {
        let query = format!(
            "SELECT {COLUMNS} FROM moderation_results \
             WHERE item_id = $1 AND processed_at IS NOT NULL \
             AND ($2 = FALSE OR status = 'completed') \
             ORDER BY processed_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, ModerationRow>(&query)
            .bind(subject_id)
            .bind(completed_only)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        into_task(row)
    }
}

impl ModerationStore for PgModerationStore {
    fn insert(&self, task: &NewModerationTask) -> BoxFuture<'_, DomainResult<ModerationTask>> {
        let task = task.clone();
        Box::pin(async move {
            let query = format!(
                "INSERT INTO moderation_results \
                 (item_id, status, is_violation, probability, error_message) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING {COLUMNS}"
            );
            let row = sqlx::query_as::<_, ModerationRow>(&query)
                .bind(task.subject_id)
                .bind(task.status.as_str())
                .bind(task.is_violation)
                .bind(task.probability)
                .bind(task.error_message)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            ModerationTask::try_from(row)
        })
    }

    fn insert_if_absent(&self, task: &NewModerationTask) -> BoxFuture<'_, DomainResult<bool>> {
        let task = task.clone();
        Box::pin(async move {
            let result = sqlx::query(
                "INSERT INTO moderation_results \
                 (item_id, status, is_violation, probability, error_message) \
                 SELECT $1, $2, $3, $4, $5 \
                 WHERE NOT EXISTS ( \
                     SELECT 1 FROM moderation_results WHERE item_id = $1 AND status = $2 \
                 )",
            )
            .bind(task.subject_id)
            .bind(task.status.as_str())
            .bind(task.is_violation)
            .bind(task.probability)
            .bind(task.error_message)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn get(&self, task_id: i64) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>> {
        Box::pin(async move {
            let query = format!("SELECT {COLUMNS} FROM moderation_results WHERE id = $1");
            let row = sqlx::query_as::<_, ModerationRow>(&query)
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            into_task(row)
        })
    }

    fn get_many(&self, task_ids: &[i64]) -> BoxFuture<'_, DomainResult<Vec<ModerationTask>>> {
        let task_ids = task_ids.to_vec();
        Box::pin(async move {
            if task_ids.is_empty() {
                return Ok(Vec::new());
            }
            let query = format!(
                "SELECT {COLUMNS} FROM moderation_results WHERE id = ANY($1) \
                 ORDER BY array_position($1, id::BIGINT)"
            );
            let rows = sqlx::query_as::<_, ModerationRow>(&query)
                .bind(&task_ids)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            into_tasks(rows)
        })
    }

    fn list_recent(&self, limit: usize) -> BoxFuture<'_, DomainResult<Vec<ModerationTask>>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {COLUMNS} FROM moderation_results \
                 ORDER BY created_at DESC, id DESC LIMIT $1"
            );
            let rows = sqlx::query_as::<_, ModerationRow>(&query)
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            into_tasks(rows)
        })
    }

    fn latest_by_subject(
        &self,
        subject_id: i64,
    ) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>> {
        Box::pin(self.latest_matching(subject_id, false))
    }

    fn latest_completed_by_subject(
        &self,
        subject_id: i64,
    ) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>> {
        Box::pin(self.latest_matching(subject_id, true))
    }

    fn update(
        &self,
        task_id: i64,
        changes: &TaskChanges,
    ) -> BoxFuture<'_, DomainResult<ModerationTask>> {
        let changes = changes.clone();
        Box::pin(async move {
            let query = format!(
                "UPDATE moderation_results \
                 SET status = $2, is_violation = $3, probability = $4, \
                     error_message = $5, processed_at = $6 \
                 WHERE id = $1 RETURNING {COLUMNS}"
            );
            let row = sqlx::query_as::<_, ModerationRow>(&query)
                .bind(task_id)
                .bind(changes.status.as_str())
                .bind(changes.is_violation)
                .bind(changes.probability)
                .bind(changes.error_message)
                .bind(changes.processed_at)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            into_task(row)?.ok_or_else(|| DomainError::task_not_found(task_id))
        })
    }

    fn delete(&self, task_id: i64) -> BoxFuture<'_, DomainResult<Option<ModerationTask>>> {
        Box::pin(async move {
            let query = format!("DELETE FROM moderation_results WHERE id = $1 RETURNING {COLUMNS}");
            let row = sqlx::query_as::<_, ModerationRow>(&query)
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            into_task(row)
        })
    }

    fn delete_by_subject(
        &self,
        subject_id: i64,
    ) -> BoxFuture<'_, DomainResult<Vec<ModerationTask>>> {
        Box::pin(async move {
            let query =
                format!("DELETE FROM moderation_results WHERE item_id = $1 RETURNING {COLUMNS}");
            let rows = sqlx::query_as::<_, ModerationRow>(&query)
                .bind(subject_id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            into_tasks(rows)
        })
    }
}
