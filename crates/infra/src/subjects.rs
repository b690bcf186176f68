use moderation_domain::DomainResult;
use moderation_domain::classifier::SubjectFeatures;
use moderation_domain::error::DomainError;
use moderation_domain::ports::BoxFuture;
use moderation_domain::ports::subjects::SubjectDirectory;
use sqlx::FromRow;
use sqlx::postgres::PgPool;

use crate::store::map_sqlx_error;

#[derive(Debug, FromRow)]
struct PredictionRow {
    seller_id: i64,
    is_verified_seller: bool,
    item_id: i64,
    name: String,
    description: String,
    category: i32,
    images_qty: i32,
}

impl From<PredictionRow> for SubjectFeatures {
    fn from(row: PredictionRow) -> Self {
        Self {
            owner_id: row.seller_id,
            is_verified_owner: row.is_verified_seller,
            subject_id: row.item_id,
            name: row.name,
            description: row.description,
            category: row.category,
            images_qty: row.images_qty,
        }
    }
}

/// Reads listings (`ads`) and their sellers for prediction input and owner fan-out.
#[derive(Clone)]
pub struct PgSubjectDirectory {
    pool: PgPool,
}

impl PgSubjectDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl SubjectDirectory for PgSubjectDirectory {
    fn prediction_input(&self, subject_id: i64) -> BoxFuture<'_, DomainResult<SubjectFeatures>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, PredictionRow>(
                "SELECT s.seller_id::BIGINT AS seller_id, \
                        s.is_verified AS is_verified_seller, \
                        a.item_id::BIGINT AS item_id, \
                        a.name, \
                        COALESCE(a.description, '') AS description, \
                        a.category::INTEGER AS category, \
                        a.images_qty::INTEGER AS images_qty \
                 FROM ads a \
                 JOIN sellers s ON a.seller_id = s.seller_id AND a.is_closed = FALSE \
                 WHERE a.item_id = $1 \
                 LIMIT 1",
            )
            .bind(subject_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            row.map(SubjectFeatures::from)
                .ok_or_else(|| DomainError::not_found(format!("item {subject_id}")))
        })
    }

    fn active_subjects_by_owner(&self, owner_id: i64) -> BoxFuture<'_, DomainResult<Vec<i64>>> {
        Box::pin(async move {
            sqlx::query_scalar::<_, i64>(
                "SELECT item_id::BIGINT FROM ads \
                 WHERE seller_id = $1 AND is_closed = FALSE \
                 ORDER BY item_id",
            )
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)
        })
    }
}
