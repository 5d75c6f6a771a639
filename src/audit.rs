//! Finding uploads whose notification never went out.
//!
//! A row stays `email_sent = 0` when its publish failed after the insert, when
//! the mailer failed, or when the event was lost with a crashed consumer. None
//! of these are retried automatically; this is the manual way back.
use chrono::{Duration, Utc};
use tracing::{info, instrument, warn};

use crate::db::{self, Pool, UndeliveredUpload};
use crate::error::PipelineError;
use crate::ingest::IngestionService;

/// Undelivered rows created more than `older_than` ago, oldest first.
#[instrument(skip(pool))]
pub async fn stale_undelivered(
    pool: &Pool,
    older_than: Duration,
    limit: i64,
) -> Result<Vec<UndeliveredUpload>, PipelineError> {
    if limit <= 0 {
        return Err(PipelineError::validation("limit must be positive"));
    }
    let before = Utc::now() - older_than;
    let rows = db::list_stale_undelivered(pool, before, limit)
        .await
        .map_err(PipelineError::Persistence)?;
    info!(found = rows.len(), %before, "stale undelivered uploads");
    Ok(rows)
}

/// Queue fresh events for `rows`. Returns how many were published; rows that
/// fail are logged and skipped.
pub async fn republish_all(ingestion: &IngestionService, rows: &[UndeliveredUpload]) -> usize {
    let mut published = 0;
    for row in rows {
        match ingestion.republish(row.id).await {
            Ok(true) => published += 1,
            Ok(false) => {}
            Err(err) => warn!(file_id = row.id, error = %err, "republish failed"),
        }
    }
    published
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewUpload;

    #[tokio::test]
    async fn only_old_undelivered_rows_are_stale() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        for name in ["a.txt", "b.txt"] {
            db::insert_uploaded_file(
                &pool,
                NewUpload {
                    owner_id: 7,
                    email_recipient: "a@b.com".into(),
                    name: name.into(),
                    size: 1,
                    content: vec![1],
                },
            )
            .await
            .unwrap();
        }
        db::mark_email_sent(&pool, 2, 7, Utc::now()).await.unwrap();

        let recent = stale_undelivered(&pool, Duration::hours(1), 10).await.unwrap();
        assert!(recent.is_empty());

        let stale = stale_undelivered(&pool, Duration::seconds(-5), 10)
            .await
            .unwrap();
        assert_eq!(stale.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1]);

        assert!(stale_undelivered(&pool, Duration::zero(), 0)
            .await
            .unwrap_err()
            .is_validation());
    }
}
