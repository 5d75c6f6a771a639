//! History reader: keyset-paginated listing of one owner's uploads.
use tracing::{debug, instrument};

use crate::db::{self, Pool};
use crate::error::PipelineError;
use crate::model::Page;

#[derive(Clone)]
pub struct HistoryReader {
    pool: Pool,
    max_page_size: i64,
}

impl HistoryReader {
    pub fn new(pool: Pool, max_page_size: i64) -> Self {
        Self {
            pool,
            max_page_size,
        }
    }

    /// Rows of `owner_id` with `id > last_id`, ascending, at most `limit`.
    /// `total_records` counts every row of the owner, not just this page.
    #[instrument(skip(self))]
    pub async fn get_page(
        &self,
        owner_id: i64,
        last_id: i64,
        limit: i64,
    ) -> Result<Page, PipelineError> {
        let total_records = db::count_by_owner(&self.pool, owner_id)
            .await
            .map_err(PipelineError::Persistence)?;
        let files = db::select_page(&self.pool, owner_id, last_id, limit)
            .await
            .map_err(PipelineError::Persistence)?;
        debug!(returned = files.len(), total_records, "history page loaded");
        Ok(Page {
            files,
            total_records,
        })
    }

    /// Boundary entry point: validates the cursor and page size first.
    pub async fn list_page(
        &self,
        owner_id: i64,
        last_id: i64,
        limit: i64,
    ) -> Result<Page, PipelineError> {
        if last_id < 0 {
            return Err(PipelineError::validation("lastID must be >= 0"));
        }
        if limit <= 0 || limit > self.max_page_size {
            return Err(PipelineError::validation(format!(
                "limit must be between 1 and {}",
                self.max_page_size
            )));
        }
        self.get_page(owner_id, last_id, limit).await
    }
}
