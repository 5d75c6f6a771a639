//! Ingestion service: the producer half of the pipeline.
//!
//! `create` validates, inserts the row, then publishes its event. The insert is
//! the durability point and is never rolled back: a failed or cancelled publish
//! leaves an `email_sent = 0` row with no queued event.
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::channel::{ChannelError, EventChannel};
use crate::db::{self, Pool};
use crate::error::PipelineError;
use crate::model::{DeliveryEvent, NewUpload, UploadedFile};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
        .expect("valid email regex")
});

pub fn is_valid_email(address: &str) -> bool {
    address.len() <= 254 && EMAIL_RE.is_match(address)
}

/// Reject malformed uploads before anything is written.
pub fn validate_upload(upload: &NewUpload) -> Result<(), PipelineError> {
    if upload.owner_id <= 0 {
        return Err(PipelineError::validation("owner id must be positive"));
    }
    if !is_valid_email(upload.email_recipient.trim()) {
        return Err(PipelineError::validation(format!(
            "invalid email recipient {:?}",
            upload.email_recipient
        )));
    }
    if upload.name.trim().is_empty() {
        return Err(PipelineError::validation("file name must be non-empty"));
    }
    if upload.content.is_empty() {
        return Err(PipelineError::validation("file content must be non-empty"));
    }
    if upload.size < 0 {
        return Err(PipelineError::validation("file size must be non-negative"));
    }
    Ok(())
}

#[derive(Clone)]
pub struct IngestionService {
    pool: Pool,
    channel: Arc<dyn EventChannel>,
    publish_timeout: Duration,
}

impl IngestionService {
    pub fn new(pool: Pool, channel: Arc<dyn EventChannel>, publish_timeout: Duration) -> Self {
        Self {
            pool,
            channel,
            publish_timeout,
        }
    }

    /// Record an upload and queue its notification. Dropping the returned
    /// future cancels the publish but never the insert once it has completed.
    #[instrument(skip_all, fields(owner_id = upload.owner_id))]
    pub async fn create(&self, mut upload: NewUpload) -> Result<UploadedFile, PipelineError> {
        validate_upload(&upload)?;
        upload.email_recipient = upload.email_recipient.trim().to_string();

        let file = db::insert_uploaded_file(&self.pool, upload)
            .await
            .map_err(PipelineError::Persistence)?;
        info!(file_id = file.id, size = file.size, "upload recorded");

        self.publish(&file).await?;
        Ok(file)
    }

    /// Publish the delivery event for an already stored row.
    #[instrument(skip_all, fields(file_id = file.id))]
    pub async fn publish(&self, file: &UploadedFile) -> Result<(), PipelineError> {
        let event = DeliveryEvent::from_file(file);
        let result = tokio::time::timeout(self.publish_timeout, self.channel.publish(&event))
            .await
            .unwrap_or(Err(ChannelError::Timeout(self.publish_timeout)));

        match result {
            Ok(()) => {
                info!("delivery event published");
                Ok(())
            }
            Err(source) => {
                error!(error = %source, "failed to publish delivery event; upload stays undelivered");
                Err(PipelineError::Publish {
                    file_id: file.id,
                    source,
                })
            }
        }
    }

    /// Queue a fresh event for a stored row that never got its notification.
    /// Returns `false` without publishing when the row is already delivered.
    #[instrument(skip(self))]
    pub async fn republish(&self, id: i64) -> Result<bool, PipelineError> {
        let file = db::find_uploaded_file(&self.pool, id)
            .await
            .map_err(PipelineError::Persistence)?
            .ok_or_else(|| PipelineError::validation(format!("no upload with id {id}")))?;
        if file.email_sent {
            warn!("upload already delivered; not republishing");
            return Ok(false);
        }
        self.publish(&file).await?;
        Ok(true)
    }
}
