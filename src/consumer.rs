//! Notification consumer: turns queued "file created" events into emails and
//! records the delivery on the stored row.
//!
//! Messages are already acknowledged when they arrive here, so every failure
//! is logged and the message is dropped. Nothing is retried.
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::channel::Deliveries;
use crate::db::{self, Pool};
use crate::error::PipelineError;
use crate::mailer::{compose_notification, Mailer, MailerError};
use crate::model::DeliveryEvent;

/// What happened to one delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    Delivered { id: i64 },
    /// Email sent again for a row that was already marked. Status untouched.
    AlreadyDelivered { id: i64 },
    /// Email sent but no row matches the event's id and owner.
    RowMissing { id: i64 },
    DecodeFailed,
    DeliveryFailed { id: i64 },
    StatusWriteFailed { id: i64 },
}

#[derive(Clone)]
pub struct NotificationConsumer {
    pool: Pool,
    mailer: Arc<dyn Mailer>,
    subject: String,
    send_timeout: Option<Duration>,
}

impl NotificationConsumer {
    pub fn new(
        pool: Pool,
        mailer: Arc<dyn Mailer>,
        subject: impl Into<String>,
        send_timeout: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            mailer,
            subject: subject.into(),
            send_timeout,
        }
    }

    /// Handle one raw message body.
    #[instrument(skip_all, fields(bytes = body.len()))]
    pub async fn handle_delivery(&self, body: &[u8]) -> HandleOutcome {
        let event = match DeliveryEvent::from_json(body) {
            Ok(event) => event,
            Err(err) => {
                let err = PipelineError::Decode(err.to_string());
                error!(error = %err, "dropping undecodable message");
                return HandleOutcome::DecodeFailed;
            }
        };
        let (id, owner_id) = (event.id, event.owner_id);

        let (content, decode_err) = event.decode_content_lossy();
        if let Some(err) = decode_err {
            warn!(
                file_id = id,
                error = %err,
                recovered = content.len(),
                "invalid base64 content; attaching the bytes decoded before the error"
            );
        }
        let file = event.into_file(content);
        let email = compose_notification(&file, &self.subject);

        let sent = match self.send_timeout {
            Some(limit) => tokio::time::timeout(limit, self.mailer.send(&email))
                .await
                .unwrap_or(Err(MailerError::Timeout(limit))),
            None => self.mailer.send(&email).await,
        };
        if let Err(source) = sent {
            let err = PipelineError::Delivery {
                file_id: id,
                source,
            };
            error!(error = %err, "notification failed; upload stays undelivered");
            if let Err(db_err) =
                db::record_delivery_error(&self.pool, id, owner_id, &err.to_string()).await
            {
                warn!(file_id = id, error = %db_err, "failed to record delivery error");
            }
            return HandleOutcome::DeliveryFailed { id };
        }

        match db::mark_email_sent(&self.pool, id, owner_id, Utc::now()).await {
            Ok(true) => {
                info!(file_id = id, "upload marked as email sent");
                HandleOutcome::Delivered { id }
            }
            Ok(false) => self.explain_unchanged(id, owner_id).await,
            Err(err) => self.status_write_failed(id, err),
        }
    }

    /// No row changed on the status write: find out why.
    async fn explain_unchanged(&self, id: i64, owner_id: i64) -> HandleOutcome {
        match db::find_uploaded_file(&self.pool, id).await {
            Ok(Some(row)) if row.owner_id == owner_id && row.email_sent => {
                warn!(
                    file_id = id,
                    status = row.status().as_str(),
                    "row already delivered; status unchanged"
                );
                HandleOutcome::AlreadyDelivered { id }
            }
            Ok(Some(row)) => {
                error!(
                    file_id = id,
                    event_owner = owner_id,
                    row_owner = row.owner_id,
                    status = row.status().as_str(),
                    "event does not match the stored row; status unchanged"
                );
                HandleOutcome::RowMissing { id }
            }
            Ok(None) => {
                error!(file_id = id, "email sent for an upload that is not stored");
                HandleOutcome::RowMissing { id }
            }
            Err(err) => self.status_write_failed(id, err),
        }
    }

    fn status_write_failed(&self, id: i64, err: anyhow::Error) -> HandleOutcome {
        let err = PipelineError::StatusWrite {
            file_id: id,
            message: format!("{err:#}"),
        };
        error!(error = %err, "email sent but status write failed");
        HandleOutcome::StatusWriteFailed { id }
    }

    /// Handle deliveries one at a time until the stream ends.
    pub async fn run(self, mut deliveries: Deliveries) {
        info!("notification consumer started");
        while let Some(delivery) = deliveries.next().await {
            let outcome = self.handle_delivery(&delivery.body).await;
            info!(
                delivery_tag = delivery.delivery_tag,
                message_id = %delivery.message_id,
                ?outcome,
                "delivery handled"
            );
        }
        info!("delivery stream ended; consumer stopped");
    }
}
