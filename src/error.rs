//! Error taxonomy for the pipeline.
//!
//! The producer side returns these to its caller. The consumer side only logs
//! them; see [`crate::consumer::HandleOutcome`].
use thiserror::Error;

use crate::channel::ChannelError;
use crate::mailer::MailerError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed input. Nothing was written or queued.
    #[error("validation failed: {0}")]
    Validation(String),
    /// File store unavailable or a constraint was violated.
    #[error("persistence error: {0:#}")]
    Persistence(anyhow::Error),
    /// The row is stored but its event was not queued.
    #[error("upload {file_id} stored but not queued: {source}")]
    Publish {
        file_id: i64,
        #[source]
        source: ChannelError,
    },
    #[error("malformed delivery event: {0}")]
    Decode(String),
    #[error("notification for upload {file_id} not delivered: {source}")]
    Delivery {
        file_id: i64,
        #[source]
        source: MailerError,
    },
    /// The email went out but the row could not be marked.
    #[error("upload {file_id} delivered but status not written: {message}")]
    StatusWrite { file_id: i64, message: String },
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PipelineError::Validation(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, PipelineError::Validation(_))
    }
}
