//! View models returned by repository queries that do not need a full row.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A row still waiting for its notification, without the file bytes.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UndeliveredUpload {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub email_recipient: String,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
}
