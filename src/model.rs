use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery status of an upload. There is no failed state: a failed
/// notification leaves the row in `Created` indefinitely.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryStatus {
    Created,
    EmailSent { at: DateTime<Utc> },
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Created => "created",
            DeliveryStatus::EmailSent { .. } => "email_sent",
        }
    }
}

/// Input to the ingestion path, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUpload {
    pub owner_id: i64,
    pub email_recipient: String,
    pub name: String,
    pub size: i64,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub id: i64,
    pub name: String,
    pub size: i64,
    #[serde(skip)]
    pub content: Vec<u8>,
    #[serde(rename = "ownerID")]
    pub owner_id: i64,
    pub created_at: DateTime<Utc>,
    pub email_recipient: String,
    pub email_sent: bool,
    pub email_sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl UploadedFile {
    pub fn status(&self) -> DeliveryStatus {
        match (self.email_sent, self.email_sent_at) {
            (true, Some(at)) => DeliveryStatus::EmailSent { at },
            _ => DeliveryStatus::Created,
        }
    }
}

/// Wire message carried on the event channel. A denormalized snapshot of the
/// row at publish time, including the file bytes as standard base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEvent {
    pub id: i64,
    pub name: String,
    pub size: i64,
    pub content_base64: String,
    #[serde(rename = "ownerID")]
    pub owner_id: i64,
    pub created_at: DateTime<Utc>,
    pub email_recipient: String,
}

impl DeliveryEvent {
    pub fn from_file(file: &UploadedFile) -> Self {
        Self {
            id: file.id,
            name: file.name.clone(),
            size: file.size,
            content_base64: BASE64.encode(&file.content),
            owner_id: file.owner_id,
            created_at: file.created_at,
            email_recipient: file.email_recipient.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    pub fn decode_content(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.content_base64.as_bytes())
    }

    /// Decode as much of the content as is valid. On error the bytes of every
    /// complete group before the first bad one are kept, along with the error.
    pub fn decode_content_lossy(&self) -> (Vec<u8>, Option<base64::DecodeError>) {
        match self.decode_content() {
            Ok(bytes) => (bytes, None),
            Err(err) => (decode_valid_prefix(&self.content_base64), Some(err)),
        }
    }

    /// Rebuild the file as the consumer sees it. Delivery fields start from
    /// the `Created` state since the event never carries them.
    pub fn into_file(self, content: Vec<u8>) -> UploadedFile {
        UploadedFile {
            id: self.id,
            name: self.name,
            size: self.size,
            content,
            owner_id: self.owner_id,
            created_at: self.created_at,
            email_recipient: self.email_recipient,
            email_sent: false,
            email_sent_at: None,
            error_message: None,
        }
    }
}

fn decode_valid_prefix(input: &str) -> Vec<u8> {
    let cleaned: Vec<u8> = input
        .bytes()
        .filter(|b| !matches!(b, b'\r' | b'\n'))
        .collect();
    let mut out = Vec::with_capacity(cleaned.len() / 4 * 3);
    for group in cleaned.chunks(4) {
        if group.len() < 4 {
            break;
        }
        match BASE64.decode(group) {
            Ok(bytes) => out.extend_from_slice(&bytes),
            Err(_) => break,
        }
        // Padding ends the data.
        if group.contains(&b'=') {
            break;
        }
    }
    out
}

/// One page of an owner's upload history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub files: Vec<UploadedFile>,
    pub total_records: i64,
}

impl Page {
    /// Cursor for the next request, if this page returned anything.
    pub fn last_id(&self) -> Option<i64> {
        self.files.last().map(|f| f.id)
    }
}
