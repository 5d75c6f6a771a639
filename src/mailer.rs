//! Notification mailer: composes the upload confirmation and hands it to SMTP.
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

use crate::config;
use crate::model::UploadedFile;

const ATTACHMENT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("invalid address {address}: {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error("invalid attachment content type: {0}")]
    ContentType(String),
    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("message rejected: {0}")]
    Rejected(String),
}

/// A fully composed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
    pub attachment_name: String,
    pub attachment: Vec<u8>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one email. Synchronous from the caller's view; no retries.
    async fn send(&self, email: &Email) -> Result<(), MailerError>;
}

/// Build the upload confirmation for `file`, with the file attached.
pub fn compose_notification(file: &UploadedFile, subject: &str) -> Email {
    let html_body = format!(
        "<h1>File Upload Successful</h1>\
         <p>Hello,</p>\
         <p>We have successfully received your file upload.</p>\
         <p><b>File Name:</b> {}</p>\
         <p>If you have any questions or need further assistance, please do not hesitate to contact us.</p>\
         <p>Best Regards,<br>Your Support Team</p>",
        escape_html(&file.name)
    );
    Email {
        recipient: file.email_recipient.clone(),
        subject: subject.to_string(),
        html_body,
        attachment_name: file.name.clone(),
        attachment: file.content.clone(),
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailerError> {
    address.parse().map_err(|source| MailerError::Address {
        address: address.to_string(),
        source,
    })
}

/// SMTP mailer. Plain SMTP unless `tls` is set, in which case STARTTLS.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl std::fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("from", &self.from.to_string())
            .finish_non_exhaustive()
    }
}

impl SmtpMailer {
    pub fn from_config(cfg: &config::Mailer) -> Result<Self, MailerError> {
        let from = parse_mailbox(&cfg.from)?;

        let builder = if cfg.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.host)
        };
        let mut builder = builder.port(cfg.port);
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        info!(host = %cfg.host, port = cfg.port, tls = cfg.tls, "smtp mailer initialized");
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    pub fn build_message(&self, email: &Email) -> Result<Message, MailerError> {
        let to = parse_mailbox(&email.recipient)?;
        let content_type = ContentType::parse(ATTACHMENT_CONTENT_TYPE)
            .map_err(|e| MailerError::ContentType(e.to_string()))?;
        let attachment =
            Attachment::new(email.attachment_name.clone()).body(email.attachment.clone(), content_type);

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::html(email.html_body.clone()))
                    .singlepart(attachment),
            )?;
        Ok(message)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    #[instrument(skip_all, fields(attachment = %email.attachment_name))]
    async fn send(&self, email: &Email) -> Result<(), MailerError> {
        let message = self.build_message(email)?;
        self.transport.send(message).await?;
        info!("notification email sent");
        Ok(())
    }
}
