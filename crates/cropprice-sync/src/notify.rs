use async_trait::async_trait;
use cropprice_core::RunLog;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::config::MailSettings;

pub const SUBJECT_SAVED: &str = "Crop Price RPA - Data Saved in DB";
pub const SUBJECT_NO_DATA: &str = "Crop Price RPA - No Data Found for Specified Districts";
pub const BODY_PREAMBLE: &str = "Crop Price RPA from Agmarknet completed.\n\nExecution Summary:\n\n";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid mailbox: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("building message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub subject: String,
    pub body: String,
}

pub fn compose_summary(log: &RunLog) -> Summary {
    let subject = if log.any_saved() {
        SUBJECT_SAVED
    } else {
        SUBJECT_NO_DATA
    };
    let body = format!(
        "{BODY_PREAMBLE}{}",
        log.messages().collect::<Vec<_>>().join("\n")
    );
    Summary {
        subject: subject.to_string(),
        body,
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, summary: &Summary) -> Result<(), NotifyError>;
}

/// Send the run summary; delivery failure is logged and reported as `false`.
pub async fn deliver(notifier: &dyn Notifier, summary: &Summary) -> bool {
    info!(subject = %summary.subject, "sending email summary");
    match notifier.send(summary).await {
        Ok(()) => {
            info!("email sent");
            true
        }
        Err(err) => {
            error!(error = %err, "error sending email");
            false
        }
    }
}

/// Plain-text mail over a STARTTLS relay.
pub struct SmtpNotifier {
    settings: MailSettings,
}

impl SmtpNotifier {
    pub fn new(settings: MailSettings) -> Self {
        Self { settings }
    }

    fn message(&self, summary: &Summary) -> Result<Message, NotifyError> {
        let mut builder = Message::builder()
            .from(self.settings.from.parse::<Mailbox>()?)
            .subject(summary.subject.clone())
            .header(ContentType::TEXT_PLAIN);
        for to in &self.settings.to {
            builder = builder.to(to.parse::<Mailbox>()?);
        }
        Ok(builder.body(summary.body.clone())?)
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, summary: &Summary) -> Result<(), NotifyError> {
        let message = self.message(summary)?;
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.settings.smtp_host)?
            .port(self.settings.smtp_port)
            .credentials(Credentials::new(
                self.settings.username.clone(),
                self.settings.password.clone(),
            ))
            .build();
        mailer.send(message).await?;
        Ok(())
    }
}

/// Logs the summary instead of mailing it (dry runs).
#[derive(Debug, Default)]
pub struct LogOnlyNotifier;

#[async_trait]
impl Notifier for LogOnlyNotifier {
    async fn send(&self, summary: &Summary) -> Result<(), NotifyError> {
        info!(subject = %summary.subject, body = %summary.body, "dry run: email not sent");
        Ok(())
    }
}
