//! Change notifications over authenticated, encrypted SMTP.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use sitewatch_config::{EmailConfig, SmtpTls};

use crate::error::NotifyError;

/// Upper bound for one SMTP conversation (connect, auth, send, quit).
const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A rendered message, ready to hand to a [`Notifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

impl Notification {
    /// The message sent when the content of `url` has changed.
    pub fn site_changed(url: &str) -> Self {
        Self {
            subject: format!("{url} site-change notice"),
            body: format!("The content of {url} has changed. Please check the update."),
        }
    }
}

/// Delivers one notification.  Failures are reported, never retried here.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Sends plain-text mail to the single configured recipient.
///
/// A fresh connection is opened for every message and closed when the
/// transport is dropped, on success and on every error path.
pub struct SmtpNotifier {
    config: EmailConfig,
}

impl SmtpNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotifyError> {
        let server = self.config.smtp_server.as_str();
        let builder = match self.config.tls {
            SmtpTls::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(server),
            SmtpTls::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(server),
        }
        .map_err(|e| NotifyError::Transport(e.to_string()))?;

        Ok(builder
            .port(self.config.smtp_port)
            .credentials(Credentials::new(
                self.config.sender_email.clone(),
                self.config.sender_password.clone(),
            ))
            .timeout(Some(SMTP_TIMEOUT))
            .build())
    }

    pub(crate) fn build_message(&self, notification: &Notification) -> Result<Message, NotifyError> {
        let from = parse_mailbox(&self.config.sender_email)?;
        let to = parse_mailbox(&self.config.recipient_email)?;
        Message::builder()
            .from(from)
            .to(to)
            .subject(notification.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(notification.body.clone())
            .map_err(|e| NotifyError::Message(e.to_string()))
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address.parse::<Mailbox>().map_err(|e| NotifyError::Address {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = self.build_message(notification)?;
        let transport = self.transport()?;
        transport
            .send(message)
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(())
    }
}
