//! Process-level success/failure notification.
//!
//! A thin wrapper over an SMTP relay, used only to report orchestrator
//! startup/shutdown outcomes. Not a user-facing notification channel -
//! devices and prices never go through here.

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use thiserror::Error;

use crate::config::MailParameters;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("smtp transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("message build error: {0}")]
    Message(#[from] lettre::error::Error),
}

/// A process-level event worth notifying an operator about.
pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, body: &str) -> Result<(), NotifyError>;
}

pub struct MailNotifier {
    sender: SmtpTransport,
    from: Mailbox,
    to: Mailbox,
}

impl MailNotifier {
    /// Returns a new instance wired to the configured SMTP relay.
    ///
    /// # Arguments
    ///
    /// * 'config' - mail configuration parameters
    pub fn new(config: &MailParameters) -> Result<Self, NotifyError> {
        let credentials = Credentials::new(config.smtp_user.to_owned(), config.smtp_password.to_owned());
        let sender = SmtpTransport::relay(&config.smtp_endpoint)?
            .credentials(credentials)
            .build();

        let from = config.from.parse::<Mailbox>()?;
        let to = config.to.parse::<Mailbox>()?;

        Ok(Self { sender, from, to })
    }
}

impl Notifier for MailNotifier {
    /// Sends a mail with the given subject and body.
    ///
    /// # Arguments
    ///
    /// * 'subject' - the subject of the mail
    /// * 'body' - the body of the mail
    fn notify(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;

        self.sender.send(&message)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_from_address() {
        let config = MailParameters {
            smtp_user: "user".to_string(),
            smtp_password: "pass".to_string(),
            smtp_endpoint: "smtp.example.com".to_string(),
            from: "not-an-address".to_string(),
            to: "ops@example.com".to_string(),
        };
        assert!(MailNotifier::new(&config).is_err());
    }
}
