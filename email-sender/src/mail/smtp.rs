//! SMTP mailer using lettre.

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use super::Mailer;
use crate::config::SmtpConfig;
use crate::error::MailError;
use crate::queue::EmailSendRequest;

/// Delivers requests through an SMTP relay using STARTTLS.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build a mailer from the relay settings.
    pub fn from_config(config: &SmtpConfig) -> Result<Self, MailError> {
        let from = mailbox(&config.from_name, &config.from_email)?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port)
            .credentials(Credentials::new(config.user.clone(), config.pass.clone()))
            .build();

        Ok(Self { transport, from })
    }

    fn build_message(&self, request: &EmailSendRequest) -> Result<Message, MailError> {
        build_message(self.from.clone(), request)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, request: &EmailSendRequest) -> Result<(), MailError> {
        let message = self.build_message(request)?;
        self.transport.send(message).await?;

        info!(to = %request.to, subject_length = request.subject.len(), "smtp_message_sent");
        Ok(())
    }
}

fn mailbox(name: &str, email: &str) -> Result<Mailbox, MailError> {
    let address: Address = email
        .parse()
        .map_err(|_| MailError::InvalidAddress(email.to_string()))?;
    Ok(Mailbox::new(Some(name.to_string()), address))
}

fn build_message(from: Mailbox, request: &EmailSendRequest) -> Result<Message, MailError> {
    let to = mailbox(&request.to_name, &request.to)?;

    let message = Message::builder()
        .from(from)
        .to(to)
        .subject(request.subject.as_str())
        .header(ContentType::TEXT_PLAIN)
        .body(request.body.clone())?;

    Ok(message)
}
