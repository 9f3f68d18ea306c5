//! Outbound mail delivery.

pub mod smtp;

use async_trait::async_trait;

use crate::error::MailError;
use crate::queue::EmailSendRequest;

pub use smtp::SmtpMailer;

/// Sends a single email request.
///
/// The consumer only depends on this trait; tests substitute a recorder.
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send(&self, request: &EmailSendRequest) -> Result<(), MailError>;
}
