//! Email Sender - queue-backed email delivery service.
//!
//! This library provides the pieces wired together by the `email-sender` binary:
//! - `web`: HTTP entry point that validates requests and enqueues them
//! - `queue`: Shared broker connection, queue declaration and publisher
//! - `consumer`: Background loop that consumes the queue with manual acks
//! - `processor`: Per-delivery decoding and delivery, returning a disposition
//! - `mail`: SMTP collaborator
//!
//! ## Architecture
//!
//! ```text
//! POST /api/EmailSender → Publisher → email-sender queue → Consumer → Mailer → SMTP relay
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod mail;
pub mod processor;
pub mod queue;
pub mod web;

// Re-export commonly used types
pub use config::{BrokerConfig, Config, SmtpConfig};
pub use consumer::{Consumer, ConsumerSettings, ConsumerState};
pub use error::{BrokerError, ConfigError, MailError};
pub use mail::{Mailer, SmtpMailer};
pub use processor::{process_delivery, DeliveryPolicy, Disposition};
pub use queue::{AmqpConnector, ConnectionManager, EmailSendRequest, Publisher, EMAIL_QUEUE};
pub use web::AppState;
