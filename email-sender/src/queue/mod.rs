//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The shared connection manager
//! - Message types for the email queue
//! - Async publisher for enqueueing requests
//!
//! ## Architecture
//!
//! ```text
//! HTTP → Publisher → email-sender queue → Consumer → Mailer
//! ```

pub mod connection;
pub mod publisher;
pub mod types;

use std::future::Future;

use lapin::{options::QueueDeclareOptions, types::FieldTable, Channel};
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;

pub use connection::{AmqpConnector, ConnectionManager, Connector};
pub use publisher::Publisher;
pub use types::{EmailSendRequest, RequestError, EMAIL_QUEUE};

/// Declare a durable, non-exclusive, non-auto-deleting queue.
///
/// Producer and consumer both call this; the parameters must stay identical
/// or the broker rejects the redeclaration.
pub async fn declare_queue(channel: &Channel, queue: &str) -> Result<(), BrokerError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|source| BrokerError::Declare {
            queue: queue.to_string(),
            source,
        })?;

    Ok(())
}

/// Run `fut` unless `cancel` fires first, in which case it is dropped.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BrokerError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancellable_returns_result() {
        let cancel = CancellationToken::new();
        let result = cancellable(&cancel, async { Ok::<_, BrokerError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancellable_aborts_pending_work() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = cancellable(&cancel, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, BrokerError>(())
        })
        .await;

        assert!(result.unwrap_err().is_cancelled());
    }
}
