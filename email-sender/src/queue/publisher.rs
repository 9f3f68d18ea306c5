//! Async RabbitMQ publisher for enqueueing messages.
//!
//! Every publish opens its own channel on the shared connection, declares the
//! target queue, publishes to the default exchange and closes the channel.
//! Publisher confirms are not enabled, so a successful return only means the
//! broker accepted the frame.

use std::sync::Arc;

use lapin::{options::BasicPublishOptions, BasicProperties, Connection};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::ConnectionManager;
use super::types::EmailSendRequest;
use super::{cancellable, declare_queue};
use crate::error::BrokerError;

/// Publishes payloads through the shared connection.
#[derive(Clone)]
pub struct Publisher {
    connections: Arc<ConnectionManager>,
}

impl Publisher {
    /// Create a new publisher on top of the shared connection manager.
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Publish raw bytes to `queue`.
    ///
    /// If `cancel` fires while the connection is being obtained the publish is
    /// abandoned and `BrokerError::Cancelled` is returned. Once a channel is
    /// open the publish runs to completion so the channel is always closed.
    pub async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let connection = cancellable(cancel, self.connections.get_connection()).await?;
        publish_on(&connection, queue, payload).await?;

        info!(queue = %queue, body_length = payload.len(), "rabbitmq_message_published");

        Ok(())
    }

    /// Serialize an email request and publish it to `queue`.
    pub async fn publish_request(
        &self,
        queue: &str,
        request: &EmailSendRequest,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let body = request.to_payload()?;
        self.publish(queue, &body, cancel).await
    }
}

async fn publish_on(
    connection: &Connection,
    queue: &str,
    payload: &[u8],
) -> Result<(), BrokerError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(BrokerError::Channel)?;

    let result = async {
        declare_queue(&channel, queue).await?;

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(BrokerError::Publish)?
            .await
            .map_err(BrokerError::Publish)?;

        Ok::<(), BrokerError>(())
    }
    .await;

    if let Err(e) = channel.close(200, "Publish complete").await {
        debug!(error = %e, "rabbitmq_channel_close_error");
    }

    result
}
