//! Shared broker connection.
//!
//! One process holds at most one live connection. Publishers and the consumer
//! all ask the `ConnectionManager` for it; the first caller to find it missing
//! or closed takes the write lock and reconnects, everyone else waits and then
//! reuses the fresh handle.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::{Connection, ConnectionProperties};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// Opens and inspects broker connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    /// Establish a new connection.
    async fn connect(&self) -> Result<Self::Connection, BrokerError>;

    /// Whether the connection can still carry traffic.
    fn is_open(&self, connection: &Self::Connection) -> bool;

    /// Close the connection gracefully.
    async fn close(&self, connection: &Self::Connection) -> Result<(), BrokerError>;
}

/// Connects to RabbitMQ with lapin.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Connection = Connection;

    async fn connect(&self) -> Result<Connection, BrokerError> {
        info!(
            host = %self.config.host,
            port = self.config.port,
            vhost = %self.config.vhost,
            "rabbitmq_connecting"
        );

        let conn = Connection::connect_uri(self.config.uri(), ConnectionProperties::default())
            .await
            .map_err(BrokerError::Connect)?;

        info!("rabbitmq_connected");
        Ok(conn)
    }

    fn is_open(&self, connection: &Connection) -> bool {
        connection.status().connected()
    }

    async fn close(&self, connection: &Connection) -> Result<(), BrokerError> {
        connection
            .close(200, "Normal shutdown")
            .await
            .map_err(BrokerError::Close)
    }
}

/// Owner of the process-wide broker connection.
pub struct ConnectionManager<C: Connector = AmqpConnector> {
    connector: C,
    connection: RwLock<Option<Arc<C::Connection>>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            connection: RwLock::new(None),
        }
    }

    /// Return the live connection, establishing a new one if needed.
    ///
    /// Connection failures are returned as-is; retrying is up to the caller.
    pub async fn get_connection(&self) -> Result<Arc<C::Connection>, BrokerError> {
        {
            let current = self.connection.read().await;
            if let Some(conn) = current.as_ref() {
                if self.connector.is_open(conn) {
                    return Ok(Arc::clone(conn));
                }
            }
        }

        let mut current = self.connection.write().await;

        // Another caller may have reconnected while we waited for the lock
        if let Some(conn) = current.as_ref() {
            if self.connector.is_open(conn) {
                return Ok(Arc::clone(conn));
            }
        }

        if let Some(stale) = current.take() {
            debug!("rabbitmq_stale_connection_discarded");
            if let Err(e) = self.connector.close(&stale).await {
                debug!(error = %e, "rabbitmq_stale_connection_close_error");
            }
        }

        let conn = Arc::new(self.connector.connect().await?);
        *current = Some(Arc::clone(&conn));

        Ok(conn)
    }

    /// Close the connection gracefully and release it.
    pub async fn close(&self) {
        let mut current = self.connection.write().await;

        if let Some(conn) = current.take() {
            if let Err(e) = self.connector.close(&conn).await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_connection_closed");
    }
}
