//! Email Sender - HTTP entry point and background queue consumer.
//!
//! Accepts email send requests over HTTP, enqueues them on RabbitMQ and
//! delivers them through an SMTP relay from a background consumer running in
//! the same process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use email_sender::{
    web, AmqpConnector, AppState, Config, ConnectionManager, Consumer, ConsumerSettings,
    Publisher, SmtpMailer,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("email_sender_starting");

    // Load configuration from environment
    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        port = config.port,
        rabbitmq_host = %config.broker.host,
        rabbitmq_port = config.broker.port,
        queue = %config.queue_name,
        prefetch_count = config.prefetch_count,
        smtp_host = %config.smtp.host,
        smtp_port = config.smtp.port,
        delivery_policy = %config.delivery_policy,
        "config_loaded"
    );

    let mailer = SmtpMailer::from_config(&config.smtp).context("Failed to configure SMTP")?;
    let connections = Arc::new(ConnectionManager::new(AmqpConnector::new(
        config.broker.clone(),
    )));
    let shutdown = CancellationToken::new();

    // Start the consumer
    let consumer = Consumer::new(
        Arc::clone(&connections),
        Arc::new(mailer),
        ConsumerSettings::from_config(&config),
    );
    let consumer_state = consumer.state();
    let consumer_task = tokio::spawn(consumer.run(shutdown.clone()));

    // Build the router
    let state = AppState::new(
        Publisher::new(Arc::clone(&connections)),
        config.queue_name.clone(),
        consumer_state,
        shutdown.clone(),
    );
    let app = web::router(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    // Run server with graceful shutdown
    let served = axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await
        .context("Server error");

    // Stop the consumer even if the server failed on its own
    shutdown.cancel();
    if let Err(e) = consumer_task.await {
        error!(error = %e, "consumer_task_failed");
    }

    // Close broker connection
    connections.close().await;

    info!("email_sender_shutdown_complete");

    served
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("email_sender_shutting_down");
}
