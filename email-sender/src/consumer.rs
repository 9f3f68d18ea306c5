//! RabbitMQ consumer module using lapin.
//!
//! The consumer runs for the lifetime of the process. Each attempt obtains the
//! shared connection, opens one dedicated channel, declares the queue, applies
//! the prefetch limit and consumes with manual acknowledgement. Deliveries are
//! processed concurrently (bounded by the prefetch) and settled with the
//! `Disposition` returned by the processor.
//!
//! When the broker goes away the attempt fails and the supervisor starts a new
//! one after an exponential backoff. Cancellation stops everything cleanly.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions,
    },
    types::FieldTable,
    Channel,
};
use rand::Rng;
use tokio::{sync::watch, task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::BrokerError;
use crate::mail::Mailer;
use crate::processor::{process_delivery, DeliveryPolicy, Disposition};
use crate::queue::{cancellable, declare_queue, ConnectionManager};

/// Lifecycle of the consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Declaring,
    Consuming,
    ShuttingDown,
    Stopped,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Idle => "idle",
            ConsumerState::Declaring => "declaring",
            ConsumerState::Consuming => "consuming",
            ConsumerState::ShuttingDown => "shutting_down",
            ConsumerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for the consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue: String,
    pub consumer_tag: String,
    pub prefetch_count: u16,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub delivery_policy: DeliveryPolicy,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue: config.queue_name.clone(),
            consumer_tag: "email-sender-consumer".to_string(),
            prefetch_count: config.prefetch_count,
            reconnect_delay: config.reconnect_delay,
            reconnect_max_delay: config.reconnect_max_delay,
            delivery_policy: config.delivery_policy,
        }
    }
}

/// Exponential reconnect delay with up to 10% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
        delay + Duration::from_millis(jitter_ms)
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Long-running consumer of the email queue.
pub struct Consumer {
    connections: Arc<ConnectionManager>,
    mailer: Arc<dyn Mailer>,
    settings: ConsumerSettings,
    state: watch::Sender<ConsumerState>,
}

impl Consumer {
    pub fn new(
        connections: Arc<ConnectionManager>,
        mailer: Arc<dyn Mailer>,
        settings: ConsumerSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            connections,
            mailer,
            settings,
            state,
        }
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        debug!(queue = %self.settings.queue, state = %state, "consumer_state_changed");
        self.state.send_replace(state);
    }

    /// Run until `cancel` fires, reconnecting whenever the broker is lost.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(
            self.settings.reconnect_delay,
            self.settings.reconnect_max_delay,
        );

        info!(queue = %self.settings.queue, "consumer_starting");

        loop {
            match self.consume_once(&cancel, &mut backoff).await {
                Ok(()) => break,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    error!(queue = %self.settings.queue, error = %e, "consumer_attempt_failed");
                    self.set_state(ConsumerState::Idle);

                    let delay = backoff.next_delay();
                    warn!(
                        queue = %self.settings.queue,
                        delay_ms = delay.as_millis() as u64,
                        "consumer_reconnect_scheduled"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        self.set_state(ConsumerState::Stopped);
        info!(queue = %self.settings.queue, "consumer_stopped");
    }

    /// One connection attempt. Returns `Ok(())` only when cancelled while consuming.
    async fn consume_once(
        &self,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<(), BrokerError> {
        self.set_state(ConsumerState::Declaring);

        let connection = cancellable(cancel, self.connections.get_connection()).await?;
        let channel = cancellable(cancel, async {
            connection.create_channel().await.map_err(BrokerError::Channel)
        })
        .await?;

        info!("rabbitmq_channel_created");

        let outcome = self.consume_on(&channel, cancel, backoff).await;

        if let Err(e) = channel.close(200, "Consumer stopping").await {
            debug!(error = %e, "rabbitmq_channel_close_error");
        }

        outcome
    }

    /// Declare, subscribe and process deliveries on an open channel.
    async fn consume_on(
        &self,
        channel: &Channel,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<(), BrokerError> {
        let queue: Arc<str> = Arc::from(self.settings.queue.as_str());

        cancellable(cancel, declare_queue(channel, &queue)).await?;

        info!(queue = %queue, "rabbitmq_queue_declared");

        let prefetch_count = self.settings.prefetch_count;
        cancellable(cancel, async {
            channel
                .basic_qos(prefetch_count, BasicQosOptions { global: false })
                .await
                .map_err(BrokerError::Qos)
        })
        .await?;

        info!(prefetch_count = prefetch_count, "rabbitmq_qos_set");

        let mut consumer = cancellable(cancel, async {
            channel
                .basic_consume(
                    &queue,
                    &self.settings.consumer_tag,
                    BasicConsumeOptions {
                        no_ack: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(BrokerError::Consume)
        })
        .await?;

        self.set_state(ConsumerState::Consuming);
        backoff.reset();
        info!(queue = %queue, "rabbitmq_consumer_started");

        let mut in_flight = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(queue = %queue, "consumer_stopping");
                    break Ok(());
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(queue = %queue, error = %e, "delivery_task_panicked");
                    }
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            let delivery_tag = delivery.delivery_tag;

                            info!(
                                queue = %queue,
                                delivery_tag = delivery_tag,
                                body_length = delivery.data.len(),
                                "rabbitmq_delivery_received"
                            );

                            let channel = channel.clone();
                            let mailer = Arc::clone(&self.mailer);
                            let queue = Arc::clone(&queue);
                            let policy = self.settings.delivery_policy;

                            in_flight.spawn(async move {
                                handle_delivery(
                                    &channel,
                                    &queue,
                                    delivery_tag,
                                    &delivery.data,
                                    mailer.as_ref(),
                                    policy,
                                )
                                .await;
                            });
                        }
                        Some(Err(e)) => break Err(BrokerError::Consume(e)),
                        None => break Err(BrokerError::ConsumerClosed),
                    }
                }
            }
        };

        self.set_state(ConsumerState::ShuttingDown);

        if outcome.is_ok() {
            if let Err(e) = channel
                .basic_cancel(&self.settings.consumer_tag, BasicCancelOptions::default())
                .await
            {
                debug!(error = %e, "rabbitmq_consumer_cancel_error");
            }
        }

        let pending = in_flight.len();
        if pending > 0 {
            info!(queue = %queue, pending = pending, "consumer_draining");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(queue = %queue, error = %e, "delivery_task_panicked");
            }
        }

        outcome
    }
}

/// Acknowledgement operations on the channel a delivery arrived on.
#[async_trait]
pub trait Settle: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), lapin::Error>;
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), lapin::Error>;
}

#[async_trait]
impl Settle for Channel {
    async fn ack(&self, delivery_tag: u64) -> Result<(), lapin::Error> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), lapin::Error> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
    }
}

/// Process one delivery and settle it with the resulting disposition.
pub async fn handle_delivery<S: Settle + ?Sized>(
    settler: &S,
    queue: &str,
    delivery_tag: u64,
    payload: &[u8],
    mailer: &dyn Mailer,
    policy: DeliveryPolicy,
) -> Disposition {
    let disposition = process_delivery(queue, payload, mailer, policy).await;
    settle(settler, queue, delivery_tag, disposition).await;
    disposition
}

/// Apply a disposition to a single delivery tag.
async fn settle<S: Settle + ?Sized>(
    settler: &S,
    queue: &str,
    delivery_tag: u64,
    disposition: Disposition,
) {
    let result = match disposition {
        Disposition::Ack => settler.ack(delivery_tag).await,
        Disposition::NackNoRequeue => settler.nack(delivery_tag, false).await,
        Disposition::NackRequeue => settler.nack(delivery_tag, true).await,
    };

    match result {
        Ok(()) => debug!(
            queue = %queue,
            delivery_tag = delivery_tag,
            disposition = ?disposition,
            "rabbitmq_delivery_settled"
        ),
        Err(e) => error!(
            queue = %queue,
            delivery_tag = delivery_tag,
            disposition = ?disposition,
            error = %e,
            "rabbitmq_settle_failed"
        ),
    }
}
