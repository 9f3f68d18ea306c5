//! Per-delivery processing.
//!
//! Turns one queued payload into a `Disposition` the consumer loop applies to
//! the broker. Nothing in here touches the channel.

use std::fmt;
use std::str::FromStr;

use tracing::{error, info, warn};

use crate::mail::Mailer;
use crate::queue::{EmailSendRequest, RequestError};

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove from the queue.
    Ack,
    /// Reject and discard. No dead-letter exchange is configured, so the message is lost.
    NackNoRequeue,
    /// Reject and put back on the queue for redelivery.
    NackRequeue,
}

/// What to do with a well-formed request whose SMTP delivery failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Drop the message (at-most-once successful processing).
    #[default]
    Drop,
    /// Requeue the message for another attempt.
    Requeue,
}

impl DeliveryPolicy {
    fn on_failure(self) -> Disposition {
        match self {
            DeliveryPolicy::Drop => Disposition::NackNoRequeue,
            DeliveryPolicy::Requeue => Disposition::NackRequeue,
        }
    }
}

impl FromStr for DeliveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(DeliveryPolicy::Drop),
            "requeue" => Ok(DeliveryPolicy::Requeue),
            other => Err(format!("unknown delivery policy: {other}")),
        }
    }
}

impl fmt::Display for DeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryPolicy::Drop => f.write_str("drop"),
            DeliveryPolicy::Requeue => f.write_str("requeue"),
        }
    }
}

/// Process a single delivery payload.
///
/// Malformed or invalid payloads are always dropped without calling the
/// mailer. SMTP failures are settled according to `policy`.
pub async fn process_delivery(
    queue: &str,
    payload: &[u8],
    mailer: &dyn Mailer,
    policy: DeliveryPolicy,
) -> Disposition {
    let request = match EmailSendRequest::from_payload(payload) {
        Ok(request) => request,
        Err(e) => {
            let reason = match &e {
                RequestError::Malformed(_) => "malformed",
                RequestError::Invalid(_) => "invalid",
            };
            warn!(
                queue = %queue,
                reason = reason,
                error = %e,
                body_preview = %String::from_utf8_lossy(&payload[..payload.len().min(200)]),
                "email_request_rejected"
            );
            return Disposition::NackNoRequeue;
        }
    };

    match mailer.send(&request).await {
        Ok(()) => {
            info!(queue = %queue, to = %request.to, "email_delivered");
            Disposition::Ack
        }
        Err(e) => {
            error!(
                queue = %queue,
                to = %request.to,
                policy = %policy,
                error = %e,
                "email_delivery_failed"
            );
            policy.on_failure()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::MailError;

    /// Mailer that records every request and optionally fails.
    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<EmailSendRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, request: &EmailSendRequest) -> Result<(), MailError> {
            self.sent.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(MailError::InvalidAddress(request.to.clone()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_valid_payload_is_sent_and_acked() {
        let mailer = RecordingMailer::default();
        let payload = br#"{"To":"a@b.com","ToName":"A","Subject":"Hi","Body":"Hello"}"#;

        let disposition =
            process_delivery("email-sender", payload, &mailer, DeliveryPolicy::Drop).await;

        assert_eq!(disposition, Disposition::Ack);
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.as_slice(), &[EmailSendRequest::new("a@b.com", "A", "Hi", "Hello")]);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped_without_sending() {
        let mailer = RecordingMailer::default();

        let disposition =
            process_delivery("email-sender", b"\xff not json", &mailer, DeliveryPolicy::Requeue)
                .await;

        assert_eq!(disposition, Disposition::NackNoRequeue);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_is_dropped_without_sending() {
        let mailer = RecordingMailer::default();
        let payload = br#"{"To":"nope","ToName":"A","Subject":"Hi","Body":"Hello"}"#;

        let disposition =
            process_delivery("email-sender", payload, &mailer, DeliveryPolicy::Drop).await;

        assert_eq!(disposition, Disposition::NackNoRequeue);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_follows_policy() {
        let mailer = RecordingMailer {
            fail: true,
            ..Default::default()
        };
        let payload = br#"{"To":"a@b.com","ToName":"A","Subject":"Hi","Body":"Hello"}"#;

        let dropped =
            process_delivery("email-sender", payload, &mailer, DeliveryPolicy::Drop).await;
        let requeued =
            process_delivery("email-sender", payload, &mailer, DeliveryPolicy::Requeue).await;

        assert_eq!(dropped, Disposition::NackNoRequeue);
        assert_eq!(requeued, Disposition::NackRequeue);
        assert_eq!(mailer.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("drop".parse::<DeliveryPolicy>(), Ok(DeliveryPolicy::Drop));
        assert_eq!(" Requeue ".parse::<DeliveryPolicy>(), Ok(DeliveryPolicy::Requeue));
        assert!("retry".parse::<DeliveryPolicy>().is_err());
    }
}
