//! Delivery dispatch. One contract over the three channel back-ends:
//! accept a composed message and a destination, return success or failure
//! within the timeout. A channel timeout is reported as an unsuccessful
//! outcome, never raised to the caller. Retry lives in the scheduler so
//! retry semantics are uniform across channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::enums::{ChannelKind, DeliveryStatus};
use crate::models::{ChannelMessage, ContactChannel, Recipient};

/// Capacity of the delivery-event bus; analytics consumers that fall
/// behind lose oldest events rather than blocking dispatch.
const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Error, Debug)]
#[error("{0}")]
pub struct ChannelError(pub String);

/// A single delivery back-end (push, sms, voice).
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Deliver one message to one address. Returns the transport message
    /// id on success.
    async fn deliver(&self, address: &str, message: &ChannelMessage) -> Result<Uuid, ChannelError>;
}

/// Result of one dispatcher call (one recipient, one channel, one try).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub status: DeliveryStatus,
    pub message_id: Option<Uuid>,
    pub error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }

    fn delivered(message_id: Uuid) -> Self {
        Self {
            status: DeliveryStatus::Delivered,
            message_id: Some(message_id),
            error: None,
            delivered_at: Some(Utc::now()),
        }
    }

    fn failed(error: String) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            message_id: None,
            error: Some(error),
            delivered_at: None,
        }
    }

    fn timed_out() -> Self {
        Self {
            status: DeliveryStatus::Timeout,
            message_id: None,
            error: Some("timeout".to_string()),
            delivered_at: None,
        }
    }
}

/// Per-delivery-attempt event published for external analytics/audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub emergency_id: Uuid,
    pub recipient_id: Uuid,
    pub recipient_name: String,
    pub channel: ChannelKind,
    pub status: DeliveryStatus,
    pub message_id: Option<Uuid>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Sends one message to one recipient over one channel back-end selected
/// by kind from the registry.
pub struct DeliveryDispatcher {
    channels: HashMap<ChannelKind, Arc<dyn DeliveryChannel>>,
    events: broadcast::Sender<DeliveryEvent>,
}

impl DeliveryDispatcher {
    pub fn new(backends: Vec<Arc<dyn DeliveryChannel>>) -> Self {
        let mut channels: HashMap<ChannelKind, Arc<dyn DeliveryChannel>> = HashMap::new();
        for backend in backends {
            channels.insert(backend.kind(), backend);
        }
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { channels, events }
    }

    /// Registry with the built-in local back-ends for all three kinds.
    pub fn with_default_channels() -> Self {
        Self::new(vec![
            Arc::new(PushChannel),
            Arc::new(SmsChannel),
            Arc::new(VoiceChannel),
        ])
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    /// One delivery attempt, bounded by `timeout`. Never errors: every
    /// failure mode is represented in the outcome.
    pub async fn send(
        &self,
        emergency_id: Uuid,
        recipient: &Recipient,
        channel: &ContactChannel,
        message: &ChannelMessage,
        timeout: Duration,
    ) -> DeliveryOutcome {
        let outcome = match self.channels.get(&channel.kind) {
            None => DeliveryOutcome::failed(format!(
                "no backend configured for channel '{}'",
                channel.kind.as_str()
            )),
            Some(backend) => {
                match tokio::time::timeout(timeout, backend.deliver(&channel.address, message))
                    .await
                {
                    Ok(Ok(message_id)) => DeliveryOutcome::delivered(message_id),
                    Ok(Err(e)) => DeliveryOutcome::failed(e.to_string()),
                    Err(_) => DeliveryOutcome::timed_out(),
                }
            }
        };

        match outcome.status {
            DeliveryStatus::Delivered => tracing::debug!(
                emergency_id = %emergency_id,
                recipient = %recipient.name,
                channel = channel.kind.as_str(),
                "Delivery succeeded"
            ),
            _ => tracing::warn!(
                emergency_id = %emergency_id,
                recipient = %recipient.name,
                channel = channel.kind.as_str(),
                error = outcome.error.as_deref().unwrap_or(""),
                "Delivery did not succeed"
            ),
        }

        // No receivers is fine; the bus is observability, not control flow.
        let _ = self.events.send(DeliveryEvent {
            emergency_id,
            recipient_id: recipient.id,
            recipient_name: recipient.name.clone(),
            channel: channel.kind,
            status: outcome.status,
            message_id: outcome.message_id,
            error: outcome.error.clone(),
            at: Utc::now(),
        });

        outcome
    }
}

// ---------------------------------------------------------------------------
// Built-in back-ends
// ---------------------------------------------------------------------------
// Transport integration is the embedder's concern; these local back-ends
// accept the message, log it, and report success so the engine is usable
// out of the box. Real push/SMS/voice providers implement DeliveryChannel.

pub struct PushChannel;

#[async_trait]
impl DeliveryChannel for PushChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn deliver(&self, address: &str, message: &ChannelMessage) -> Result<Uuid, ChannelError> {
        let message_id = Uuid::new_v4();
        tracing::info!(
            address,
            subject = %message.subject,
            message_id = %message_id,
            "Push notification queued"
        );
        Ok(message_id)
    }
}

pub struct SmsChannel;

#[async_trait]
impl DeliveryChannel for SmsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    async fn deliver(&self, address: &str, message: &ChannelMessage) -> Result<Uuid, ChannelError> {
        let message_id = Uuid::new_v4();
        tracing::info!(
            address,
            body_len = message.body.len(),
            message_id = %message_id,
            "Text message queued"
        );
        Ok(message_id)
    }
}

pub struct VoiceChannel;

#[async_trait]
impl DeliveryChannel for VoiceChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Voice
    }

    async fn deliver(&self, address: &str, message: &ChannelMessage) -> Result<Uuid, ChannelError> {
        let message_id = Uuid::new_v4();
        tracing::info!(
            address,
            locale = %message.locale,
            message_id = %message_id,
            "Voice call queued"
        );
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::{RecipientRole, Relationship, Severity};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted back-end for exercising failure and timeout paths.
    pub(crate) struct ScriptedChannel {
        pub kind: ChannelKind,
        pub mode: ScriptedMode,
        pub calls: AtomicU32,
    }

    pub(crate) enum ScriptedMode {
        Succeed,
        Fail,
        Hang,
    }

    #[async_trait]
    impl DeliveryChannel for ScriptedChannel {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn deliver(
            &self,
            _address: &str,
            _message: &ChannelMessage,
        ) -> Result<Uuid, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                ScriptedMode::Succeed => Ok(Uuid::new_v4()),
                ScriptedMode::Fail => Err(ChannelError("provider rejected".into())),
                ScriptedMode::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Uuid::new_v4())
                }
            }
        }
    }

    fn make_recipient() -> Recipient {
        Recipient {
            id: Uuid::new_v4(),
            name: "Maria".into(),
            roles: vec![RecipientRole::Family],
            relationship: Relationship::Spouse,
            channels: vec![],
            locale: "en".into(),
            formal_address: false,
        }
    }

    fn make_message() -> ChannelMessage {
        ChannelMessage {
            subject: "Check on Paul".into(),
            body: "Please check on Paul.".into(),
            locale: "en".into(),
            severity: Severity::Critical,
        }
    }

    fn sms_contact() -> ContactChannel {
        ContactChannel {
            kind: ChannelKind::Sms,
            address: "+15550100".into(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn successful_delivery_reports_message_id() {
        let dispatcher = DeliveryDispatcher::new(vec![Arc::new(ScriptedChannel {
            kind: ChannelKind::Sms,
            mode: ScriptedMode::Succeed,
            calls: AtomicU32::new(0),
        })]);

        let outcome = dispatcher
            .send(
                Uuid::new_v4(),
                &make_recipient(),
                &sms_contact(),
                &make_message(),
                Duration::from_secs(5),
            )
            .await;
        assert!(outcome.is_delivered());
        assert!(outcome.message_id.is_some());
        assert!(outcome.delivered_at.is_some());
    }

    #[tokio::test]
    async fn channel_failure_is_an_outcome_not_an_error() {
        let dispatcher = DeliveryDispatcher::new(vec![Arc::new(ScriptedChannel {
            kind: ChannelKind::Sms,
            mode: ScriptedMode::Fail,
            calls: AtomicU32::new(0),
        })]);

        let outcome = dispatcher
            .send(
                Uuid::new_v4(),
                &make_recipient(),
                &sms_contact(),
                &make_message(),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(outcome.status, DeliveryStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("provider rejected"));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_channel_maps_to_timeout() {
        let dispatcher = DeliveryDispatcher::new(vec![Arc::new(ScriptedChannel {
            kind: ChannelKind::Sms,
            mode: ScriptedMode::Hang,
            calls: AtomicU32::new(0),
        })]);

        let outcome = dispatcher
            .send(
                Uuid::new_v4(),
                &make_recipient(),
                &sms_contact(),
                &make_message(),
                Duration::from_secs(30),
            )
            .await;
        assert_eq!(outcome.status, DeliveryStatus::Timeout);
        assert_eq!(outcome.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn unconfigured_channel_fails_cleanly() {
        let dispatcher = DeliveryDispatcher::new(vec![]);
        let outcome = dispatcher
            .send(
                Uuid::new_v4(),
                &make_recipient(),
                &sms_contact(),
                &make_message(),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(outcome.status, DeliveryStatus::Failed);
        assert!(outcome.error.unwrap().contains("no backend"));
    }

    #[tokio::test]
    async fn delivery_event_published_per_attempt() {
        let dispatcher = DeliveryDispatcher::with_default_channels();
        let mut events = dispatcher.subscribe();
        let emergency_id = Uuid::new_v4();
        let recipient = make_recipient();

        dispatcher
            .send(
                emergency_id,
                &recipient,
                &sms_contact(),
                &make_message(),
                Duration::from_secs(5),
            )
            .await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.emergency_id, emergency_id);
        assert_eq!(event.recipient_id, recipient.id);
        assert_eq!(event.channel, ChannelKind::Sms);
        assert_eq!(event.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn default_registry_covers_all_kinds() {
        let dispatcher = DeliveryDispatcher::with_default_channels();
        for kind in [ChannelKind::Push, ChannelKind::Sms, ChannelKind::Voice] {
            let contact = ContactChannel {
                kind,
                address: "dest".into(),
                enabled: true,
            };
            let outcome = dispatcher
                .send(
                    Uuid::new_v4(),
                    &make_recipient(),
                    &contact,
                    &make_message(),
                    Duration::from_secs(5),
                )
                .await;
            assert!(outcome.is_delivered(), "kind {:?}", kind);
        }
    }
}
