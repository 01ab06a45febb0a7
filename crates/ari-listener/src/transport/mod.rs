//! Pub/sub transport abstraction
//!
//! The listener only needs three operations from its transport: queue-group
//! subscription, plain subscription and publish. Subscriptions deliver into a
//! bounded channel owned by the caller, so the caller decides how much a slow
//! consumer may buffer.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportResult;

pub mod memory;

#[cfg(feature = "nats")]
pub mod nats;

pub use memory::MemoryTransport;

#[cfg(feature = "nats")]
pub use nats::NatsTransport;

/// A message delivered by a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Subject the message was published on
    pub subject: String,
    /// Per-message response address, if the publisher asked for one
    pub reply: Option<String>,
    /// Raw payload
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(subject: impl Into<String>, reply: Option<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply,
            payload: payload.into(),
        }
    }
}

/// Network transport used by the listener and its sessions
///
/// Implementations must be safe to share across tasks; every spawned request
/// and event feed holds a clone of the same `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Join `queue_group` on `subject`; each message goes to one group member
    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        sink: mpsc::Sender<InboundMessage>,
    ) -> TransportResult<Box<dyn SubscriptionHandle>>;

    /// Receive every message published on `subject`
    async fn subscribe(
        &self,
        subject: &str,
        sink: mpsc::Sender<InboundMessage>,
    ) -> TransportResult<Box<dyn SubscriptionHandle>>;

    /// Publish a payload without a reply subject
    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()>;
}

/// An active registration on a transport
///
/// Releasing consumes the handle, so a subscription is released at most once.
#[async_trait]
pub trait SubscriptionHandle: Send + Sync {
    /// Subject this handle is registered on
    fn subject(&self) -> &str;

    /// Stop delivery and release the registration
    async fn unsubscribe(self: Box<Self>) -> TransportResult<()>;
}
