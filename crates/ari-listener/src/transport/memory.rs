//! In-process transport
//!
//! A small broker with the delivery rules the listener relies on: exact
//! subject match, fan-out to plain subscribers, one member per queue group
//! (round-robin), and reply inboxes for request/acknowledgment exchanges.
//! Useful for tests and for running listener and publisher in one process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{InboundMessage, SubscriptionHandle, Transport};
use crate::error::{TransportError, TransportResult};

/// Capacity of reply inboxes created by [`MemoryTransport::request`]
const INBOX_CAPACITY: usize = 16;

struct Registration {
    subject: String,
    queue_group: Option<String>,
    sink: mpsc::Sender<InboundMessage>,
}

#[derive(Default)]
struct BrokerState {
    closed: bool,
    next_id: u64,
    registrations: HashMap<u64, Registration>,
    /// Round-robin position per (subject, queue group)
    cursors: HashMap<(String, String), usize>,
    unsubscribes: u64,
    published: u64,
}

impl BrokerState {
    fn register(
        &mut self,
        subject: &str,
        queue_group: Option<&str>,
        sink: mpsc::Sender<InboundMessage>,
    ) -> TransportResult<u64> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if subject.is_empty() {
            return Err(TransportError::Subscribe {
                subject: subject.to_string(),
                reason: "empty subject".to_string(),
            });
        }

        self.next_id += 1;
        let id = self.next_id;
        self.registrations.insert(
            id,
            Registration {
                subject: subject.to_string(),
                queue_group: queue_group.map(str::to_string),
                sink,
            },
        );
        Ok(id)
    }

    /// Pick the receivers of one message on `subject`
    fn route(&mut self, subject: &str) -> Vec<(u64, mpsc::Sender<InboundMessage>)> {
        let mut targets = Vec::new();
        let mut groups: BTreeMap<String, Vec<u64>> = BTreeMap::new();

        for (id, reg) in &self.registrations {
            if reg.subject != subject {
                continue;
            }
            match &reg.queue_group {
                None => targets.push((*id, reg.sink.clone())),
                Some(group) => groups.entry(group.clone()).or_default().push(*id),
            }
        }

        for (group, mut members) in groups {
            members.sort_unstable();
            let cursor = self
                .cursors
                .entry((subject.to_string(), group))
                .or_insert(0);
            let id = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            if let Some(reg) = self.registrations.get(&id) {
                targets.push((id, reg.sink.clone()));
            }
        }

        targets
    }
}

/// Reply inbox returned by [`MemoryTransport::request`]
pub struct ReplyInbox {
    /// Reply subject the request was published with
    pub subject: String,
    receiver: mpsc::Receiver<InboundMessage>,
    handle: Box<dyn SubscriptionHandle>,
}

impl ReplyInbox {
    /// Wait for the next reply payload
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await.map(|msg| msg.payload)
    }

    /// Take a reply if one is already queued
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.receiver.try_recv().ok().map(|msg| msg.payload)
    }

    /// Release the inbox subscription
    pub async fn close(self) -> TransportResult<()> {
        self.handle.unsubscribe().await
    }
}

/// In-process broker transport
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<BrokerState>>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryTransport")
            .field("closed", &state.closed)
            .field("registrations", &state.registrations.len())
            .finish()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a payload carrying a reply subject
    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl Into<Bytes>,
    ) -> TransportResult<()> {
        self.deliver(InboundMessage::new(subject, Some(reply.to_string()), payload))
            .await
    }

    /// Publish a payload with a fresh `_INBOX.<uuid>` reply subject
    ///
    /// Replies are collected in the returned inbox.
    pub async fn request(&self, subject: &str, payload: impl Into<Bytes>) -> TransportResult<ReplyInbox> {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let (tx, receiver) = mpsc::channel(INBOX_CAPACITY);
        let handle = self.subscribe(&inbox, tx).await?;

        self.publish_with_reply(subject, &inbox, payload).await?;

        Ok(ReplyInbox {
            subject: inbox,
            receiver,
            handle,
        })
    }

    /// Close the broker; every subscription channel is closed
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.registrations.clear();
    }

    /// True once [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of active registrations on `subject`
    pub fn subscription_count(&self, subject: &str) -> usize {
        self.state
            .lock()
            .registrations
            .values()
            .filter(|reg| reg.subject == subject)
            .count()
    }

    /// Number of successful unsubscribes so far
    pub fn unsubscribe_count(&self) -> u64 {
        self.state.lock().unsubscribes
    }

    /// Number of messages accepted for delivery so far
    pub fn published_count(&self) -> u64 {
        self.state.lock().published
    }

    async fn deliver(&self, msg: InboundMessage) -> TransportResult<()> {
        let targets = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if msg.subject.is_empty() {
                return Err(TransportError::Publish {
                    subject: msg.subject,
                    reason: "empty subject".to_string(),
                });
            }
            state.published += 1;
            state.route(&msg.subject)
        };

        trace!(subject = %msg.subject, receivers = targets.len(), "delivering");

        for (id, sink) in targets {
            if sink.send(msg.clone()).await.is_err() {
                // Receiver dropped without unsubscribing.
                self.state.lock().registrations.remove(&id);
            }
        }
        Ok(())
    }

    fn handle(&self, id: u64, subject: &str) -> Box<dyn SubscriptionHandle> {
        Box::new(MemorySubscription {
            id,
            subject: subject.to_string(),
            state: Arc::clone(&self.state),
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        sink: mpsc::Sender<InboundMessage>,
    ) -> TransportResult<Box<dyn SubscriptionHandle>> {
        let id = self.state.lock().register(subject, Some(queue_group), sink)?;
        Ok(self.handle(id, subject))
    }

    async fn subscribe(
        &self,
        subject: &str,
        sink: mpsc::Sender<InboundMessage>,
    ) -> TransportResult<Box<dyn SubscriptionHandle>> {
        let id = self.state.lock().register(subject, None, sink)?;
        Ok(self.handle(id, subject))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()> {
        self.deliver(InboundMessage::new(subject, None, payload)).await
    }
}

/// Handle to one broker registration
///
/// Dropping the handle without unsubscribing still removes the registration,
/// so an aborted listener leaves no dead queue-group member behind.
struct MemorySubscription {
    id: u64,
    subject: String,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl SubscriptionHandle for MemorySubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn unsubscribe(self: Box<Self>) -> TransportResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let removed = state.registrations.remove(&self.id);
        if removed.is_none() {
            return Err(TransportError::Unsubscribe {
                subject: self.subject.clone(),
                reason: "subscription not found".to_string(),
            });
        }
        state.unsubscribes += 1;
        // Release the lock before `self` drops and takes it again.
        drop(state);
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if self.state.lock().registrations.remove(&self.id).is_some() {
            trace!(subject = %self.subject, "released dropped subscription");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_subscribers_all_receive() {
        let transport = MemoryTransport::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let _h1 = transport.subscribe("events.dialog.d1", tx1).await.unwrap();
        let _h2 = transport.subscribe("events.dialog.d1", tx2).await.unwrap();

        transport
            .publish("events.dialog.d1", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert_eq!(rx1.recv().await.unwrap().payload, Bytes::from_static(b"{}"));
        assert_eq!(rx2.recv().await.unwrap().payload, Bytes::from_static(b"{}"));
    }

    #[tokio::test]
    async fn test_queue_group_delivers_once() {
        let transport = MemoryTransport::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let _h1 = transport.queue_subscribe("ari.app.a", "a_app_listener", tx1).await.unwrap();
        let _h2 = transport.queue_subscribe("ari.app.a", "a_app_listener", tx2).await.unwrap();

        for i in 0..4u8 {
            transport
                .publish("ari.app.a", Bytes::from(vec![i]))
                .await
                .unwrap();
        }

        let mut first = 0;
        while rx1.try_recv().is_ok() {
            first += 1;
        }
        let mut second = 0;
        while rx2.try_recv().is_ok() {
            second += 1;
        }

        assert_eq!(first + second, 4);
        assert_eq!(first, 2);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn test_request_receives_reply() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::channel(4);
        let _h = transport.subscribe("svc", tx).await.unwrap();

        let mut inbox = transport.request("svc", "ping").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.reply.as_deref(), Some(inbox.subject.as_str()));

        transport
            .publish(&inbox.subject, Bytes::from_static(b"pong"))
            .await
            .unwrap();
        assert_eq!(inbox.recv().await.unwrap(), Bytes::from_static(b"pong"));
        inbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = transport.subscribe("s", tx).await.unwrap();

        assert_eq!(handle.subject(), "s");
        handle.unsubscribe().await.unwrap();
        assert_eq!(transport.unsubscribe_count(), 1);
        assert_eq!(transport.subscription_count("s"), 0);

        transport.publish("s", Bytes::new()).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_handle_leaves_queue_group() {
        let transport = MemoryTransport::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let h1 = transport.queue_subscribe("ari.app.a", "a_app_listener", tx1).await.unwrap();
        let _h2 = transport.queue_subscribe("ari.app.a", "a_app_listener", tx2).await.unwrap();

        drop(h1);
        assert_eq!(transport.subscription_count("ari.app.a"), 1);
        assert_eq!(transport.unsubscribe_count(), 0);

        for i in 0..3u8 {
            transport
                .publish("ari.app.a", Bytes::from(vec![i]))
                .await
                .unwrap();
        }
        let mut received = 0;
        while rx2.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn test_close_ends_channels_and_rejects_use() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = transport.subscribe("s", tx).await.unwrap();

        transport.close();
        assert!(rx.recv().await.is_none());
        assert_eq!(handle.unsubscribe().await, Err(TransportError::Closed));
        assert_eq!(
            transport.publish("s", Bytes::new()).await,
            Err(TransportError::Closed)
        );

        let (tx, _rx) = mpsc::channel(1);
        assert!(transport.subscribe("s", tx).await.is_err());
    }
}
