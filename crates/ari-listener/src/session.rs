//! Session handles and their per-dialog event feed
//!
//! A [`Session`] is handed to the application handler for each accepted
//! dialog. Protocol events published on the dialog's event subject are pushed
//! into the session's event inbox by a fan-in task, the inbox's only writer,
//! which lives exactly as long as the session: dropping or closing the session cancels it and releases
//! the subscription.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::diagnostics::{ListenerEvent, SharedSink};
use crate::dialog::Dialog;
use crate::error::{ListenerError, ListenerResult};
use crate::transport::{InboundMessage, SubscriptionHandle, Transport};

/// Protocol message envelope carried on a dialog's event subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AriMessage {
    raw: Bytes,
    kind: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl AriMessage {
    /// Wrap a raw payload, peeking at its `type` field when it is JSON
    pub fn from_raw(raw: Bytes) -> Self {
        let kind = serde_json::from_slice::<Envelope>(&raw)
            .ok()
            .and_then(|envelope| envelope.kind);
        Self { raw, kind }
    }

    /// Raw payload bytes
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Message type, if the payload declared one
    pub fn message_type(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Decode the payload into a concrete message type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.raw)
    }
}

/// Write side of a session's event inbox, held by the fan-in task
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: mpsc::Sender<AriMessage>,
}

impl EventBus {
    /// Deliver a message; fails once the session has been dropped
    pub(crate) async fn send(&self, message: AriMessage) -> Result<(), AriMessage> {
        self.tx.send(message).await.map_err(|e| e.0)
    }
}

struct EventFeed {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for EventFeed {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Protocol events of a session consumed as a stream
///
/// Holds the session's event feed; dropping the stream stops it.
pub struct EventStream {
    inner: ReceiverStream<AriMessage>,
    _feed: Option<EventFeed>,
}

impl Stream for EventStream {
    type Item = AriMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Handle to one dialog's session
///
/// Events arrive only through the attached feed; the session exposes no way
/// to inject them:
///
/// ```compile_fail
/// fn inject(session: &ari_listener::Session) {
///     let _ = session.bus();
/// }
/// ```
pub struct Session {
    transport: Arc<dyn Transport>,
    application: String,
    dialog: Dialog,
    bus: EventBus,
    events: mpsc::Receiver<AriMessage>,
    feed: Option<EventFeed>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("application", &self.application)
            .field("dialog", &self.dialog)
            .field("feed_active", &self.is_feed_active())
            .finish()
    }
}

impl Session {
    /// Create a session bound to a transport, an application and a dialog
    pub fn new(
        transport: Arc<dyn Transport>,
        application: impl Into<String>,
        dialog: Dialog,
        event_capacity: usize,
    ) -> ListenerResult<Self> {
        let application = application.into();
        if application.is_empty() {
            return Err(ListenerError::session(&dialog.id, "application name is empty"));
        }
        if dialog.id.is_empty() {
            return Err(ListenerError::session("", "dialog id is empty"));
        }
        if event_capacity == 0 {
            return Err(ListenerError::session(&dialog.id, "event capacity must be non-zero"));
        }

        let (tx, events) = mpsc::channel(event_capacity);
        Ok(Self {
            transport,
            application,
            dialog,
            bus: EventBus { tx },
            events,
            feed: None,
        })
    }

    pub fn dialog(&self) -> &Dialog {
        &self.dialog
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Wait for the next protocol event
    ///
    /// Returns `None` once the feed has stopped and the inbox is drained, or
    /// immediately when no feed was ever attached and nothing is queued.
    pub async fn next_event(&mut self) -> Option<AriMessage> {
        if let Ok(message) = self.events.try_recv() {
            return Some(message);
        }

        let Self { events, feed, .. } = self;
        let feed = feed.as_mut()?;
        if feed.task.is_finished() {
            return events.try_recv().ok();
        }

        tokio::select! {
            message = events.recv() => message,
            _ = &mut feed.task => events.try_recv().ok(),
        }
    }

    /// Take a protocol event if one is already queued
    pub fn try_next_event(&mut self) -> Option<AriMessage> {
        self.events.try_recv().ok()
    }

    /// Consume the session into a stream of protocol events
    ///
    /// The event feed keeps running until the stream is dropped.
    pub fn into_event_stream(self) -> EventStream {
        EventStream {
            inner: ReceiverStream::new(self.events),
            _feed: self.feed,
        }
    }

    /// True while the fan-in task is running
    pub fn is_feed_active(&self) -> bool {
        self.feed
            .as_ref()
            .map(|feed| !feed.task.is_finished())
            .unwrap_or(false)
    }

    /// Start pushing messages from `subscription` into the event bus
    ///
    /// Replaces (and stops) any previously attached feed.
    pub fn attach_feed(
        &mut self,
        subscription: Box<dyn SubscriptionHandle>,
        messages: mpsc::Receiver<InboundMessage>,
        sink: SharedSink,
    ) {
        // Dropping the previous feed cancels it.
        self.feed = None;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_feed(
            self.dialog.id.clone(),
            subscription,
            messages,
            self.bus.clone(),
            cancel.clone(),
            sink,
        ));
        self.feed = Some(EventFeed { cancel, task });
    }

    /// Stop the event feed and wait until its subscription is released
    pub async fn close(mut self) {
        if let Some(mut feed) = self.feed.take() {
            feed.cancel.cancel();
            if !feed.task.is_finished() {
                let _ = (&mut feed.task).await;
            }
        }
    }
}

async fn run_feed(
    dialog_id: String,
    subscription: Box<dyn SubscriptionHandle>,
    mut messages: mpsc::Receiver<InboundMessage>,
    bus: EventBus,
    cancel: CancellationToken,
    sink: SharedSink,
) {
    debug!(dialog = %dialog_id, subject = %subscription.subject(), "event feed started");

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = messages.recv() => msg,
        };
        let Some(msg) = msg else {
            break;
        };

        trace!(dialog = %dialog_id, bytes = msg.payload.len(), "dialog event");
        let message = AriMessage::from_raw(msg.payload);

        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = bus.send(message) => sent.is_ok(),
        };
        if !delivered {
            break;
        }
    }

    let subject = subscription.subject().to_string();
    if let Err(e) = subscription.unsubscribe().await {
        sink.emit(&ListenerEvent::UnsubscribeFailed {
            subject,
            error: e.to_string(),
        });
    }
    debug!(dialog = %dialog_id, "event feed stopped");
}

/// Builds session handles for accepted dialogs
///
/// This is the seam where an ARI client library plugs in; the default factory
/// produces a plain [`Session`].
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    async fn create(
        &self,
        transport: Arc<dyn Transport>,
        application: &str,
        dialog: &Dialog,
    ) -> ListenerResult<Session>;
}

/// Factory producing plain sessions with a fixed event capacity
#[derive(Debug, Clone, Copy)]
pub struct DefaultSessionFactory {
    event_capacity: usize,
}

impl DefaultSessionFactory {
    pub fn new(event_capacity: usize) -> Self {
        Self { event_capacity }
    }
}

impl Default for DefaultSessionFactory {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl SessionFactory for DefaultSessionFactory {
    async fn create(
        &self,
        transport: Arc<dyn Transport>,
        application: &str,
        dialog: &Dialog,
    ) -> ListenerResult<Session> {
        Session::new(transport, application, dialog.clone(), self.event_capacity)
    }
}
