//! Diagnostic events emitted by the listener
//!
//! Failures the listener cannot return to its caller (reply publishes, session
//! construction, unsubscribe at shutdown) are described here and handed to a
//! [`DiagnosticSink`]. Control flow does not depend on the sink.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Why a listen loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The cancellation token fired
    Cancelled,
    /// The transport closed the intake channel
    ChannelClosed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

/// Lifecycle and failure events of a listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// The application-start queue subscription is active
    Subscribed {
        subject: String,
        queue_group: String,
    },

    /// A notification could not be decoded; the error text goes back to the requester
    NotificationRejected {
        subject: String,
        reply: Option<String>,
        error: String,
    },

    /// Publishing an error reply failed
    ErrorReplyFailed {
        reply: Option<String>,
        error: String,
    },

    /// The "ok" acknowledgment was published
    Acknowledged { dialog_id: String, reply: String },

    /// The acknowledgment could not be published; no session is created
    AckFailed {
        dialog_id: String,
        reply: Option<String>,
        error: String,
    },

    /// The notification names a different application than the listener serves
    ApplicationMismatch {
        dialog_id: String,
        expected: String,
        received: String,
    },

    /// A session handle could not be built after acknowledging
    SessionFailed { dialog_id: String, error: String },

    /// The per-dialog event subscription could not be established
    EventFeedFailed {
        dialog_id: String,
        subject: String,
        error: String,
    },

    /// The handler returned
    HandlerCompleted { dialog_id: String },

    /// The handler panicked
    HandlerPanicked { dialog_id: String },

    /// The in-flight bound was reached and the notification was turned away
    OverflowRejected {
        dialog_id: String,
        reply: Option<String>,
    },

    /// Releasing a subscription failed
    UnsubscribeFailed { subject: String, error: String },

    /// The listen loop exited
    Stopped { subject: String, reason: StopReason },
}

impl ListenerEvent {
    /// Short machine-friendly name of the event
    pub fn name(&self) -> &'static str {
        match self {
            ListenerEvent::Subscribed { .. } => "subscribed",
            ListenerEvent::NotificationRejected { .. } => "notification_rejected",
            ListenerEvent::ErrorReplyFailed { .. } => "error_reply_failed",
            ListenerEvent::Acknowledged { .. } => "acknowledged",
            ListenerEvent::AckFailed { .. } => "ack_failed",
            ListenerEvent::ApplicationMismatch { .. } => "application_mismatch",
            ListenerEvent::SessionFailed { .. } => "session_failed",
            ListenerEvent::EventFeedFailed { .. } => "event_feed_failed",
            ListenerEvent::HandlerCompleted { .. } => "handler_completed",
            ListenerEvent::HandlerPanicked { .. } => "handler_panicked",
            ListenerEvent::OverflowRejected { .. } => "overflow_rejected",
            ListenerEvent::UnsubscribeFailed { .. } => "unsubscribe_failed",
            ListenerEvent::Stopped { .. } => "stopped",
        }
    }

    /// True for events that describe a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ListenerEvent::NotificationRejected { .. }
                | ListenerEvent::ErrorReplyFailed { .. }
                | ListenerEvent::AckFailed { .. }
                | ListenerEvent::SessionFailed { .. }
                | ListenerEvent::EventFeedFailed { .. }
                | ListenerEvent::HandlerPanicked { .. }
                | ListenerEvent::OverflowRejected { .. }
                | ListenerEvent::UnsubscribeFailed { .. }
        )
    }
}

/// Receiver of listener diagnostics
pub trait DiagnosticSink: Send + Sync + 'static {
    fn emit(&self, event: &ListenerEvent);
}

/// Shared diagnostic sink
pub type SharedSink = Arc<dyn DiagnosticSink>;

/// Sink that writes every event to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, event: &ListenerEvent) {
        match event {
            ListenerEvent::Subscribed { subject, queue_group } => {
                info!(subject = %subject, queue_group = %queue_group, "listening for application starts");
            }
            ListenerEvent::NotificationRejected { subject, reply, error } => {
                warn!(subject = %subject, reply = ?reply, error = %error, "malformed application start");
            }
            ListenerEvent::ErrorReplyFailed { reply, error } => {
                warn!(reply = ?reply, error = %error, "failed to send error reply");
            }
            ListenerEvent::Acknowledged { dialog_id, reply } => {
                debug!(dialog = %dialog_id, reply = %reply, "application start acknowledged");
            }
            ListenerEvent::AckFailed { dialog_id, reply, error } => {
                error!(dialog = %dialog_id, reply = ?reply, error = %error, "failed to acknowledge application start");
            }
            ListenerEvent::ApplicationMismatch { dialog_id, expected, received } => {
                warn!(dialog = %dialog_id, expected = %expected, received = %received, "application start for another application");
            }
            ListenerEvent::SessionFailed { dialog_id, error } => {
                error!(dialog = %dialog_id, error = %error, "failed to create session after acknowledgment");
            }
            ListenerEvent::EventFeedFailed { dialog_id, subject, error } => {
                error!(dialog = %dialog_id, subject = %subject, error = %error, "failed to subscribe to dialog events");
            }
            ListenerEvent::HandlerCompleted { dialog_id } => {
                debug!(dialog = %dialog_id, "handler completed");
            }
            ListenerEvent::HandlerPanicked { dialog_id } => {
                error!(dialog = %dialog_id, "handler panicked");
            }
            ListenerEvent::OverflowRejected { dialog_id, reply } => {
                warn!(dialog = %dialog_id, reply = ?reply, "listener at capacity, rejecting");
            }
            ListenerEvent::UnsubscribeFailed { subject, error } => {
                warn!(subject = %subject, error = %error, "failed to unsubscribe");
            }
            ListenerEvent::Stopped { subject, reason } => {
                info!(subject = %subject, reason = %reason, "listener stopped");
            }
        }
    }
}

/// Sink that forwards copies of every event to a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ListenerEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DiagnosticSink for ChannelSink {
    fn emit(&self, event: &ListenerEvent) {
        // Receiver gone means nobody is watching any more.
        let _ = self.tx.send(event.clone());
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn emit(&self, _event: &ListenerEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(&ListenerEvent::HandlerCompleted {
            dialog_id: "d1".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "handler_completed");
        assert!(!event.is_failure());
    }

    #[test]
    fn test_channel_sink_without_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(&ListenerEvent::HandlerPanicked {
            dialog_id: "d1".to_string(),
        });
    }

    #[test]
    fn test_failure_classification() {
        let event = ListenerEvent::SessionFailed {
            dialog_id: "d1".to_string(),
            error: "boom".to_string(),
        };
        assert!(event.is_failure());
        assert!(!ListenerEvent::Stopped {
            subject: "ari.app.a".to_string(),
            reason: StopReason::Cancelled,
        }
        .is_failure());
    }
}
