//! Error types for the ARI listener
//!
//! Only [`ListenerError::Subscribe`] ever escapes a running listener. Everything
//! else that fails while serving notifications is reported through the
//! diagnostic sink (see [`crate::diagnostics`]) and absorbed.

use thiserror::Error;

/// Result type for listener operations
pub type ListenerResult<T> = Result<T, ListenerError>;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by a pub/sub transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection (or in-process broker) has been closed
    #[error("transport closed")]
    Closed,

    /// A subscription could not be established
    #[error("unable to subscribe to '{subject}': {reason}")]
    Subscribe { subject: String, reason: String },

    /// A publish was rejected
    #[error("unable to publish to '{subject}': {reason}")]
    Publish { subject: String, reason: String },

    /// Releasing a subscription failed
    #[error("unable to unsubscribe from '{subject}': {reason}")]
    Unsubscribe { subject: String, reason: String },

    /// The inbound message carried no reply subject to answer on
    #[error("message has no reply subject")]
    MissingReply,
}

/// Errors raised by the listener and the session layer
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The application-start queue subscription could not be established
    #[error("unable to subscribe to ARI application start queue '{subject}': {source}")]
    Subscribe {
        subject: String,
        #[source]
        source: TransportError,
    },

    /// Application name does not fit the subject scheme
    #[error("invalid application name '{name}': {reason}")]
    InvalidApplication { name: String, reason: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A session handle could not be built for a dialog
    #[error("session error for dialog '{dialog_id}': {message}")]
    Session { dialog_id: String, message: String },

    /// Transport error outside of the initial subscription
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Logging could not be initialised
    #[error("logging error: {message}")]
    Logging { message: String },
}

impl ListenerError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a session construction error
    pub fn session(dialog_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Session {
            dialog_id: dialog_id.into(),
            message: message.into(),
        }
    }

    /// Create an invalid application error
    pub fn invalid_application(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidApplication {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
