//! # ARI Listener
//!
//! Event-dispatch front end for ARI applications reached over a pub/sub
//! transport. The ARI proxy publishes an application-start notification
//! whenever a call needs an application; this crate joins the application's
//! queue group, acknowledges each notification, builds a session for the new
//! dialog and runs the caller's handler with it while the dialog's protocol
//! events keep flowing into the session.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ari_listener::{setup_logging, Dialog, Listener, ListenerConfig, MemoryTransport, Session};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // ARI_LISTENER_LOG_LEVEL=debug, ARI_LISTENER_MAX_IN_FLIGHT=16, ...
//!     let config = ListenerConfig::from_env()?;
//!     setup_logging(&config.logging)?;
//!
//!     let transport = Arc::new(MemoryTransport::new());
//!     let listener = Listener::builder(transport, "ivr").config(config).build()?;
//!
//!     let cancel = CancellationToken::new();
//!     listener
//!         .listen(cancel, |mut session: Session, dialog: Dialog| async move {
//!             tracing::info!(dialog = %dialog.id, "new dialog");
//!             while let Some(event) = session.next_event().await {
//!                 tracing::info!(kind = ?event.message_type(), "event");
//!             }
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! [`listen`] is the shorthand for a listener with default configuration.
//!
//! ## Subjects
//!
//! | Purpose | Default subject |
//! |---|---|
//! | Application starts | `ari.app.<application>` (queue group `<application>_app_listener`) |
//! | Dialog events | `events.dialog.<dialog id>` |
//!
//! Both are configurable through [`SubjectConfig`].

pub mod config;
pub mod diagnostics;
pub mod dialog;
pub mod error;
pub mod listener;
pub mod logging;
pub mod session;
pub mod transport;

// Re-export main types
pub use config::{ListenerConfig, OverflowPolicy, SubjectConfig};
pub use diagnostics::{ChannelSink, DiagnosticSink, ListenerEvent, NullSink, StopReason, TracingSink};
pub use dialog::{AppStart, Dialog};
pub use error::{ListenerError, ListenerResult, TransportError, TransportResult};
pub use listener::{listen, Listener, ListenerBuilder, SessionHandler, ACK_PAYLOAD};
pub use logging::{setup_logging, LoggingConfig};
pub use session::{AriMessage, DefaultSessionFactory, EventStream, Session, SessionFactory};
pub use transport::{InboundMessage, MemoryTransport, SubscriptionHandle, Transport};

#[cfg(feature = "nats")]
pub use transport::NatsTransport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
