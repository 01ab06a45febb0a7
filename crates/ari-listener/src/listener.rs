//! Application-start listener
//!
//! Joins the application's queue group, acknowledges each application-start
//! notification on its reply subject, builds a [`Session`] for the dialog,
//! attaches the dialog's event feed and hands the session to the caller's
//! [`SessionHandler`].
//!
//! Per notification the order is fixed: acknowledgment, then session
//! construction, then event subscription, then the handler. Notifications are
//! handled concurrently with each other and with the listen loop. Setup work
//! (acknowledgment, session construction, event subscription) is bounded by
//! [`ListenerConfig::max_in_flight`]; handlers themselves are not.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::config::{validate_application, ListenerConfig, OverflowPolicy};
use crate::diagnostics::{ListenerEvent, SharedSink, StopReason, TracingSink};
use crate::dialog::{AppStart, Dialog};
use crate::error::{ListenerError, ListenerResult, TransportError};
use crate::session::{DefaultSessionFactory, Session, SessionFactory};
use crate::transport::{InboundMessage, Transport};

/// Acknowledgment payload for an accepted notification
pub const ACK_PAYLOAD: &[u8] = b"ok";

/// Reply sent when the in-flight bound is reached under [`OverflowPolicy::Reject`]
pub const CAPACITY_REPLY: &str = "listener at capacity";

/// Application logic invoked once per accepted dialog
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn handle(&self, session: Session, dialog: Dialog);
}

#[async_trait]
impl<F, Fut> SessionHandler for F
where
    F: Fn(Session, Dialog) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, session: Session, dialog: Dialog) {
        (self)(session, dialog).await
    }
}

/// Builder for [`Listener`]
pub struct ListenerBuilder {
    transport: Arc<dyn Transport>,
    application: String,
    config: ListenerConfig,
    factory: Option<Arc<dyn SessionFactory>>,
    sink: SharedSink,
}

impl ListenerBuilder {
    /// Start a builder for `application` on `transport`
    pub fn new(transport: Arc<dyn Transport>, application: impl Into<String>) -> Self {
        Self {
            transport,
            application: application.into(),
            config: ListenerConfig::default(),
            factory: None,
            sink: Arc::new(TracingSink),
        }
    }

    /// Replace the configuration
    pub fn config(mut self, config: ListenerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom session factory
    pub fn session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Route diagnostics to `sink` instead of `tracing`
    pub fn diagnostics(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Validate and build the listener
    pub fn build(self) -> ListenerResult<Listener> {
        validate_application(&self.application)?;
        self.config.validate()?;

        let factory: Arc<dyn SessionFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(DefaultSessionFactory::new(self.config.session_event_capacity)),
        };
        let limiter = match self.config.max_in_flight {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        Ok(Listener {
            inner: Arc::new(Inner {
                transport: self.transport,
                application: self.application,
                config: self.config,
                factory,
                sink: self.sink,
                limiter,
            }),
        })
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    application: String,
    config: ListenerConfig,
    factory: Arc<dyn SessionFactory>,
    sink: SharedSink,
    limiter: Option<Arc<Semaphore>>,
}

/// Queue-group listener for one application
#[derive(Clone)]
pub struct Listener {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("application", &self.inner.application)
            .field("config", &self.inner.config)
            .finish()
    }
}

enum Admission {
    Admitted(Option<OwnedSemaphorePermit>),
    Rejected,
    Cancelled,
}

impl Listener {
    pub fn builder(transport: Arc<dyn Transport>, application: impl Into<String>) -> ListenerBuilder {
        ListenerBuilder::new(transport, application)
    }

    pub fn application(&self) -> &str {
        &self.inner.application
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.inner.config
    }

    /// Number of request sequences still being set up (bounded listeners only)
    pub fn in_flight(&self) -> Option<usize> {
        self.inner
            .limiter
            .as_ref()
            .map(|sem| self.inner.config.max_in_flight - sem.available_permits())
    }

    /// Run `listen` on a new task
    pub fn spawn<H: SessionHandler>(
        &self,
        cancel: CancellationToken,
        handler: H,
    ) -> JoinHandle<ListenerResult<()>> {
        let listener = self.clone();
        tokio::spawn(async move { listener.listen(cancel, handler).await })
    }

    /// Listen until `cancel` fires or the transport closes the subscription
    ///
    /// Only a failure to establish the queue subscription is returned; every
    /// later failure goes to the diagnostic sink. The subscription is released
    /// before returning. Request sequences already started keep running.
    pub async fn listen<H: SessionHandler>(
        &self,
        cancel: CancellationToken,
        handler: H,
    ) -> ListenerResult<()> {
        let inner = &self.inner;
        let subject = inner.config.subjects.app_subject(&inner.application);
        let queue_group = inner.config.subjects.queue_group(&inner.application);

        let (tx, mut intake) = mpsc::channel(inner.config.intake_capacity);
        let subscription = inner
            .transport
            .queue_subscribe(&subject, &queue_group, tx)
            .await
            .map_err(|source| ListenerError::Subscribe {
                subject: subject.clone(),
                source,
            })?;

        inner.sink.emit(&ListenerEvent::Subscribed {
            subject: subject.clone(),
            queue_group,
        });

        let handler: Arc<dyn SessionHandler> = Arc::new(handler);
        let reason = self.run(&cancel, &mut intake, &handler).await;

        if let Err(e) = subscription.unsubscribe().await {
            inner.sink.emit(&ListenerEvent::UnsubscribeFailed {
                subject: subject.clone(),
                error: e.to_string(),
            });
        }
        inner.sink.emit(&ListenerEvent::Stopped { subject, reason });
        Ok(())
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        intake: &mut mpsc::Receiver<InboundMessage>,
        handler: &Arc<dyn SessionHandler>,
    ) -> StopReason {
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StopReason::Cancelled,
                msg = intake.recv() => msg,
            };
            let Some(msg) = msg else {
                return StopReason::ChannelClosed;
            };

            let start = match AppStart::decode(&msg.payload) {
                Ok(start) => start,
                Err(e) => {
                    let error = e.to_string();
                    self.inner.sink.emit(&ListenerEvent::NotificationRejected {
                        subject: msg.subject.clone(),
                        reply: msg.reply.clone(),
                        error: error.clone(),
                    });
                    self.spawn_error_reply(msg.reply, error);
                    continue;
                }
            };

            let permit = match self.admit(cancel).await {
                Admission::Admitted(permit) => permit,
                Admission::Rejected => {
                    self.inner.sink.emit(&ListenerEvent::OverflowRejected {
                        dialog_id: start.dialog_id.clone(),
                        reply: msg.reply.clone(),
                    });
                    self.spawn_error_reply(msg.reply, CAPACITY_REPLY.to_string());
                    continue;
                }
                Admission::Cancelled => return StopReason::Cancelled,
            };

            let inner = Arc::clone(&self.inner);
            let handler = Arc::clone(handler);
            let span = info_span!("app_start", dialog = %start.dialog_id, app = %inner.application);
            tokio::spawn(
                async move { inner.handle_request(msg.reply, start, handler, permit).await }
                .instrument(span),
            );
        }
    }

    async fn admit(&self, cancel: &CancellationToken) -> Admission {
        let Some(limiter) = &self.inner.limiter else {
            return Admission::Admitted(None);
        };

        match self.inner.config.overflow {
            OverflowPolicy::Reject => match Arc::clone(limiter).try_acquire_owned() {
                Ok(permit) => Admission::Admitted(Some(permit)),
                Err(_) => Admission::Rejected,
            },
            OverflowPolicy::Wait => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Admission::Cancelled,
                    permit = Arc::clone(limiter).acquire_owned() => match permit {
                        Ok(permit) => Admission::Admitted(Some(permit)),
                        // The semaphore is never closed.
                        Err(_) => Admission::Rejected,
                    },
                }
            }
        }
    }

    fn spawn_error_reply(&self, reply: Option<String>, error: String) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.reply(reply.as_deref(), Bytes::from(error)).await {
                inner.sink.emit(&ListenerEvent::ErrorReplyFailed {
                    reply,
                    error: e.to_string(),
                });
            }
        });
    }
}

impl Inner {
    async fn reply(&self, reply: Option<&str>, payload: Bytes) -> Result<(), TransportError> {
        match reply {
            Some(subject) if !subject.is_empty() => self.transport.publish(subject, payload).await,
            _ => Err(TransportError::MissingReply),
        }
    }

    async fn handle_request(
        &self,
        reply: Option<String>,
        start: AppStart,
        handler: Arc<dyn SessionHandler>,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        if let Err(e) = self.reply(reply.as_deref(), Bytes::from_static(ACK_PAYLOAD)).await {
            self.sink.emit(&ListenerEvent::AckFailed {
                dialog_id: start.dialog_id,
                reply,
                error: e.to_string(),
            });
            return;
        }
        self.sink.emit(&ListenerEvent::Acknowledged {
            dialog_id: start.dialog_id.clone(),
            reply: reply.unwrap_or_default(),
        });

        if !start.application.is_empty() && start.application != self.application {
            self.sink.emit(&ListenerEvent::ApplicationMismatch {
                dialog_id: start.dialog_id.clone(),
                expected: self.application.clone(),
                received: start.application.clone(),
            });
        }

        let dialog = Dialog::from(&start);

        let mut session = match self
            .factory
            .create(Arc::clone(&self.transport), &self.application, &dialog)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.sink.emit(&ListenerEvent::SessionFailed {
                    dialog_id: dialog.id,
                    error: e.to_string(),
                });
                return;
            }
        };

        let events_subject = self.config.subjects.dialog_subject(&dialog.id);
        let (tx, rx) = mpsc::channel(self.config.session_intake_capacity);
        match self.transport.subscribe(&events_subject, tx).await {
            Ok(subscription) => session.attach_feed(subscription, rx, Arc::clone(&self.sink)),
            Err(e) => self.sink.emit(&ListenerEvent::EventFeedFailed {
                dialog_id: dialog.id.clone(),
                subject: events_subject,
                error: e.to_string(),
            }),
        }

        debug!(dialog = %dialog.id, channel = %dialog.channel_id, "dispatching session");

        let dialog_id = dialog.id.clone();
        let task = tokio::spawn(async move { handler.handle(session, dialog).await });
        // The slot covers setup only; a handler may run for the whole call.
        drop(permit);

        match task.await {
            Ok(()) => self.sink.emit(&ListenerEvent::HandlerCompleted { dialog_id }),
            Err(e) if e.is_panic() => self.sink.emit(&ListenerEvent::HandlerPanicked { dialog_id }),
            Err(_) => {}
        }
    }
}

/// Listen for application starts of `application` with default settings
///
/// Diagnostics go to `tracing`. Returns once `cancel` fires or the transport
/// closes the subscription.
pub async fn listen<H: SessionHandler>(
    cancel: CancellationToken,
    transport: Arc<dyn Transport>,
    application: &str,
    handler: H,
) -> ListenerResult<()> {
    Listener::builder(transport, application)
        .build()?
        .listen(cancel, handler)
        .await
}
