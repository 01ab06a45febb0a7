//! NATS transport backed by `async-nats`
//!
//! Each subscription gets a forwarding task that moves messages from the NATS
//! subscriber into the caller's bounded channel. Releasing the handle stops
//! the task and unsubscribes on the server.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{InboundMessage, SubscriptionHandle, Transport};
use crate::error::{TransportError, TransportResult};

type StopSignal = oneshot::Sender<oneshot::Sender<TransportResult<()>>>;

/// Transport over a NATS connection
#[derive(Clone)]
pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    /// Wrap an existing client
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// Connect to a NATS server
    pub async fn connect(url: &str) -> TransportResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::Subscribe {
                subject: url.to_string(),
                reason: e.to_string(),
            })?;
        debug!(url = %url, "connected to NATS");
        Ok(Self { client })
    }

    /// Underlying client
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    fn forward(
        subject: &str,
        mut subscriber: async_nats::Subscriber,
        sink: mpsc::Sender<InboundMessage>,
    ) -> Box<dyn SubscriptionHandle> {
        let (stop_tx, mut stop_rx) = oneshot::channel::<oneshot::Sender<TransportResult<()>>>();
        let subject_name = subject.to_string();

        tokio::spawn(async move {
            let ack = loop {
                let next = tokio::select! {
                    biased;
                    ack = &mut stop_rx => break ack.ok(),
                    next = subscriber.next() => next,
                };

                let Some(msg) = next else {
                    return;
                };

                let inbound = InboundMessage {
                    subject: msg.subject.to_string(),
                    reply: msg.reply.map(|r| r.to_string()),
                    payload: msg.payload,
                };

                tokio::select! {
                    biased;
                    ack = &mut stop_rx => break ack.ok(),
                    sent = sink.send(inbound) => {
                        if sent.is_err() {
                            break None;
                        }
                    }
                }
            };

            let result = subscriber
                .unsubscribe()
                .await
                .map_err(|e| TransportError::Unsubscribe {
                    subject: subject_name.clone(),
                    reason: e.to_string(),
                });

            match ack {
                Some(ack) => {
                    let _ = ack.send(result);
                }
                None => {
                    if let Err(e) = result {
                        warn!(subject = %subject_name, error = %e, "unsubscribe after receiver drop failed");
                    }
                }
            }
        });

        Box::new(NatsSubscription {
            subject: subject.to_string(),
            stop: Some(stop_tx),
        })
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        sink: mpsc::Sender<InboundMessage>,
    ) -> TransportResult<Box<dyn SubscriptionHandle>> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), queue_group.to_string())
            .await
            .map_err(|e| TransportError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::forward(subject, subscriber, sink))
    }

    async fn subscribe(
        &self,
        subject: &str,
        sink: mpsc::Sender<InboundMessage>,
    ) -> TransportResult<Box<dyn SubscriptionHandle>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| TransportError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::forward(subject, subscriber, sink))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()> {
        if subject.is_empty() {
            return Err(TransportError::MissingReply);
        }
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| TransportError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }
}

struct NatsSubscription {
    subject: String,
    stop: Option<StopSignal>,
}

#[async_trait]
impl SubscriptionHandle for NatsSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn unsubscribe(self: Box<Self>) -> TransportResult<()> {
        let NatsSubscription { stop, .. } = *self;
        let Some(stop) = stop else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if stop.send(ack_tx).is_err() {
            // Forwarding task already finished and released the subscriber.
            return Ok(());
        }
        ack_rx.await.unwrap_or(Ok(()))
    }
}
