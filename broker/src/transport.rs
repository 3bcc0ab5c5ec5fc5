//! Publish/subscribe transport abstraction and its in-process implementation.

use crate::error::{transport_error, Error, TransportErrorKind};
use async_trait::async_trait;
use dashmap::DashMap;
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Default per-subscription queue depth of [`MemoryTransport`].
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 1024;

/// A payload received on one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub channel: String,
    pub payload: String,
}

/// Receiving end of a subscription. Yields `None` once the transport closes.
pub struct Subscription {
    receiver: mpsc::Receiver<Message>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<Message>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

/// The pub/sub surface the broker needs. Delivery is best effort and non-durable.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hands `payload` to every current subscriber of `channel`. Does not wait for
    /// subscribers to process it.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), Error>;

    /// Opens one subscription covering all of `channels`.
    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, Error>;

    /// Ends every open subscription and rejects further publishes.
    async fn close(&self);
}

/// In-process transport: each subscription owns a bounded queue and publishing
/// uses `try_send`, so one slow subscriber drops its own messages instead of
/// stalling every publisher.
pub struct MemoryTransport {
    channels: DashMap<String, Vec<mpsc::Sender<Message>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIPTION_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live subscriptions attached to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), Error> {
        if self.is_closed() {
            return Err(transport_error(
                TransportErrorKind::Closed,
                "publish on closed transport",
            ));
        }

        let Some(mut subscribers) = self.channels.get_mut(channel) else {
            trace!("No subscribers on channel {channel}, message discarded");
            return Ok(());
        };

        let message = Message {
            channel: channel.to_string(),
            payload,
        };
        subscribers.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Subscriber queue full on channel {channel}, message dropped");
                true
            }
            // Receiver is gone, prune it.
            Err(TrySendError::Closed(_)) => false,
        });

        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, Error> {
        if self.is_closed() {
            return Err(transport_error(
                TransportErrorKind::Subscribe,
                "subscribe on closed transport",
            ));
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        for channel in channels {
            self.channels
                .entry(channel.clone())
                .or_default()
                .push(tx.clone());
        }
        debug!("Memory transport subscription opened for {channels:?}");

        Ok(Subscription::new(rx))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the senders ends every subscription's receive loop.
        self.channels.clear();
        debug!("Memory transport closed");
    }
}
