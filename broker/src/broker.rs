use crate::actions::{ActionHandler, ActionRegistry};
use crate::context::{Context, Responder};
use crate::error::{request_error, Error, RequestErrorKind};
use crate::pending::PendingTable;
use crate::transport::{Subscription, Transport};
use crate::{BROADCAST_CHANNEL, REPLY_CHANNEL};
use async_trait::async_trait;
use envelope::Envelope;
use log::*;
use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Default interval of the pending-request sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Channel handler replies are published on.
    pub reply_channel: String,
    /// Channel handler events are published on.
    pub broadcast_channel: String,
    /// How often expired pending requests are evicted.
    pub sweep_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            reply_channel: REPLY_CHANNEL.to_string(),
            broadcast_channel: BROADCAST_CHANNEL.to_string(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Receiver for envelopes arriving on a subscription that are not claimed by a
/// pending request. The hub implements this to deliver replies and events to sockets.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn accept(&self, envelope: Envelope);
}

/// What a subscription loop does with envelopes nobody is waiting for.
#[derive(Clone)]
enum Dispatch {
    Actions,
    Sink(Arc<dyn EnvelopeSink>),
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: BrokerConfig,
    pending: PendingTable,
    actions: ActionRegistry,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Request/reply/broadcast façade over a [`Transport`]. Cheap to clone; clones share
/// the pending table, handlers and subscriptions.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    /// Creates a broker and starts its pending-request sweep. Must be called from
    /// within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: BrokerConfig) -> Self {
        let inner = Arc::new(Inner {
            transport,
            config,
            pending: PendingTable::default(),
            actions: ActionRegistry::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let sweeper = tokio::spawn(sweep_pending(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            inner.config.sweep_interval,
        ));
        let broker = Self { inner };
        broker.track(sweeper);
        broker
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.inner.actions
    }

    /// Number of correlated requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Serializes `envelope` and hands it to the transport. Does not wait for delivery.
    pub async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<(), Error> {
        let payload = envelope.to_json()?;
        trace!("Publishing {} ({}) on {channel}", envelope.action, envelope.id);
        self.inner.transport.publish(channel, payload).await
    }

    /// Registers the handler for `action`. The last registration for an action wins.
    pub fn on<H>(&self, action: impl Into<String>, handler: H)
    where
        H: ActionHandler + 'static,
    {
        self.inner.actions.on(action, handler);
    }

    /// Starts a receive loop over `channels` that correlates replies with pending
    /// requests and dispatches everything else to the registered action handlers.
    pub async fn subscribe(&self, channels: &[&str]) -> Result<(), Error> {
        self.start_loop(channels, Dispatch::Actions).await
    }

    /// Like [`subscribe`](Broker::subscribe), but envelopes not claimed by a pending
    /// request go to `sink` instead of the action handlers.
    pub async fn subscribe_with(
        &self,
        channels: &[&str],
        sink: Arc<dyn EnvelopeSink>,
    ) -> Result<(), Error> {
        self.start_loop(channels, Dispatch::Sink(sink)).await
    }

    async fn start_loop(&self, channels: &[&str], dispatch: Dispatch) -> Result<(), Error> {
        let channels: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        let subscription = self.inner.transport.subscribe(&channels).await?;
        info!("Subscribed to {channels:?}");

        let handle = tokio::spawn(self.clone().receive_loop(subscription, dispatch));
        self.track(handle);
        Ok(())
    }

    async fn receive_loop(self, mut subscription: Subscription, dispatch: Dispatch) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = subscription.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let envelope = match Envelope::from_json(&message.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("Dropping malformed message on {}: {e}", message.channel);
                    continue;
                }
            };

            self.route(envelope, &dispatch).await;
        }
        debug!("Subscription loop exited");
    }

    async fn route(&self, envelope: Envelope, dispatch: &Dispatch) {
        let envelope = match self.inner.pending.resolve(envelope) {
            Ok(()) => return,
            Err(unclaimed) => unclaimed,
        };

        match dispatch {
            Dispatch::Sink(sink) => sink.accept(envelope).await,
            Dispatch::Actions => {
                let action = envelope.action.clone();
                if !self.inner.actions.dispatch(envelope, self.context()) {
                    trace!("No handler for action {action}, message dropped");
                }
            }
        }
    }

    /// Publishes `envelope` on `channel` and waits for the reply that names its id,
    /// for `timeout`, or for shutdown, whichever comes first.
    ///
    /// The reply only arrives if this broker is subscribed to the channel the responder
    /// publishes on (the reply channel for handlers running on another broker). Once the
    /// call returns, its pending entry is gone and a late reply is dropped.
    pub async fn request(
        &self,
        channel: &str,
        mut envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, Error> {
        if self.is_shut_down() {
            return Err(request_error(
                RequestErrorKind::Shutdown,
                "broker is shut down",
            ));
        }
        if envelope.id.is_empty() {
            envelope.id = Envelope::generate_id();
        }

        let id = envelope.id.clone();
        let slot = self.inner.pending.register(id.clone(), timeout);

        if let Err(e) = self.publish(channel, &envelope).await {
            self.inner.pending.cancel(&id);
            return Err(e);
        }

        tokio::select! {
            reply = slot => match reply {
                Ok(reply) => Ok(reply),
                // The slot was dropped by the sweep or by shutdown.
                Err(_) if self.is_shut_down() => {
                    Err(request_error(RequestErrorKind::Shutdown, &id))
                }
                Err(_) => Err(request_error(RequestErrorKind::Timeout, &id)),
            },
            _ = tokio::time::sleep(timeout) => {
                self.inner.pending.cancel(&id);
                debug!("Request {id} on {channel} timed out after {timeout:?}");
                Err(request_error(RequestErrorKind::Timeout, &id))
            }
            _ = self.inner.shutdown.cancelled() => {
                self.inner.pending.cancel(&id);
                Err(request_error(RequestErrorKind::Shutdown, &id))
            }
        }
    }

    pub async fn reply<T>(&self, channel: &str, original: &Envelope, data: &T) -> Result<(), Error>
    where
        T: Serialize + ?Sized + Sync,
    {
        let envelope = Envelope::reply(original, data)?;
        self.publish(channel, &envelope).await
    }

    pub async fn reply_error(
        &self,
        channel: &str,
        original: &Envelope,
        code: u16,
        message: &str,
    ) -> Result<(), Error> {
        let envelope = Envelope::error(original, code, message);
        self.publish(channel, &envelope).await
    }

    pub async fn broadcast<T>(
        &self,
        channel: &str,
        action: &str,
        service: &str,
        data: &T,
    ) -> Result<(), Error>
    where
        T: Serialize + ?Sized + Sync,
    {
        let envelope = Envelope::event(action, service, data)?;
        self.publish(channel, &envelope).await
    }

    /// Handler context that answers on this broker's reply and broadcast channels.
    pub fn context(&self) -> Context {
        Context::new(Arc::new(self.clone()))
    }

    /// Cancels every subscription loop and blocked `request`, waits for the loops to
    /// exit, then closes the transport.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Broker shutting down");
        self.inner.shutdown.cancel();

        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Broker task ended abnormally: {e}");
            }
        }

        self.inner.pending.clear();
        self.inner.transport.close().await;
        info!("Broker shut down");
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.inner.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }
}

#[async_trait]
impl Responder for Broker {
    async fn send_reply(&self, envelope: Envelope) -> Result<(), Error> {
        self.publish(&self.inner.config.reply_channel, &envelope)
            .await
    }

    async fn send_event(&self, envelope: Envelope) -> Result<(), Error> {
        self.publish(&self.inner.config.broadcast_channel, &envelope)
            .await
    }
}

/// Evicts pending requests whose waiter never cleaned up. The per-request timer is
/// what normally expires a request; this only bounds growth from abandoned waiters.
async fn sweep_pending(inner: Weak<Inner>, shutdown: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let evicted = inner.pending.sweep(Instant::now());
                if evicted > 0 {
                    debug!("Evicted {evicted} expired pending request(s)");
                }
            }
        }
    }
}
