use crate::connection::{Connection, ConnectionId, ConnectionRegistry};
use crate::routes::RouteTable;
use async_trait::async_trait;
use broker::{
    service_channel, ActionHandler, ActionRegistry, Broker, Context, EnvelopeSink, Responder,
};
use envelope::{Envelope, Identity, UserId};
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::*;
use serde::Serialize;
use serde_json::json;
use std::fmt::Display;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Liveness probe sent by clients; answered without touching the broker.
pub const PING_ACTION: &str = "ping";
pub const PONG_ACTION: &str = "pong";
/// Presence event broadcast after every connect and disconnect.
pub const PRESENCE_ACTION: &str = "userCount";
/// Service name on events the hub produces itself.
pub const SYSTEM_SERVICE: &str = "system";

/// Upper bound on flushing the close frame to a peer that stopped reading.
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// What to do with a reply whose origin route is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyFallback {
    /// Deliver to every live connection of the reply's `user_id`.
    #[default]
    User,
    /// Drop it.
    Drop,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub reply_fallback: ReplyFallback,
    /// Age after which an unanswered request route is swept.
    pub route_ttl: Duration,
    /// Route table size above which the sweep resets it entirely.
    pub route_table_ceiling: usize,
    pub route_sweep_interval: Duration,
    /// Frames queued per connection before a write counts as failed.
    pub outbound_buffer: usize,
    pub announce_presence: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            reply_fallback: ReplyFallback::User,
            route_ttl: Duration::from_secs(120),
            route_table_ceiling: 10_000,
            route_sweep_interval: Duration::from_secs(120),
            outbound_buffer: 256,
            announce_presence: true,
        }
    }
}

/// Point-in-time connection figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStatus {
    /// Live connections, anonymous included.
    pub clients: usize,
    /// Distinct authenticated users with at least one live connection.
    pub authenticated: usize,
}

struct Inner {
    config: HubConfig,
    registry: ConnectionRegistry,
    routes: RouteTable,
    actions: ActionRegistry,
    broker: OnceLock<Broker>,
    shutdown: CancellationToken,
}

/// Owner of every live client connection and of the decision which socket receives
/// an outbound envelope. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: ConnectionRegistry::new(),
                routes: RouteTable::default(),
                actions: ActionRegistry::new(),
                broker: OnceLock::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Registers a handler the hub runs in-process. A local handler takes precedence
    /// over forwarding by `service`.
    pub fn on<H>(&self, action: impl Into<String>, handler: H)
    where
        H: ActionHandler + 'static,
    {
        self.inner.actions.on(action, handler);
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.inner.actions
    }

    /// Forwards requests naming a `service` through `broker`, and subscribes the hub
    /// to the broker's reply and broadcast channels for the way back.
    pub async fn attach(&self, broker: Broker) -> Result<(), broker::Error> {
        if self.inner.broker.get().is_some() {
            warn!("Hub is already attached to a broker, ignoring");
            return Ok(());
        }

        let channels = [
            broker.config().reply_channel.clone(),
            broker.config().broadcast_channel.clone(),
        ];
        let channels: Vec<&str> = channels.iter().map(String::as_str).collect();
        broker
            .subscribe_with(&channels, Arc::new(self.clone()))
            .await?;

        if self.inner.broker.set(broker).is_err() {
            warn!("Hub was attached concurrently, keeping the first broker");
        }
        Ok(())
    }

    /// Runs one client connection to completion.
    ///
    /// `reader` yields inbound text frames and ends (or errors) when the socket goes
    /// away; `writer` receives outbound frames from a dedicated writer task. Returns
    /// once the connection has been removed from the hub and the writer has closed.
    pub async fn serve<R, E, W>(&self, identity: Identity, mut reader: R, writer: W)
    where
        R: Stream<Item = Result<String, E>> + Unpin + Send,
        E: Display,
        W: Sink<String> + Unpin + Send + 'static,
        W::Error: Display,
    {
        let (outbound, queue) = mpsc::channel(self.inner.config.outbound_buffer.max(1));
        let connection = Arc::new(Connection::new(identity, outbound));
        let writer_task = tokio::spawn(write_frames(queue, writer, connection.closed_token()));

        self.inner.registry.register(Arc::clone(&connection));
        info!(
            "Client connected: connection={} user_id={} username={} total={}",
            connection.id(),
            connection.user_id(),
            connection.identity().username,
            self.connection_count()
        );
        self.announce_presence();

        self.read_frames(&connection, &mut reader).await;

        self.disconnect(connection.id());
        connection.close();
        if let Err(e) = writer_task.await {
            warn!("Writer task for connection {} failed: {e}", connection.id());
        }
    }

    async fn read_frames<R, E>(&self, connection: &Arc<Connection>, reader: &mut R)
    where
        R: Stream<Item = Result<String, E>> + Unpin + Send,
        E: Display,
    {
        let closed = connection.closed_token();
        loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => break,
                _ = self.inner.shutdown.cancelled() => break,
                frame = reader.next() => frame,
            };

            match frame {
                Some(Ok(text)) => self.handle_frame(connection, &text).await,
                Some(Err(e)) => {
                    debug!("Read error on connection {}: {e}", connection.id());
                    break;
                }
                None => break,
            }
        }
    }

    async fn handle_frame(&self, connection: &Arc<Connection>, text: &str) {
        let mut envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Malformed frame on connection {}: {e}", connection.id());
                self.send_to(connection, &Envelope::local_error(400, "invalid message"));
                return;
            }
        };

        if envelope.action == PING_ACTION {
            self.send_to(connection, &Envelope::new(PONG_ACTION, SYSTEM_SERVICE));
            return;
        }

        if envelope.id.is_empty() {
            envelope.id = Envelope::generate_id();
        }
        envelope.stamp(connection.identity());
        envelope.reply_to = envelope.id.clone();
        if !self
            .inner
            .routes
            .record(envelope.id.clone(), connection.id().clone())
        {
            debug!(
                "Request id {} already in flight on another connection, refusing {}",
                envelope.id,
                connection.id()
            );
            self.send_to(connection, &Envelope::error(&envelope, 409, "request id in use"));
            return;
        }

        if let Some(handler) = self.inner.actions.get(&envelope.action) {
            trace!("Dispatching {} ({}) locally", envelope.action, envelope.id);
            let ctx = self.context();
            tokio::spawn(async move { handler.handle(envelope, ctx).await });
            return;
        }

        let broker = match self.inner.broker.get() {
            Some(broker) if !envelope.service.is_empty() => broker,
            _ => {
                self.inner.routes.release(&envelope.id);
                let message = format!("action not found: {}", envelope.action);
                self.send_to(connection, &Envelope::error(&envelope, 404, message));
                return;
            }
        };

        let channel = service_channel(&envelope.service);
        trace!("Forwarding {} ({}) to {channel}", envelope.action, envelope.id);
        if let Err(e) = broker.publish(&channel, &envelope).await {
            warn!("Failed to forward {} to {channel}: {e}", envelope.id);
            self.inner.routes.release(&envelope.id);
            self.send_to(connection, &Envelope::error(&envelope, 502, "service unavailable"));
        }
    }

    /// Routes an outbound envelope to its connection(s).
    ///
    /// A reply goes to the connection that issued the request, once. When that route is
    /// unknown (never recorded, already used, or swept) the reply fans out to every
    /// connection of its `user_id` under [`ReplyFallback::User`], so the user's other
    /// devices may see it too; otherwise it is dropped. A reply whose origin has
    /// disconnected is dropped, as is one whose `user_id` differs from the identity of
    /// the connection that issued the request. Non-reply envelopes go to their user if
    /// they carry one, and to everyone otherwise.
    ///
    /// A reply with neither a route nor a `user_id` is deliberately dropped instead of
    /// being broadcast like a user-less event: it answers one client's request, and
    /// sending it to every connection would leak it.
    pub fn deliver(&self, envelope: Envelope) {
        if envelope.is_reply() {
            self.deliver_reply(envelope);
        } else if envelope.has_user() {
            self.send_to_user(envelope.user_id, &envelope);
        } else {
            self.broadcast(&envelope);
        }
    }

    fn deliver_reply(&self, envelope: Envelope) {
        if let Some(origin) = self
            .inner
            .routes
            .origin(&envelope.reply_to)
            .and_then(|connection_id| self.inner.registry.get(&connection_id))
        {
            if origin.user_id() != envelope.user_id {
                warn!(
                    "Reply to {} claims user_id={} but the request came from user_id={}, dropped",
                    envelope.reply_to,
                    envelope.user_id,
                    origin.user_id()
                );
                return;
            }
        }

        if let Some(connection_id) = self.inner.routes.take(&envelope.reply_to) {
            match self.inner.registry.get(&connection_id) {
                Some(connection) => self.send_to(&connection, &envelope),
                None => debug!(
                    "Origin of {} disconnected, reply dropped",
                    envelope.reply_to
                ),
            }
            return;
        }

        match self.inner.config.reply_fallback {
            ReplyFallback::User if envelope.has_user() => {
                let delivered = self.send_to_user(envelope.user_id, &envelope);
                debug!(
                    "No route for {}, delivered to {delivered} connection(s) of user {}",
                    envelope.reply_to, envelope.user_id
                );
            }
            _ => debug!("Orphan reply to {} dropped", envelope.reply_to),
        }
    }

    /// Writes `envelope` to every live connection. Returns how many accepted it.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        self.fan_out(self.inner.registry.snapshot(), envelope)
    }

    /// Builds an event and writes it to every live connection not belonging to
    /// `except_user_id`.
    pub fn broadcast_except<T>(
        &self,
        action: &str,
        service: &str,
        data: &T,
        except_user_id: UserId,
    ) -> Result<usize, envelope::Error>
    where
        T: Serialize + ?Sized,
    {
        let event = Envelope::event(action, service, data)?;
        let recipients = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .filter(|connection| connection.user_id() != except_user_id)
            .collect();
        Ok(self.fan_out(recipients, &event))
    }

    /// Writes `envelope` to every live connection of `user_id`.
    pub fn send_to_user(&self, user_id: UserId, envelope: &Envelope) -> usize {
        self.fan_out(self.inner.registry.user_connections(user_id), envelope)
    }

    fn fan_out(&self, recipients: Vec<Arc<Connection>>, envelope: &Envelope) -> usize {
        let (delivered, dropped) = self.write_all(recipients, envelope);
        if dropped > 0 {
            self.announce_presence();
        }
        delivered
    }

    /// Writes one frame to every recipient, then removes the connections whose write
    /// failed without announcing them. Returns `(delivered, removed)`.
    fn write_all(
        &self,
        recipients: Vec<Arc<Connection>>,
        envelope: &Envelope,
    ) -> (usize, usize) {
        let frame = match envelope.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to serialize {}: {e}", envelope.action);
                return (0, 0);
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for connection in recipients {
            if connection.send(frame.clone()) {
                delivered += 1;
            } else {
                failed.push(connection);
            }
        }

        let removed = failed
            .iter()
            .filter(|connection| self.remove(connection.id()))
            .count();
        (delivered, removed)
    }

    fn send_to(&self, connection: &Connection, envelope: &Envelope) {
        let frame = match envelope.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to serialize {}: {e}", envelope.action);
                return;
            }
        };
        if !connection.send(frame) {
            self.disconnect(connection.id());
        }
    }

    /// Removes a connection from both indices, stops its read loop and writer, and
    /// announces the new count.
    fn disconnect(&self, connection_id: &ConnectionId) {
        if self.remove(connection_id) {
            self.announce_presence();
        }
    }

    /// Unregisters and closes a connection. Returns `false` if it was already gone.
    fn remove(&self, connection_id: &ConnectionId) -> bool {
        let Some(connection) = self.inner.registry.unregister(connection_id) else {
            return false;
        };
        connection.close();
        info!(
            "Client disconnected: connection={} user_id={} username={} total={}",
            connection.id(),
            connection.user_id(),
            connection.identity().username,
            self.connection_count()
        );
        true
    }

    /// Broadcasts the live connection count. Connections that fail to take the event
    /// are removed and the new count is sent again, until a round loses nobody.
    fn announce_presence(&self) {
        if !self.inner.config.announce_presence {
            return;
        }
        while !self.inner.shutdown.is_cancelled() {
            let count = self.connection_count();
            let event =
                match Envelope::event(PRESENCE_ACTION, SYSTEM_SERVICE, &json!({ "count": count })) {
                    Ok(event) => event,
                    Err(e) => {
                        error!("Failed to build presence event: {e}");
                        return;
                    }
                };
            let (_, removed) = self.write_all(self.inner.registry.snapshot(), &event);
            if removed == 0 {
                return;
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.connection_count()
    }

    pub fn user_count(&self) -> usize {
        self.inner.registry.user_count()
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            clients: self.connection_count(),
            authenticated: self.user_count(),
        }
    }

    /// Requests forwarded and not yet answered, swept or released.
    pub fn route_count(&self) -> usize {
        self.inner.routes.len()
    }

    /// Handler context that answers through this hub's delivery policy.
    pub fn context(&self) -> Context {
        Context::new(Arc::new(self.clone()))
    }

    /// Starts the periodic route sweep. The task ends on [`shutdown`](Hub::shutdown).
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let config = &hub.inner.config;
            let mut ticker = tokio::time::interval(config.route_sweep_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = hub.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = hub.inner.routes.sweep(
                            Instant::now(),
                            config.route_ttl,
                            config.route_table_ceiling,
                        );
                        if removed > 0 {
                            debug!("Swept {removed} stale request route(s)");
                        }
                    }
                }
            }
        })
    }

    /// Stops every read loop and the maintenance task. Connections clean themselves up
    /// as their loops exit; no presence events are sent from here on.
    pub fn shutdown(&self) {
        info!("Hub shutting down, closing {} connection(s)", self.connection_count());
        self.inner.shutdown.cancel();
        for connection in self.inner.registry.snapshot() {
            connection.close();
        }
    }
}

#[async_trait]
impl Responder for Hub {
    async fn send_reply(&self, envelope: Envelope) -> Result<(), broker::Error> {
        self.deliver(envelope);
        Ok(())
    }

    async fn send_event(&self, envelope: Envelope) -> Result<(), broker::Error> {
        self.deliver(envelope);
        Ok(())
    }
}

#[async_trait]
impl EnvelopeSink for Hub {
    async fn accept(&self, envelope: Envelope) {
        self.deliver(envelope);
    }
}

/// Drains one connection's outbound queue into its socket until the queue closes,
/// the connection is closed, or a write fails.
async fn write_frames<W>(mut queue: mpsc::Receiver<String>, mut writer: W, closed: CancellationToken)
where
    W: Sink<String> + Unpin,
    W::Error: Display,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = closed.cancelled() => break,
            written = writer.send(frame) => written,
        };
        if let Err(e) = written {
            debug!("Socket write failed: {e}");
            closed.cancel();
            break;
        }
    }

    match tokio::time::timeout(WRITER_CLOSE_TIMEOUT, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!("Socket close failed: {e}"),
        Err(_) => debug!("Socket close timed out after {WRITER_CLOSE_TIMEOUT:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as socket;
    use serde_json::Value;
    use std::convert::Infallible;

    /// The client end of an in-memory socket served by the hub.
    struct Client {
        inbound: socket::UnboundedSender<Result<String, Infallible>>,
        outbound: socket::UnboundedReceiver<String>,
        session: JoinHandle<()>,
    }

    impl Client {
        async fn connect(hub: &Hub, identity: Identity) -> Self {
            let (inbound, reader) = socket::unbounded();
            let (writer, outbound) = socket::unbounded();
            let session = {
                let hub = hub.clone();
                tokio::spawn(async move { hub.serve(identity, reader, writer).await })
            };
            let mut client = Self {
                inbound,
                outbound,
                session,
            };
            // Once pong is back the connection is registered. Presence events may
            // arrive first.
            client.send_raw(r#"{"action":"ping"}"#);
            while client.recv().await.action != PONG_ACTION {}
            client
        }

        fn send_raw(&self, frame: &str) {
            self.inbound.unbounded_send(Ok(frame.to_string())).unwrap();
        }

        fn send(&self, frame: Value) {
            self.send_raw(&frame.to_string());
        }

        async fn recv(&mut self) -> Envelope {
            let frame = tokio::time::timeout(Duration::from_secs(1), self.outbound.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed");
            Envelope::from_json(&frame).unwrap()
        }

        async fn assert_silent(&mut self) {
            let frame =
                tokio::time::timeout(Duration::from_millis(100), self.outbound.next()).await;
            assert!(frame.is_err(), "unexpected frame: {frame:?}");
        }

        async fn hang_up(self) {
            drop(self.inbound);
            self.session.await.unwrap();
        }
    }

    fn quiet_hub() -> Hub {
        Hub::new(HubConfig {
            announce_presence: false,
            ..HubConfig::default()
        })
    }

    fn user(user_id: UserId) -> Identity {
        Identity::new(user_id, format!("u-{user_id}"), format!("user{user_id}"))
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let hub = quiet_hub();
        let mut client = Client::connect(&hub, Identity::anonymous()).await;

        client.send(json!({"id": "p1", "action": "ping"}));
        let pong = client.recv().await;
        assert_eq!(pong.action, PONG_ACTION);
        assert!(pong.reply_to.is_empty());
        assert_eq!(hub.route_count(), 0);
    }

    #[tokio::test]
    async fn malformed_frame_gets_400_and_connection_stays_usable() {
        let hub = quiet_hub();
        let mut client = Client::connect(&hub, Identity::anonymous()).await;

        client.send_raw("{not json");
        let error = client.recv().await;
        assert_eq!(error.action, "error");
        assert_eq!(error.error.unwrap().code, 400);

        client.send(json!({"action": "ping"}));
        assert_eq!(client.recv().await.action, PONG_ACTION);
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn unknown_action_gets_404_and_leaves_no_route() {
        let hub = quiet_hub();
        let mut client = Client::connect(&hub, user(7)).await;

        client.send(json!({"id": "r1", "action": "social.feed", "service": "social"}));
        let error = client.recv().await;

        assert_eq!(error.reply_to, "r1");
        assert_eq!(error.action, "social.feed.error");
        assert_eq!(error.error.unwrap().code, 404);
        assert_eq!(hub.route_count(), 0);
    }

    #[tokio::test]
    async fn local_handler_sees_verified_identity() {
        let hub = quiet_hub();
        hub.on("whoami", |env: Envelope, ctx: Context| async move {
            ctx.reply(&env, &env.identity()).await.unwrap();
        });
        let mut client = Client::connect(&hub, user(7)).await;

        client.send(json!({
            "id": "r1",
            "action": "whoami",
            "user_id": 99,
            "username": "mallory"
        }));
        let reply = client.recv().await;

        assert_eq!(reply.reply_to, "r1");
        let identity: Identity = reply.parse_data().unwrap();
        assert_eq!(identity, user(7));
        assert_eq!(hub.route_count(), 0);
    }

    #[tokio::test]
    async fn empty_id_is_replaced_before_dispatch() {
        let hub = quiet_hub();
        hub.on("echo.id", |env: Envelope, ctx: Context| async move {
            ctx.reply(&env, &env.id).await.unwrap();
        });
        let mut client = Client::connect(&hub, Identity::anonymous()).await;

        client.send(json!({"action": "echo.id"}));
        let reply = client.recv().await;

        assert!(!reply.reply_to.is_empty());
        assert_eq!(reply.data, Some(Value::String(reply.reply_to.clone())));
    }

    #[tokio::test]
    async fn service_request_without_broker_is_404() {
        let hub = quiet_hub();
        let mut client = Client::connect(&hub, Identity::anonymous()).await;

        client.send(json!({"id": "r1", "action": "social.feed", "service": "social"}));
        assert_eq!(client.recv().await.error.unwrap().code, 404);
    }

    #[tokio::test]
    async fn forward_failure_gets_502() {
        let transport = Arc::new(broker::transport::MemoryTransport::new());
        let broker = Broker::new(transport.clone(), broker::BrokerConfig::default());
        let hub = quiet_hub();
        hub.attach(broker.clone()).await.unwrap();
        let mut client = Client::connect(&hub, user(7)).await;

        broker.shutdown().await;
        client.send(json!({"id": "r1", "action": "social.feed", "service": "social"}));
        let error = client.recv().await;

        assert_eq!(error.reply_to, "r1");
        assert_eq!(error.error.unwrap().code, 502);
        assert_eq!(hub.route_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_removes_connection_from_both_indices() {
        let hub = quiet_hub();
        let phone = Client::connect(&hub, user(7)).await;
        let mut laptop = Client::connect(&hub, user(7)).await;
        assert_eq!(hub.status(), HubStatus { clients: 2, authenticated: 1 });

        phone.hang_up().await;
        assert_eq!(hub.status(), HubStatus { clients: 1, authenticated: 1 });

        let event = Envelope::event("new_post", "social", &json!({"id": 1})).unwrap();
        assert_eq!(hub.broadcast(&event), 1);
        assert_eq!(laptop.recv().await.action, "new_post");

        laptop.hang_up().await;
        assert_eq!(hub.status(), HubStatus { clients: 0, authenticated: 0 });
    }

    #[tokio::test]
    async fn reply_goes_to_the_origin_only() {
        let hub = quiet_hub();
        let mut phone = Client::connect(&hub, user(7)).await;
        let mut laptop = Client::connect(&hub, user(7)).await;
        hub.on("social.feed", |env: Envelope, ctx: Context| async move {
            ctx.reply(&env, &json!([])).await.unwrap();
        });

        phone.send(json!({"id": "r1", "action": "social.feed"}));
        assert_eq!(phone.recv().await.reply_to, "r1");
        laptop.assert_silent().await;
    }

    #[tokio::test]
    async fn route_miss_falls_back_to_the_users_connections() {
        let hub = quiet_hub();
        let mut phone = Client::connect(&hub, user(7)).await;
        let mut laptop = Client::connect(&hub, user(7)).await;
        let mut other = Client::connect(&hub, user(8)).await;

        let mut request = Envelope::new("social.feed", "social");
        request.stamp(&user(7));
        hub.deliver(Envelope::reply(&request, &json!([])).unwrap());

        assert_eq!(phone.recv().await.reply_to, request.id);
        assert_eq!(laptop.recv().await.reply_to, request.id);
        other.assert_silent().await;
    }

    #[tokio::test]
    async fn route_miss_is_dropped_under_drop_policy() {
        let hub = Hub::new(HubConfig {
            announce_presence: false,
            reply_fallback: ReplyFallback::Drop,
            ..HubConfig::default()
        });
        let mut phone = Client::connect(&hub, user(7)).await;

        let mut request = Envelope::new("social.feed", "social");
        request.stamp(&user(7));
        hub.deliver(Envelope::reply(&request, &json!([])).unwrap());

        phone.assert_silent().await;
    }

    #[tokio::test]
    async fn orphan_reply_without_user_is_dropped() {
        let hub = quiet_hub();
        let mut client = Client::connect(&hub, Identity::anonymous()).await;

        let request = Envelope::new("social.feed", "social");
        hub.deliver(Envelope::error(&request, 500, "late"));

        client.assert_silent().await;
    }

    #[tokio::test]
    async fn user_events_reach_only_that_user() {
        let hub = quiet_hub();
        let mut ana = Client::connect(&hub, user(7)).await;
        let mut bob = Client::connect(&hub, user(8)).await;
        hub.on("social.post.like", |env: Envelope, ctx: Context| async move {
            ctx.notify_user(8, "post_liked", "social", &json!({"by": env.username}))
                .await
                .unwrap();
            ctx.reply(&env, &json!({"liked": true})).await.unwrap();
        });

        ana.send(json!({"id": "r1", "action": "social.post.like"}));
        assert_eq!(ana.recv().await.action, "social.post.like.result");
        let event = bob.recv().await;
        assert_eq!(event.action, "post_liked");
        assert_eq!(event.data, Some(json!({"by": "user7"})));
        ana.assert_silent().await;
    }

    #[tokio::test]
    async fn broadcast_except_skips_the_actor() {
        let hub = quiet_hub();
        let mut ana = Client::connect(&hub, user(7)).await;
        let mut bob = Client::connect(&hub, user(8)).await;
        let mut guest = Client::connect(&hub, Identity::anonymous()).await;

        let delivered = hub
            .broadcast_except("new_post", "social", &json!({"id": 1}), 7)
            .unwrap();

        assert_eq!(delivered, 2);
        assert_eq!(bob.recv().await.action, "new_post");
        assert_eq!(guest.recv().await.action, "new_post");
        ana.assert_silent().await;
    }

    #[tokio::test]
    async fn presence_is_announced_on_connect_and_disconnect() {
        let hub = Hub::new(HubConfig::default());
        let (inbound, reader) = socket::unbounded::<Result<String, Infallible>>();
        let (writer, mut outbound) = socket::unbounded();
        let session = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.serve(user(7), reader, writer).await })
        };

        let first = Envelope::from_json(&outbound.next().await.unwrap()).unwrap();
        assert_eq!(first.action, PRESENCE_ACTION);
        assert_eq!(first.data, Some(json!({"count": 1})));

        let mut second = Client::connect(&hub, user(8)).await;
        let announced = Envelope::from_json(&outbound.next().await.unwrap()).unwrap();
        assert_eq!(announced.data, Some(json!({"count": 2})));

        drop(inbound);
        session.await.unwrap();
        let left = second.recv().await;
        assert_eq!(left.action, PRESENCE_ACTION);
        assert_eq!(left.data, Some(json!({"count": 1})));
    }

    #[tokio::test]
    async fn full_outbound_queue_disconnects_only_that_connection() {
        let hub = Hub::new(HubConfig {
            announce_presence: false,
            outbound_buffer: 1,
            ..HubConfig::default()
        });
        let mut healthy = Client::connect(&hub, user(1)).await;

        // A socket that never drains: its writer blocks on the first frame.
        let (_inbound, reader) = socket::unbounded::<Result<String, Infallible>>();
        let (writer, _stalled) = socket::channel::<String>(0);
        let stalled = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.serve(user(2), reader, writer).await })
        };
        while hub.connection_count() < 2 {
            tokio::task::yield_now().await;
        }

        for i in 0..4 {
            let event = Envelope::event("tick", "system", &i).unwrap();
            hub.broadcast(&event);
            assert_eq!(healthy.recv().await.data, Some(json!(i)));
        }

        tokio::time::timeout(Duration::from_secs(1), stalled)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hub.connection_count(), 1);
    }

    /// Registers a connection whose socket side is the returned receiver, or a dead
    /// one when `live` is false.
    fn attach_raw(hub: &Hub, identity: Identity, live: bool) -> Option<mpsc::Receiver<String>> {
        let (outbound, queue) = mpsc::channel(8);
        hub.inner
            .registry
            .register(Arc::new(Connection::new(identity, outbound)));
        live.then_some(queue)
    }

    fn hold_requests(hub: &Hub) {
        hub.on("social.hold", |_env: Envelope, _ctx: Context| async {});
    }

    fn hold_reply(request_id: &str, identity: &Identity) -> Envelope {
        let mut request = Envelope::new("social.hold", "social");
        request.id = request_id.to_string();
        request.stamp(identity);
        Envelope::reply(&request, "done").unwrap()
    }

    #[tokio::test]
    async fn in_flight_id_cannot_be_claimed_by_another_connection() {
        let hub = quiet_hub();
        hold_requests(&hub);
        let mut ana = Client::connect(&hub, user(7)).await;
        let mut bob = Client::connect(&hub, user(8)).await;

        ana.send(json!({"id": "r1", "action": "social.hold"}));
        while hub.route_count() == 0 {
            tokio::task::yield_now().await;
        }
        bob.send(json!({"id": "r1", "action": "social.hold"}));
        let refused = bob.recv().await;
        assert_eq!(refused.reply_to, "r1");
        assert_eq!(refused.error.unwrap().code, 409);
        assert_eq!(hub.route_count(), 1);

        hub.deliver(hold_reply("r1", &user(7)));
        let reply = ana.recv().await;
        assert_eq!(reply.reply_to, "r1");
        assert_eq!(reply.user_id, 7);
        bob.assert_silent().await;
    }

    #[tokio::test]
    async fn reply_for_another_user_does_not_reach_the_origin() {
        let hub = quiet_hub();
        hold_requests(&hub);
        let mut ana = Client::connect(&hub, user(7)).await;

        ana.send(json!({"id": "r1", "action": "social.hold"}));
        while hub.route_count() == 0 {
            tokio::task::yield_now().await;
        }

        hub.deliver(hold_reply("r1", &user(8)));
        ana.assert_silent().await;
        assert_eq!(hub.route_count(), 1);

        hub.deliver(hold_reply("r1", &user(7)));
        assert_eq!(ana.recv().await.data, Some(json!("done")));
        assert_eq!(hub.route_count(), 0);
    }

    #[tokio::test]
    async fn mass_write_failure_still_reaches_healthy_connections() {
        let hub = Hub::new(HubConfig::default());
        let mut healthy: Vec<_> = (0..10)
            .filter_map(|i| attach_raw(&hub, user(i + 1), true))
            .collect();
        for i in 0..2_000 {
            attach_raw(&hub, user(100 + i), false);
        }

        let event = Envelope::event("tick", "system", &1).unwrap();
        assert_eq!(hub.broadcast(&event), 10);
        assert_eq!(hub.connection_count(), 10);

        // One presence event for the whole batch of failures.
        for queue in &mut healthy {
            let tick = Envelope::from_json(&queue.try_recv().unwrap()).unwrap();
            assert_eq!(tick.action, "tick");
            let presence = Envelope::from_json(&queue.try_recv().unwrap()).unwrap();
            assert_eq!(presence.action, PRESENCE_ACTION);
            assert_eq!(presence.data, Some(json!({"count": 10})));
            assert!(queue.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn shutdown_with_thousands_of_sessions_completes() {
        let hub = Hub::new(HubConfig::default());
        let mut sessions = Vec::new();
        for i in 0..3_000 {
            let reader = futures::stream::pending::<Result<String, Infallible>>();
            let writer = futures::sink::drain::<String>();
            let session = {
                let hub = hub.clone();
                tokio::spawn(async move { hub.serve(Identity::anonymous(), reader, writer).await })
            };
            sessions.push(session);
            // Let each writer drain its presence events before the next connect.
            while hub.connection_count() <= i {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(hub.connection_count(), 3_000);

        hub.shutdown();
        for session in sessions {
            tokio::time::timeout(Duration::from_secs(10), session)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_sweeps_unanswered_routes() {
        let hub = Hub::new(HubConfig {
            announce_presence: false,
            route_ttl: Duration::from_secs(10),
            route_sweep_interval: Duration::from_secs(5),
            ..HubConfig::default()
        });
        hub.on("never.replies", |_env: Envelope, _ctx: Context| async {});
        let maintenance = hub.spawn_maintenance();
        let client = Client::connect(&hub, user(7)).await;

        client.send(json!({"id": "r1", "action": "never.replies"}));
        while hub.route_count() == 0 {
            tokio::task::yield_now().await;
        }

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(hub.route_count(), 0);

        hub.shutdown();
        maintenance.await.unwrap();
        client.session.await.unwrap();
        assert_eq!(hub.connection_count(), 0);
    }
}
