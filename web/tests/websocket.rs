//! Real websocket clients against a gateway served on a loopback port, with a worker
//! broker answering the `social` service.

use auth::JwtVerifier;
use broker::transport::MemoryTransport;
use broker::{service_channel, Broker, BrokerConfig, Context};
use envelope::{Envelope, Identity};
use futures::{SinkExt, StreamExt};
use hub::{Hub, HubConfig, PONG_ACTION, PRESENCE_ACTION};
use serde_json::{json, Value};
use service::config::Config;
use service::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

const SECRET: &str = "websocket-test-secret";
const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    address: String,
    hub: Hub,
    verifier: JwtVerifier,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<web::Result<()>>,
    _worker: Broker,
}

impl TestServer {
    async fn start(hub_config: HubConfig) -> Self {
        let transport = Arc::new(MemoryTransport::new());

        let worker = Broker::new(transport.clone(), BrokerConfig::default());
        worker.on("social.feed", |env: Envelope, ctx: Context| async move {
            let limit = env
                .data
                .as_ref()
                .and_then(|data| data.get("limit"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let posts: Vec<u64> = (1..=limit).collect();
            ctx.reply(&env, &json!({"posts": posts, "viewer": env.user_id}))
                .await
                .unwrap();
        });
        worker
            .subscribe(&[&service_channel("social")])
            .await
            .unwrap();

        let hub = Hub::new(hub_config);
        hub.attach(Broker::new(transport, BrokerConfig::default()))
            .await
            .unwrap();

        let config = Config::parse_from_args(["gateway"]).unwrap();
        let app_state = AppState::new(config, hub.clone(), Arc::new(JwtVerifier::new(SECRET)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(web::serve(listener, app_state, async move {
            let _ = shutdown_rx.await;
        }));

        Self {
            address,
            hub,
            verifier: JwtVerifier::new(SECRET),
            shutdown: Some(shutdown_tx),
            server,
            _worker: worker,
        }
    }

    async fn quiet() -> Self {
        Self::start(HubConfig {
            announce_presence: false,
            ..HubConfig::default()
        })
        .await
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.address)
    }

    async fn connect(&self) -> WsStream {
        let (ws, _) = connect_async(self.url()).await.unwrap();
        ws
    }

    async fn connect_as(&self, identity: &Identity) -> WsStream {
        let token = self.verifier.issue(identity, None).unwrap();
        let (ws, _) = connect_async(format!("{}?token={token}", self.url()))
            .await
            .unwrap();
        ws
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        timeout(TIMEOUT, self.server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn ana() -> Identity {
    Identity::new(7, "u-7", "ana")
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

async fn recv(ws: &mut WsStream) -> Envelope {
    loop {
        let frame = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return Envelope::from_json(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let server = TestServer::quiet().await;
    let mut ws = server.connect().await;

    send(&mut ws, json!({"id": "p1", "action": "ping"})).await;
    let pong = recv(&mut ws).await;

    assert_eq!(pong.action, PONG_ACTION);
    assert_eq!(pong.service, "system");
    server.stop().await;
}

#[tokio::test]
async fn invalid_json_gets_400_and_the_socket_stays_open() {
    let server = TestServer::quiet().await;
    let mut ws = server.connect().await;

    ws.send(Message::text("{not json")).await.unwrap();
    let error = recv(&mut ws).await;
    assert_eq!(error.error.unwrap().code, 400);

    send(&mut ws, json!({"action": "ping"})).await;
    assert_eq!(recv(&mut ws).await.action, PONG_ACTION);
    server.stop().await;
}

#[tokio::test]
async fn token_identity_reaches_the_worker() {
    let server = TestServer::quiet().await;
    let mut ws = server.connect_as(&ana()).await;

    send(
        &mut ws,
        json!({
            "id": "r1",
            "action": "social.feed",
            "service": "social",
            "user_id": 999,
            "data": {"limit": 2}
        }),
    )
    .await;
    let reply = recv(&mut ws).await;

    assert_eq!(reply.reply_to, "r1");
    assert_eq!(reply.data, Some(json!({"posts": [1, 2], "viewer": 7})));
    server.stop().await;
}

#[tokio::test]
async fn bearer_header_identifies_the_connection() {
    let server = TestServer::quiet().await;
    let token = server.verifier.issue(&ana(), None).unwrap();
    let mut request = server.url().into_client_request().unwrap();
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    let (mut ws, _) = connect_async(request).await.unwrap();

    send(&mut ws, json!({"action": "ping"})).await;
    recv(&mut ws).await;
    assert_eq!(server.hub.user_count(), 1);
    server.stop().await;
}

#[tokio::test]
async fn unknown_action_gets_404() {
    let server = TestServer::quiet().await;
    let mut ws = server.connect().await;

    send(&mut ws, json!({"id": "r1", "action": "nothing.here"})).await;
    let error = recv(&mut ws).await;

    assert_eq!(error.reply_to, "r1");
    assert_eq!(error.error.unwrap().code, 404);
    server.stop().await;
}

#[tokio::test]
async fn status_endpoint_counts_sockets() {
    let server = TestServer::quiet().await;
    let mut guest = server.connect().await;
    let mut member = server.connect_as(&ana()).await;
    for ws in [&mut guest, &mut member] {
        send(ws, json!({"action": "ping"})).await;
        recv(ws).await;
    }

    assert_eq!(server.hub.connection_count(), 2);
    assert_eq!(server.hub.user_count(), 1);

    drop(guest);
    timeout(TIMEOUT, async {
        while server.hub.connection_count() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("closed socket was never unregistered");
    server.stop().await;
}

#[tokio::test]
async fn presence_is_announced_on_connect() {
    let server = TestServer::start(HubConfig::default()).await;
    let mut ws = server.connect_as(&ana()).await;

    let presence = recv(&mut ws).await;
    assert_eq!(presence.action, PRESENCE_ACTION);
    assert_eq!(presence.data, Some(json!({"count": 1})));
    server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let server = TestServer::quiet().await;
    let mut ws = server.connect().await;
    send(&mut ws, json!({"action": "ping"})).await;
    recv(&mut ws).await;

    server.stop().await;

    let closed = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "socket stayed open after shutdown");
}
