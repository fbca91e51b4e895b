//! In-memory stand-in for the streaming service.
//!
//! [`FakeConnector`] implements the `Connector` port; every dial hands a
//! [`ServerConn`] to the test through [`FakeServer::accept`], so the test
//! plays the server side of the protocol.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};

use quote_stream::infrastructure::config::StreamConfig;
use quote_stream::infrastructure::tradingview::HeartbeatConfig;
use quote_stream::infrastructure::tradingview::codec::{self, Frame, Message};
use quote_stream::{
    Connector, Credential, CredentialProvider, ExchangeResolver, ReconnectConfig, StreamClient,
    Transport, TransportError,
};

/// How long a test waits for the client before failing.
pub const STEP: Duration = Duration::from_secs(5);

// =============================================================================
// Connector
// =============================================================================

/// Dials the fake server.
pub struct FakeConnector {
    accepted: mpsc::UnboundedSender<ServerConn>,
    dials: AtomicUsize,
    refuse: AtomicUsize,
}

impl FakeConnector {
    /// Refuse the next `count` dials.
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    /// Dials so far, refused ones included.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Transport, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (client_tx, server_rx) = mpsc::unbounded::<String>();
        let (server_tx, client_rx) = mpsc::unbounded::<Result<String, TransportError>>();
        self.accepted
            .unbounded_send(ServerConn {
                received: server_rx,
                to_client: server_tx,
            })
            .map_err(|_| TransportError::Connect("fake server gone".to_string()))?;

        Ok(Transport {
            sink: Box::pin(client_tx.sink_map_err(|e| TransportError::Send(e.to_string()))),
            stream: Box::pin(client_rx),
        })
    }
}

/// Accepts connections dialed through a [`FakeConnector`].
pub struct FakeServer {
    accepted: mpsc::UnboundedReceiver<ServerConn>,
}

impl FakeServer {
    /// Next connection. Panics if none arrives within [`STEP`].
    pub async fn accept(&mut self) -> ServerConn {
        tokio::time::timeout(STEP, self.accepted.next())
            .await
            .expect("client did not dial")
            .expect("connector dropped")
    }

    /// Next connection, with the hello sent and the handshake consumed up
    /// to and including `set_auth_token`.
    pub async fn accept_ready(&mut self) -> ServerConn {
        let mut conn = self.accept().await;
        conn.hello();
        let auth = conn.next_message().await;
        assert_eq!(auth.method, "set_auth_token");
        conn
    }
}

/// A connected fake server and connector pair.
pub fn fake() -> (Arc<FakeConnector>, FakeServer) {
    let (accepted_tx, accepted_rx) = mpsc::unbounded();
    (
        Arc::new(FakeConnector {
            accepted: accepted_tx,
            dials: AtomicUsize::new(0),
            refuse: AtomicUsize::new(0),
        }),
        FakeServer {
            accepted: accepted_rx,
        },
    )
}

// =============================================================================
// Server Side of One Connection
// =============================================================================

/// The server end of one dialed transport.
pub struct ServerConn {
    received: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
}

impl ServerConn {
    /// Send the server hello.
    pub fn hello(&self) {
        self.raw(&codec::frame(
            r#"{"session_id":"<0.1.2>_test","timestamp":1700000000,"release":"test"}"#,
        ));
    }

    /// Send one chunk as is.
    pub fn raw(&self, chunk: &str) {
        let _ = self.to_client.unbounded_send(Ok(chunk.to_string()));
    }

    /// Send one framed method call.
    pub fn send(&self, method: &str, params: Value) {
        let Value::Array(params) = params else {
            panic!("params must be an array");
        };
        self.raw(&codec::encode(method, params));
    }

    /// Send a quote update.
    pub fn quote(&self, session: &str, exchange_symbol: &str, fields: Value) {
        self.send(
            "qsd",
            json!([session, {"n": exchange_symbol, "s": "ok", "v": fields}]),
        );
    }

    /// Send bars for the price series.
    pub fn bars(&self, session: &str, bars: &[[f64; 6]]) {
        let rows: Vec<Value> = bars
            .iter()
            .enumerate()
            .map(|(i, bar)| json!({"i": i, "v": bar}))
            .collect();
        self.send("du", json!([session, {"$prices": {"s": rows}}]));
    }

    /// Send one study row.
    pub fn study_row(&self, session: &str, study_id: &str, row: Value) {
        let mut series = serde_json::Map::new();
        series.insert(study_id.to_string(), json!({"st": [{"i": 0, "v": row}]}));
        self.send("du", json!([session, series]));
    }

    /// Fail the transport.
    pub fn fail(&self) {
        let _ = self
            .to_client
            .unbounded_send(Err(TransportError::Receive("connection reset".to_string())));
    }

    /// Next raw chunk from the client.
    pub async fn next_chunk(&mut self) -> String {
        tokio::time::timeout(STEP, self.received.next())
            .await
            .expect("client sent nothing")
            .expect("client closed the transport")
    }

    /// Next method call from the client, skipping heartbeat echoes.
    pub async fn next_message(&mut self) -> Message {
        loop {
            let chunk = tokio::time::timeout(STEP, self.received.next())
                .await
                .expect("client sent nothing")
                .expect("client closed the transport");
            let (frames, rest) = codec::decode(&chunk);
            assert!(rest.is_empty(), "client sent a partial frame: {chunk}");
            for frame in frames {
                match frame.expect("client sent a malformed frame") {
                    Frame::Message(message) => return message,
                    Frame::Heartbeat(_) => {}
                    Frame::Hello(hello) => panic!("client sent a hello: {hello}"),
                }
            }
        }
    }

    /// Messages up to and including the first `method` call.
    pub async fn until(&mut self, method: &str) -> Vec<Message> {
        let mut seen = Vec::new();
        loop {
            let message = self.next_message().await;
            let done = message.method == method;
            seen.push(message);
            if done {
                return seen;
            }
        }
    }

    /// Method names received within `window`.
    pub async fn drain_methods(&mut self, window: Duration) -> Vec<String> {
        let mut methods = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, self.received.next()).await {
            let (frames, _) = codec::decode(&chunk);
            methods.extend(frames.into_iter().filter_map(|frame| match frame {
                Ok(Frame::Message(message)) => Some(message.method),
                _ => None,
            }));
        }
        methods
    }

    /// Whether the client has dropped its end.
    pub async fn closed_by_client(&mut self) -> bool {
        matches!(
            tokio::time::timeout(STEP, async {
                while self.received.next().await.is_some() {}
            })
            .await,
            Ok(())
        )
    }
}

/// First string parameter of a message.
pub fn session_of(message: &Message) -> String {
    message.param_str(0).unwrap().to_string()
}

// =============================================================================
// Client Construction
// =============================================================================

struct AnonymousCredentials;

impl CredentialProvider for AnonymousCredentials {
    fn credential(&self) -> Result<Credential, quote_stream::application::ports::AuthError> {
        Ok(Credential::Anonymous)
    }
}

/// Settings for tests: quick reconnects, no keepalives.
pub fn test_config() -> StreamConfig {
    StreamConfig {
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        heartbeat: HeartbeatConfig::new(Duration::from_secs(60), Duration::from_secs(600)),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            jitter_factor: 0.0,
            ..ReconnectConfig::default()
        },
        ..StreamConfig::default()
    }
}

/// Client wired to a fresh fake server, resolving bare tickers to `BIST:`.
pub fn client(config: StreamConfig) -> (StreamClient, Arc<FakeConnector>, FakeServer) {
    let (connector, server) = fake();
    let client = StreamClient::new(
        config,
        Arc::clone(&connector) as Arc<dyn Connector>,
        Arc::new(ExchangeResolver::new("BIST")),
        Arc::new(AnonymousCredentials),
    );
    (client, connector, server)
}

/// Connect `client`, playing the server side until the handshake's
/// `set_auth_token`. Returns the server connection.
pub async fn connect(client: &StreamClient, server: &mut FakeServer) -> ServerConn {
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    let conn = server.accept_ready().await;
    connecting.await.unwrap().unwrap();
    conn
}
