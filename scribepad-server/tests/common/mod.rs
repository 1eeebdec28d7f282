#![allow(dead_code)]

use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use axum::http::StatusCode;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A test WebSocket client that sends and receives JSON messages.
pub struct JsonSocket(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>);

impl JsonSocket {
    pub async fn send(&mut self, msg: &Value) {
        self.0.send(msg.to_string().into()).await.unwrap();
    }

    pub async fn recv(&mut self) -> Result<Value> {
        let msg = self
            .0
            .next()
            .await
            .ok_or_else(|| anyhow!("WebSocket closed"))??;
        let msg = msg.to_text().map_err(|_| anyhow!("non-string message"))?;
        Ok(serde_json::from_str(msg)?)
    }

    /// Receive messages until one carries `key`, discarding the rest.
    pub async fn recv_until(&mut self, key: &str) -> Result<Value> {
        loop {
            let msg = self.recv().await?;
            if msg.get(key).is_some() {
                return Ok(msg);
            }
        }
    }

    pub async fn recv_closed(&mut self) -> Result<()> {
        match self.0.next().await {
            // A close frame, a clean end of stream, or an abrupt drop all
            // count as the server closing the connection.
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => Ok(()),
            other => Err(anyhow!("WebSocket should be closed, got {other:?}")),
        }
    }

    pub async fn close(mut self) {
        self.0.close(None).await.ok();
    }
}

pub struct TestClient {
    client: reqwest::Client,
    addr: SocketAddr,
}

impl TestClient {
    pub async fn start(router: axum::Router) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(
            axum::serve(
                listener,
                router
                    .layer(TraceLayer::new_for_http())
                    .into_make_service_with_connect_info::<SocketAddr>(),
            )
            .into_future(),
        );
        let client = reqwest::Client::new();
        Ok(Self { client, addr })
    }

    pub async fn get(&self, path: &str) -> Result<String> {
        let url = format!("http://{}/{}", self.addr, path);
        info!("GET {}", url);
        let resp = self.client.get(&url).send().await?;
        assert_eq!(resp.status(), StatusCode::OK);
        Ok(resp.text().await?)
    }

    pub async fn expect_text(&self, id: &str, expected: &str) {
        let actual = self.get(&format!("api/text/{id}")).await.unwrap();
        assert_eq!(actual, expected);
    }

    pub async fn stats(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.get("api/stats").await?)?)
    }

    pub async fn connect(&self) -> Result<JsonSocket> {
        let (socket, _response) =
            tokio_tungstenite::connect_async(format!("ws://{}/api/socket", self.addr))
                .await
                .unwrap();
        Ok(JsonSocket(socket))
    }

    /// Connect and perform the identity handshake.
    pub async fn connect_as(&self, user_id: &str, username: &str) -> Result<JsonSocket> {
        let mut socket = self.connect().await?;
        socket
            .send(&json!({ "handshake": { "user_id": user_id, "username": username } }))
            .await;
        Ok(socket)
    }
}

/// Join a document and return the server's reply.
pub async fn join(socket: &mut JsonSocket, document_id: &str, document_name: &str) -> Result<Value> {
    socket
        .send(&json!({
            "get_document": {
                "document_id": document_id,
                "document_name": document_name
            }
        }))
        .await;
    socket.recv().await
}

/// Submit an operation set against `base_version`.
pub async fn send_changes(socket: &mut JsonSocket, base_version: u64, ops: Value) {
    socket
        .send(&json!({
            "send_changes": { "base_version": base_version, "ops": ops }
        }))
        .await;
}

pub fn logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,tower_http=debug", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init()
        .ok();
}
