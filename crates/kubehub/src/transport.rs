//! Streaming transport seam and the kube websocket implementation.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::debug;

use crate::WatchError;

/// Opens one long-lived event stream for a resolved watch URI (path + query).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, uri: &str) -> Result<Box<dyn FrameStream>, WatchError>;
}

/// A live stream of text frames with an explicit keepalive.
///
/// `next_frame` must be cancel safe: the connection task polls it inside `select!`.
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame; `None` on normal completion.
    async fn next_frame(&mut self) -> Option<Result<String, WatchError>>;
    async fn ping(&mut self) -> Result<(), WatchError>;
    async fn close(&mut self);
}

/// Watch transport upgrading to a websocket through the kube client, which
/// supplies cluster URL, TLS material and default credentials.
#[derive(Clone)]
pub struct KubeWsTransport {
    client: kube::Client,
    bearer: Option<String>,
}

impl KubeWsTransport {
    pub fn new(client: kube::Client) -> Self { Self { client, bearer: None } }

    /// Explicit bearer credential sent on every upgrade request.
    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token.filter(|t| !t.is_empty());
        self
    }
}

#[async_trait]
impl Transport for KubeWsTransport {
    async fn open(&self, uri: &str) -> Result<Box<dyn FrameStream>, WatchError> {
        let mut builder = http::Request::builder().method(http::Method::GET).uri(uri);
        if let Some(token) = &self.bearer {
            builder = builder.header(http::header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = builder.body(Vec::new()).map_err(|e| WatchError::Open(e.to_string()))?;
        let ws = self.client.connect(req).await.map_err(|e| WatchError::Open(e.to_string()))?;
        debug!(uri = %uri, "websocket upgraded");
        Ok(Box::new(WsFrames { ws }))
    }
}

struct WsFrames<S> {
    ws: WebSocketStream<S>,
}

#[async_trait]
impl<S> FrameStream for WsFrames<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Option<Result<String, WatchError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes).map_err(|e| WatchError::Decode(e.to_string())))
                }
                Ok(Message::Close(_)) => return None,
                // Ping/Pong are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => return Some(Err(WatchError::Transport(e.to_string()))),
            }
        }
    }

    async fn ping(&mut self) -> Result<(), WatchError> {
        self.ws.send(Message::Ping(Vec::new())).await.map_err(|e| WatchError::Keepalive(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
