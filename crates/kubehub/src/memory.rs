//! In-memory transport for tests and local runs.
//!
//! Each `open` creates a feed addressed by URI; tests push frames into the
//! latest feed for a URI and can make opens or keepalives fail.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use gatesync_core::WatchEventKind;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::transport::{FrameStream, Transport};
use crate::WatchError;

type FeedTx = mpsc::UnboundedSender<Result<String, WatchError>>;

struct Feed {
    tx: Option<FeedTx>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct State {
    opens: u64,
    feeds: FxHashMap<String, Feed>,
    fail_open: Option<String>,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
    pings: Arc<AtomicU64>,
    fail_ping: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self { Self::default() }

    /// Render a watch frame the way the API server does.
    pub fn frame(kind: WatchEventKind, object: serde_json::Value) -> String {
        serde_json::json!({ "type": kind, "object": object }).to_string()
    }

    pub fn opens(&self) -> u64 { self.state.lock().opens }
    pub fn pings(&self) -> u64 { self.pings.load(Ordering::SeqCst) }

    /// Make subsequent opens fail (`None` restores success).
    pub fn fail_open(&self, reason: Option<&str>) { self.state.lock().fail_open = reason.map(|s| s.to_string()); }

    pub fn fail_ping(&self, on: bool) { self.fail_ping.store(on, Ordering::SeqCst); }

    /// Push a frame into the current feed for `uri`; false if none is open.
    pub fn send(&self, uri: &str, frame: String) -> bool {
        match self.state.lock().feeds.get(uri).and_then(|f| f.tx.as_ref()) {
            Some(tx) => tx.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    /// Fail the current feed for `uri` with a transport error.
    pub fn fail(&self, uri: &str, reason: &str) -> bool {
        match self.state.lock().feeds.get(uri).and_then(|f| f.tx.as_ref()) {
            Some(tx) => tx.send(Err(WatchError::Transport(reason.to_string()))).is_ok(),
            None => false,
        }
    }

    /// Complete the current feed for `uri` normally.
    pub fn end(&self, uri: &str) {
        if let Some(feed) = self.state.lock().feeds.get_mut(uri) {
            feed.tx = None;
        }
    }

    /// Whether the latest stream opened for `uri` is still open on the client side.
    pub fn is_open(&self, uri: &str) -> bool {
        self.state.lock().feeds.get(uri).map(|f| !f.closed.load(Ordering::SeqCst)).unwrap_or(false)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, uri: &str) -> Result<Box<dyn FrameStream>, WatchError> {
        let mut st = self.state.lock();
        st.opens += 1;
        if let Some(reason) = &st.fail_open {
            return Err(WatchError::Open(reason.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        st.feeds.insert(uri.to_string(), Feed { tx: Some(tx), closed: Arc::clone(&closed) });
        Ok(Box::new(MemoryStream { rx, closed, pings: Arc::clone(&self.pings), fail_ping: Arc::clone(&self.fail_ping) }))
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Result<String, WatchError>>,
    closed: Arc<AtomicBool>,
    pings: Arc<AtomicU64>,
    fail_ping: Arc<AtomicBool>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_frame(&mut self) -> Option<Result<String, WatchError>> { self.rx.recv().await }

    async fn ping(&mut self) -> Result<(), WatchError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(WatchError::Keepalive("ping rejected".into()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.rx.close();
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) { self.closed.store(true, Ordering::SeqCst); }
}
