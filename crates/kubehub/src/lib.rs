//! gatesync kubehub – watch multiplexing over long-lived streaming connections.
//!
//! Every logical watch resolves to a [`WatchKey`]. The hub keeps at most one
//! live connection per key, fans frames out to all subscribers and tears the
//! connection down when the last [`WatchStream`] is dropped. Subscribers that
//! fall behind keep only the most recent frame.

#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use gatesync_core::WatchEvent;
use gatesync_query::{WatchKey, WatchQuery};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod client;
pub mod memory;
pub mod transport;

pub use client::get_kube_client;
pub use transport::{FrameStream, KubeWsTransport, Transport};

/// Default keepalive period for live connections.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("opening watch stream: {0}")]
    Open(String),
    #[error("watch transport: {0}")]
    Transport(String),
    #[error("watch keepalive failed: {0}")]
    Keepalive(String),
    #[error("decoding watch frame: {0}")]
    Decode(String),
    #[error("watch connection closed")]
    Closed,
    #[error("watch hub is shut down")]
    Shutdown,
}

type Frame = Arc<str>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Opening,
    Open,
    /// Terminal; carries the error for abnormal termination.
    Closed(Option<WatchError>),
}

#[derive(Default)]
struct Slot {
    latest: Option<Frame>,
    /// `Some(outcome)` once the connection has ended.
    terminal: Option<Option<WatchError>>,
    dropped: u64,
}

/// Single-slot mailbox owned by one subscriber.
#[derive(Default)]
struct Mailbox {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl Mailbox {
    fn put(&self, frame: Frame) {
        let overwritten = {
            let mut slot = self.slot.lock();
            let overwritten = slot.latest.replace(frame).is_some();
            if overwritten {
                slot.dropped += 1;
            }
            overwritten
        };
        if overwritten {
            counter!("watch_events_dropped_total", 1u64);
        }
        self.notify.notify_one();
    }

    fn terminate(&self, outcome: Option<WatchError>) {
        self.slot.lock().terminal.get_or_insert(outcome);
        self.notify.notify_one();
    }
}

struct Connection {
    id: u64,
    key: WatchKey,
    uri: String,
    /// Guarded by the hub registry lock.
    refs: AtomicU64,
    finished: AtomicBool,
    subscribers: Mutex<Vec<Arc<Mailbox>>>,
    phase: watch::Sender<Phase>,
    cancel: CancellationToken,
}

impl Connection {
    fn publish(&self, frame: Frame) {
        counter!("watch_events_total", 1u64);
        for mb in self.subscribers.lock().iter() {
            mb.put(Arc::clone(&frame));
        }
    }

    fn close_all(&self, outcome: Option<WatchError>) {
        self.phase.send_replace(Phase::Closed(outcome.clone()));
        for mb in self.subscribers.lock().drain(..) {
            mb.terminate(outcome.clone());
        }
    }
}

struct HubInner {
    transport: Arc<dyn Transport>,
    keepalive: Duration,
    conns: Mutex<FxHashMap<WatchKey, Arc<Connection>>>,
    created: AtomicU64,
    next_id: AtomicU64,
    shut: AtomicBool,
}

impl HubInner {
    /// Drop the registry entry if it still points at `conn`.
    fn forget(&self, conn: &Connection) {
        let mut conns = self.conns.lock();
        conn.finished.store(true, Ordering::SeqCst);
        if conns.get(&conn.key).map(|c| c.id == conn.id).unwrap_or(false) {
            conns.remove(&conn.key);
        }
        gauge!("watch_connections_active", conns.len() as f64);
    }

    fn release(&self, conn: &Arc<Connection>, mailbox: &Arc<Mailbox>) {
        let teardown = {
            let mut conns = self.conns.lock();
            conn.subscribers.lock().retain(|m| !Arc::ptr_eq(m, mailbox));
            let left = conn.refs.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            if left == 0 && !conn.finished.load(Ordering::SeqCst) {
                conn.finished.store(true, Ordering::SeqCst);
                if conns.get(&conn.key).map(|c| c.id == conn.id).unwrap_or(false) {
                    conns.remove(&conn.key);
                }
                gauge!("watch_connections_active", conns.len() as f64);
                true
            } else {
                false
            }
        };
        if teardown {
            debug!(key = %conn.key, "last subscriber detached; closing watch");
            conn.cancel.cancel();
        }
    }
}

/// Registry of live watch connections keyed by [`WatchKey`].
#[derive(Clone)]
pub struct WatchHub {
    inner: Arc<HubInner>,
}

impl WatchHub {
    pub fn new(transport: Arc<dyn Transport>) -> Self { Self::with_keepalive(transport, DEFAULT_KEEPALIVE) }

    /// A zero `keepalive` falls back to [`DEFAULT_KEEPALIVE`].
    pub fn with_keepalive(transport: Arc<dyn Transport>, keepalive: Duration) -> Self {
        let keepalive = if keepalive.is_zero() {
            warn!(default_ms = DEFAULT_KEEPALIVE.as_millis() as u64, "zero keepalive interval; using default");
            DEFAULT_KEEPALIVE
        } else {
            keepalive
        };
        Self {
            inner: Arc::new(HubInner {
                transport,
                keepalive,
                conns: Mutex::new(FxHashMap::default()),
                created: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                shut: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to `query`, sharing the live connection for its key or
    /// opening a new one. Must be called inside a tokio runtime.
    pub fn watch<T: DeserializeOwned>(&self, query: &WatchQuery) -> Result<WatchStream<T>, WatchError> {
        let uri = query.to_uri();
        let key = query.watch_key();
        let mailbox = Arc::new(Mailbox::default());
        let mut spawn: Option<Arc<Connection>> = None;
        let conn = {
            let mut conns = self.inner.conns.lock();
            if self.inner.shut.load(Ordering::SeqCst) {
                return Err(WatchError::Shutdown);
            }
            let conn = match conns.get(&key) {
                Some(c) => Arc::clone(c),
                None => {
                    let (phase, _) = watch::channel(Phase::Opening);
                    let c = Arc::new(Connection {
                        id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
                        key: key.clone(),
                        uri: uri.clone(),
                        refs: AtomicU64::new(0),
                        finished: AtomicBool::new(false),
                        subscribers: Mutex::new(Vec::new()),
                        phase,
                        cancel: CancellationToken::new(),
                    });
                    conns.insert(key.clone(), Arc::clone(&c));
                    self.inner.created.fetch_add(1, Ordering::SeqCst);
                    gauge!("watch_connections_active", conns.len() as f64);
                    spawn = Some(Arc::clone(&c));
                    c
                }
            };
            conn.refs.fetch_add(1, Ordering::SeqCst);
            conn.subscribers.lock().push(Arc::clone(&mailbox));
            conn
        };
        if let Some(c) = spawn {
            info!(key = %key, uri = %uri, "opening watch connection");
            tokio::spawn(run_connection(Arc::clone(&self.inner), c));
        } else {
            debug!(key = %key, refs = conn.refs.load(Ordering::SeqCst), "joined live watch");
        }
        let phase = conn.phase.subscribe();
        Ok(WatchStream { hub: Arc::clone(&self.inner), conn, mailbox, phase, done: false, _ty: PhantomData })
    }

    pub fn keepalive(&self) -> Duration { self.inner.keepalive }

    /// Number of connections created since the hub was built.
    pub fn connections_created(&self) -> u64 { self.inner.created.load(Ordering::SeqCst) }

    pub fn active_connections(&self) -> usize { self.inner.conns.lock().len() }

    pub fn subscriber_count(&self, key: &WatchKey) -> usize {
        self.inner.conns.lock().get(key).map(|c| c.refs.load(Ordering::SeqCst) as usize).unwrap_or(0)
    }

    /// Close every live connection; later `watch` calls fail with [`WatchError::Shutdown`].
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut conns = self.inner.conns.lock();
            self.inner.shut.store(true, Ordering::SeqCst);
            conns.drain().map(|(_, c)| c).collect()
        };
        for c in drained {
            c.finished.store(true, Ordering::SeqCst);
            c.cancel.cancel();
        }
        gauge!("watch_connections_active", 0.0);
        info!("watch hub shut down");
    }
}

enum Step {
    Cancelled,
    Keepalive,
    Frame(Option<Result<String, WatchError>>),
}

async fn run_connection(hub: Arc<HubInner>, conn: Arc<Connection>) {
    let opened = tokio::select! {
        _ = conn.cancel.cancelled() => {
            conn.close_all(None);
            return;
        }
        r = hub.transport.open(&conn.uri) => r,
    };
    let mut stream = match opened {
        Ok(s) => s,
        Err(e) => {
            warn!(key = %conn.key, error = %e, "watch open failed");
            hub.forget(&conn);
            conn.close_all(Some(e));
            return;
        }
    };
    counter!("watch_connections_opened_total", 1u64);
    conn.phase.send_replace(Phase::Open);

    let period = hub.keepalive;
    let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let outcome = loop {
        let step = tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => Step::Cancelled,
            _ = keepalive.tick() => Step::Keepalive,
            frame = stream.next_frame() => Step::Frame(frame),
        };
        match step {
            Step::Cancelled => break None,
            Step::Keepalive => {
                if let Err(e) = stream.ping().await {
                    counter!("watch_keepalive_failed_total", 1u64);
                    warn!(key = %conn.key, error = %e, "keepalive failed; closing watch");
                    break Some(match e {
                        WatchError::Keepalive(_) => e,
                        other => WatchError::Keepalive(other.to_string()),
                    });
                }
            }
            Step::Frame(Some(Ok(text))) => conn.publish(Arc::from(text)),
            Step::Frame(Some(Err(e))) => {
                warn!(key = %conn.key, error = %e, "watch stream failed");
                break Some(e);
            }
            Step::Frame(None) => {
                info!(key = %conn.key, "watch stream completed");
                break None;
            }
        }
    };
    stream.close().await;
    hub.forget(&conn);
    conn.close_all(outcome);
    debug!(key = %conn.key, "watch connection closed");
}

/// Subscriber handle for one logical watch. Dropping it detaches from the
/// shared connection.
pub struct WatchStream<T> {
    hub: Arc<HubInner>,
    conn: Arc<Connection>,
    mailbox: Arc<Mailbox>,
    phase: watch::Receiver<Phase>,
    done: bool,
    _ty: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> WatchStream<T> {
    pub fn key(&self) -> &WatchKey { &self.conn.key }
    pub fn uri(&self) -> &str { &self.conn.uri }

    /// Frames overwritten before this subscriber consumed them.
    pub fn dropped(&self) -> u64 { self.mailbox.slot.lock().dropped }

    /// Resolve once the transport is open, or with the open error.
    pub async fn wait_open(&mut self) -> Result<(), WatchError> {
        let phase = self
            .phase
            .wait_for(|p| !matches!(p, Phase::Opening))
            .await
            .map(|p| p.clone())
            .map_err(|_| WatchError::Closed)?;
        match phase {
            Phase::Open => Ok(()),
            Phase::Closed(Some(e)) => Err(e),
            Phase::Closed(None) | Phase::Opening => Err(WatchError::Closed),
        }
    }

    /// Next event; `Some(Err(_))` for decode failures and terminal stream
    /// errors, `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<WatchEvent<T>, WatchError>> {
        if self.done {
            return None;
        }
        loop {
            let taken = {
                let mut slot = self.mailbox.slot.lock();
                match slot.latest.take() {
                    Some(frame) => Some(Ok(frame)),
                    None => slot.terminal.take().map(Err),
                }
            };
            match taken {
                Some(Ok(frame)) => {
                    return Some(serde_json::from_str(&frame).map_err(|e| WatchError::Decode(e.to_string())));
                }
                Some(Err(outcome)) => {
                    self.done = true;
                    return outcome.map(Err);
                }
                None => self.mailbox.notify.notified().await,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<WatchEvent<T>, WatchError>> {
        futures::stream::unfold(self, |mut s| async move { s.next().await.map(|item| (item, s)) })
    }
}

impl<T> Drop for WatchStream<T> {
    fn drop(&mut self) { self.hub.release(&self.conn, &self.mailbox); }
}
