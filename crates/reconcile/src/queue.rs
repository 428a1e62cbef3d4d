//! Ordered single-consumer reconciliation queue.

use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use gatesync_core::{ResourceKind, WatchActionContext, WatchEventKind};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::schedule::RepeatingTask;

/// Default drain period.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("reconciliation queue is shut down")]
    Closed,
}

/// Processes one kind of work item. Runs on the queue consumer only.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: &mut WatchActionContext) -> anyhow::Result<()>;
}

struct Inlet {
    next_seq: u64,
    tx: Option<mpsc::UnboundedSender<WatchActionContext>>,
}

pub struct ReconciliationQueue {
    // Sequence assignment and send happen under one lock so `seq` matches channel order.
    inlet: parking_lot::Mutex<Inlet>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WatchActionContext>>,
    handlers: FxHashMap<ResourceKind, Arc<dyn ActionHandler>>,
    max_retries: u32,
    task: parking_lot::Mutex<Option<RepeatingTask>>,
}

impl ReconciliationQueue {
    pub fn new(max_retries: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inlet: parking_lot::Mutex::new(Inlet { next_seq: 1, tx: Some(tx) }),
            rx: tokio::sync::Mutex::new(rx),
            handlers: FxHashMap::default(),
            max_retries,
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_handler(mut self, kind: ResourceKind, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Append `ctx`; safe from any thread. Returns the assigned sequence number.
    pub fn enqueue(&self, mut ctx: WatchActionContext) -> Result<u64, QueueError> {
        let mut inlet = self.inlet.lock();
        let seq = inlet.next_seq;
        let tx = inlet.tx.as_ref().ok_or(QueueError::Closed)?;
        ctx.seq = seq;
        tx.send(ctx).map_err(|_| QueueError::Closed)?;
        inlet.next_seq += 1;
        counter!("reconcile_queue_enqueued_total", 1u64);
        Ok(seq)
    }

    pub fn is_closed(&self) -> bool { self.inlet.lock().tx.is_none() }

    /// Process everything queued, including items enqueued while draining.
    /// Returns the number of contexts taken off the queue.
    pub async fn drain_once(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let started = Instant::now();
        let mut taken = 0usize;
        while !self.is_closed() {
            let Ok(ctx) = rx.try_recv() else { break };
            taken += 1;
            self.process(ctx).await;
        }
        if taken > 0 {
            let took_ms = started.elapsed().as_millis() as u64;
            histogram!("reconcile_drain_ms", took_ms as f64);
            debug!(items = taken, took_ms, "reconcile drain complete");
        }
        taken
    }

    async fn process(&self, mut ctx: WatchActionContext) {
        match ctx.event {
            WatchEventKind::Bookmark => return,
            WatchEventKind::Error => {
                warn!(seq = ctx.seq, kind = %ctx.resource, payload = %ctx.payload, "watch reported an error event");
                return;
            }
            _ => {}
        }
        let Some(handler) = self.handlers.get(&ctx.resource) else {
            warn!(seq = ctx.seq, kind = %ctx.resource, "no handler registered; discarding");
            counter!("reconcile_failed_total", 1u64);
            return;
        };
        loop {
            match handler.handle(&mut ctx).await {
                Ok(()) => {
                    counter!("reconcile_processed_total", 1u64);
                    return;
                }
                Err(e) => {
                    ctx.record_error(format!("{:#}", e));
                    if ctx.retries >= self.max_retries {
                        counter!("reconcile_failed_total", 1u64);
                        error!(seq = ctx.seq, kind = %ctx.resource, retries = ctx.retries, errors = ?ctx.errors, "reconcile failed; discarding");
                        return;
                    }
                    ctx.retries += 1;
                    debug!(seq = ctx.seq, kind = %ctx.resource, retry = ctx.retries, error = %e, "retrying reconcile");
                }
            }
        }
    }

    /// Start the periodic drain. Idempotent.
    pub fn start(self: &Arc<Self>, period: Duration) {
        let mut task = self.task.lock();
        if task.is_some() || self.is_closed() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        *task = Some(RepeatingTask::spawn("reconcile-drain", period, period, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(q) if !q.is_closed() => {
                        q.drain_once().await;
                        ControlFlow::Continue(())
                    }
                    _ => ControlFlow::Break(()),
                }
            }
        }));
        info!(period_ms = period.as_millis() as u64, "reconciliation queue started");
    }

    /// Stop draining and discard what is still queued. A handler that is
    /// already running completes first.
    pub async fn shutdown(&self) {
        self.inlet.lock().tx = None;
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.cancel();
        }
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut discarded = 0usize;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        info!(discarded, "reconciliation queue shut down");
    }
}
