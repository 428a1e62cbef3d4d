//! Bootstrap and teardown of the sync pipeline.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use gatesync_kubehub::WatchHub;
use gatesync_reconcile::{Manager, ReconciliationQueue, RepeatingTask};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::control::ControlPlane;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Stopped,
    Starting,
    Running,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SyncState::Stopped => "stopped",
            SyncState::Starting => "starting",
            SyncState::Running => "running",
        })
    }
}

struct Inner {
    control: Arc<dyn ControlPlane>,
    /// Dependency order: plugins, gateways, services.
    managers: Vec<Arc<dyn Manager>>,
    /// Prefix of `managers` currently started.
    started: Mutex<usize>,
    state: watch::Sender<SyncState>,
}

impl Inner {
    async fn bootstrap(&self) -> Result<()> {
        counter!("bootstrap_attempts_total", 1u64);
        self.control.probe().await.context("probing control plane")?;
        for (i, m) in self.managers.iter().enumerate() {
            if let Err(e) = m.start().await {
                self.stop_started().await;
                return Err(e.context(format!("starting {} manager", m.name())));
            }
            *self.started.lock() = i + 1;
        }
        Ok(())
    }

    /// Stop started managers in reverse order; failures are only logged.
    async fn stop_started(&self) {
        let n = std::mem::take(&mut *self.started.lock());
        for m in self.managers[..n].iter().rev() {
            if let Err(e) = m.stop().await {
                warn!(manager = m.name(), error = %format!("{:#}", e), "manager stop failed");
            }
        }
    }
}

/// Drives `Stopped -> Starting -> Running`, retrying bootstrap until it
/// succeeds or [`SyncOrchestrator::stop`] is called.
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
    enabled: bool,
    retry: Duration,
    queue: Option<(Arc<ReconciliationQueue>, Duration)>,
    hub: Option<WatchHub>,
    bootstrap: Mutex<Option<RepeatingTask>>,
    stopped: Mutex<bool>,
}

impl SyncOrchestrator {
    /// `managers` start in the given order and stop in reverse.
    pub fn new(
        enabled: bool,
        retry: Duration,
        control: Arc<dyn ControlPlane>,
        managers: Vec<Arc<dyn Manager>>,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Stopped);
        Self {
            inner: Arc::new(Inner { control, managers, started: Mutex::new(0), state }),
            enabled,
            retry,
            queue: None,
            hub: None,
            bootstrap: Mutex::new(None),
            stopped: Mutex::new(false),
        }
    }

    /// Queue drained every `period` while the orchestrator runs.
    pub fn with_queue(mut self, queue: Arc<ReconciliationQueue>, period: Duration) -> Self {
        self.queue = Some((queue, period));
        self
    }

    pub fn with_hub(mut self, hub: WatchHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn state(&self) -> SyncState { *self.inner.state.borrow() }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> { self.inner.state.subscribe() }

    pub fn is_enabled(&self) -> bool { self.enabled }

    /// Begin bootstrapping in the background. Returns immediately.
    pub fn start(&self) -> Result<()> {
        if *self.stopped.lock() {
            bail!("orchestrator has been stopped");
        }
        if !self.enabled {
            info!("sync disabled by configuration");
            return Ok(());
        }
        let mut slot = self.bootstrap.lock();
        if slot.is_some() {
            return Ok(());
        }
        if let Some((queue, period)) = &self.queue {
            queue.start(*period);
        }
        self.inner.state.send_replace(SyncState::Starting);
        let inner = Arc::clone(&self.inner);
        let retry = self.retry;
        *slot = Some(RepeatingTask::spawn("bootstrap", Duration::ZERO, retry, move || {
            let inner = Arc::clone(&inner);
            async move {
                let t0 = Instant::now();
                match inner.bootstrap().await {
                    Ok(()) => {
                        inner.state.send_replace(SyncState::Running);
                        info!(took_ms = t0.elapsed().as_millis() as u64, "sync running");
                        ControlFlow::Break(())
                    }
                    Err(e) => {
                        inner.state.send_replace(SyncState::Starting);
                        error!(error = %format!("{:#}", e), retry_ms = retry.as_millis() as u64, "bootstrap failed");
                        ControlFlow::Continue(())
                    }
                }
            }
        }));
        Ok(())
    }

    /// Tear everything down. Terminal: a stopped orchestrator cannot restart.
    pub async fn stop(&self) {
        *self.stopped.lock() = true;
        let task = self.bootstrap.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
        self.inner.stop_started().await;
        self.inner.control.release().await;
        if let Some((queue, _)) = &self.queue {
            queue.shutdown().await;
        }
        if let Some(hub) = &self.hub {
            hub.shutdown();
        }
        self.inner.state.send_replace(SyncState::Stopped);
        info!("sync stopped");
    }
}
