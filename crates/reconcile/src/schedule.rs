//! Self-rescheduling background work with an explicit cancel handle.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs a closure after an initial delay and then again `period` after each
/// run completes, until the closure breaks or the task is cancelled.
///
/// Cancellation is only observed between runs: a run in progress always
/// completes.
pub struct RepeatingTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RepeatingTask {
    pub fn spawn<F, Fut>(name: &'static str, initial: Duration, period: Duration, mut run: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut delay = initial;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if run().await.is_break() {
                    break;
                }
                delay = period;
            }
            debug!(task = name, "repeating task finished");
        });
        Self { name, cancel, handle: Some(handle) }
    }

    pub fn name(&self) -> &'static str { self.name }

    pub fn cancel(&self) { self.cancel.cancel(); }

    pub fn is_finished(&self) -> bool { self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true) }

    /// Cancel and wait for a run in progress to complete.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) { self.cancel.cancel(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn reschedules_until_break() {
        let runs = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&runs);
        let task = RepeatingTask::spawn("count", Duration::ZERO, Duration::from_millis(10), move || {
            let r = Arc::clone(&r);
            async move {
                if r.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_runs() {
        let runs = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&runs);
        let task = RepeatingTask::spawn("tick", Duration::from_millis(10), Duration::from_millis(10), move || {
            let r = Arc::clone(&r);
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        });
        tokio::time::sleep(Duration::from_millis(25)).await;
        task.stop().await;
        let seen = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
        assert_eq!(seen, 2);
    }
}
