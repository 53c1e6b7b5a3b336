//! Detached write-behind tasks.
//!
//! Work handed to [`BackgroundWriter::spawn`] runs on the tokio runtime with
//! nobody awaiting it. The request that scheduled it has already produced its
//! response; a failure or a panic is logged and counted, and goes nowhere else.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn, Instrument};

use crate::domain::errors::StoreResult;

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    idle: Notify,
}

/// Releases one pending slot on drop, so a task that unwinds still counts down.
struct PendingSlot(Arc<Counters>);

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Background task counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundStats {
    pub pending: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Spawns fire-and-forget persistence work and keeps count of it.
#[derive(Clone, Default)]
pub struct BackgroundWriter {
    counters: Arc<Counters>,
}

impl BackgroundWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `work` as a detached task labelled `label` in the logs.
    pub fn spawn<F>(&self, label: &'static str, work: F)
    where
        F: Future<Output = StoreResult<()>> + Send + 'static,
    {
        let counters = Arc::clone(&self.counters);
        counters.pending.fetch_add(1, Ordering::AcqRel);
        let slot = PendingSlot(Arc::clone(&counters));

        let span = tracing::debug_span!("background_write", task = label);
        tokio::spawn(
            async move {
                let _slot = slot;
                match AssertUnwindSafe(work).catch_unwind().await {
                    Ok(Ok(())) => {
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                        debug!("background write finished");
                    }
                    Ok(Err(err)) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(task = label, error = %err, "background write failed");
                    }
                    Err(panic) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(task = label, error = %panic_message(panic.as_ref()), "background write panicked");
                    }
                }
            }
            .instrument(span),
        );
    }

    pub fn stats(&self) -> BackgroundStats {
        BackgroundStats {
            pending: self.counters.pending.load(Ordering::Acquire),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Wait until no task is pending. Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.counters.idle.notified();
                if self.counters.pending.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "internal error".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::StoreError;

    #[tokio::test]
    async fn test_successful_and_failed_tasks_are_counted() {
        let writer = BackgroundWriter::new();
        writer.spawn("ok", async { Ok(()) });
        writer.spawn("fails", async { Err(StoreError::Injected("boom".into())) });

        assert!(writer.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(
            writer.stats(),
            BackgroundStats {
                pending: 0,
                completed: 1,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_wait_idle_times_out_on_stuck_task() {
        let writer = BackgroundWriter::new();
        writer.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });

        assert!(!writer.wait_idle(Duration::from_millis(20)).await);
        assert_eq!(writer.stats().pending, 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_counted_as_failed() {
        let writer = BackgroundWriter::new();
        writer.spawn(
            "panics",
            futures::future::lazy(|_| -> StoreResult<()> { panic!("store exploded") }),
        );
        writer.spawn("ok", async { Ok(()) });

        assert!(writer.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(
            writer.stats(),
            BackgroundStats {
                pending: 0,
                completed: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&"owned".to_string()), "owned");
        assert_eq!(panic_message(&42_u8), "internal error");
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_nothing_pending() {
        let writer = BackgroundWriter::new();
        assert!(writer.wait_idle(Duration::from_millis(1)).await);
    }
}
