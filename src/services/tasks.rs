//! Background task supervision
//!
//! Fire-and-forget work (provisioning rounds, delayed re-attempts, background
//! persistence) is spawned through [`TaskSupervisor`]. Errors and panics of
//! those tasks land in one place: a structured log event tagged with the task
//! name, plus a failure counter exposed on the status endpoint.

use futures::FutureExt;
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Spawns background tasks and routes their failures to the log
#[derive(Debug, Clone, Default)]
pub struct TaskSupervisor {
    failures: Arc<AtomicU64>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` on the runtime. The handle may be dropped; the task keeps
    /// running and its outcome is still reported.
    pub fn spawn<F, E>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let failures = Arc::clone(&self.failures);

        tokio::spawn(async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {
                    tracing::debug!(task = name, "Background task finished");
                }
                Ok(Err(err)) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(task = name, error = %err, "Background task failed");
                }
                Err(panic) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        task = name,
                        panic = %panic_message(panic.as_ref()),
                        "Background task panicked"
                    );
                }
            }
        })
    }

    /// Failed or panicked tasks since startup
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
