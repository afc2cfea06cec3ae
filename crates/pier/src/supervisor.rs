use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug, error};

/// How a guarded background task ended.
///
/// Every guarded body reports its own termination explicitly instead of
/// signalling through a special error type; only [`TaskOutcome::Failed`] is
/// treated as a genuine fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The body ran to its natural end.
    Completed,
    /// The body terminated through an expected shutdown path, such as a
    /// readiness timeout or a connection closing underneath it.
    CancelledExpected,
    /// The body hit an unexpected failure.
    Failed(String),
}

/// A supervised background task whose expected termination never surfaces
/// as an error to whoever awaits it.
pub struct GuardedTask {
    label: String,
    handle: JoinHandle<()>,
}

impl GuardedTask {
    pub fn spawn<F>(label: impl Into<String>, body: F) -> Self
    where
        F: Future<Output = TaskOutcome> + Send + 'static,
    {
        let label = label.into();
        let task = label.clone();
        let handle = tokio::spawn(async move {
            match body.await {
                TaskOutcome::Completed => {
                    debug!(target: "pier::supervisor", %task, "task completed");
                }
                TaskOutcome::CancelledExpected => {
                    debug!(target: "pier::supervisor", %task, "task ended via expected shutdown path");
                }
                TaskOutcome::Failed(reason) => {
                    error!(target: "pier::supervisor", %task, %reason, "task failed");
                }
            }
        });
        Self { label, handle }
    }

    /// Abort the task and await it; cancellation is suppressed, a panic in
    /// the body is logged and swallowed so teardown never crashes the
    /// caller.
    pub async fn shutdown(self) {
        self.handle.abort();
        match self.handle.await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                error!(target: "pier::supervisor", task = %self.label, %err, "task join failed");
            }
        }
    }

    /// Best-effort cancellation without awaiting, for drop paths.
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_suppresses_cancellation() {
        let task = GuardedTask::spawn("pending", async {
            std::future::pending::<()>().await;
            TaskOutcome::Completed
        });
        // Must return promptly and must not panic.
        tokio::time::timeout(Duration::from_secs(1), task.shutdown())
            .await
            .expect("shutdown hung");
    }

    #[tokio::test]
    async fn completed_body_joins_cleanly() {
        let task = GuardedTask::spawn("done", async { TaskOutcome::Completed });
        task.shutdown().await;
    }

    #[tokio::test]
    async fn failed_body_does_not_propagate() {
        let task = GuardedTask::spawn("failing", async {
            TaskOutcome::Failed("synthetic failure".into())
        });
        // The failure is logged inside the wrapper; shutdown still succeeds.
        task.shutdown().await;
    }

    #[tokio::test]
    async fn is_finished_reflects_body_end() {
        let task = GuardedTask::spawn("quick", async { TaskOutcome::CancelledExpected });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(task.is_finished());
    }
}
