// SPDX-License-Identifier: MIT OR Apache-2.0

//! The task-runner pattern.
//!
//! Some controllers need a long-running worker per primary resource (for
//! example, streaming a machine's status over its API connection). The
//! runner keys tasks by primary ID and guarantees exactly one concurrent
//! task per primary: a reconcile hands it the desired task spec, and the
//! runner starts a task if none runs, restarts it when the spec changed
//! (deep equality), or leaves it alone.
//!
//! Tasks emit events into a single fan-in channel; the controller's run
//! hook drains it and writes aggregated updates through the normal modify
//! path.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A restartable long-running task description.
///
/// Equality decides restarts: a spec that compares equal to the running one
/// leaves the task untouched.
#[async_trait]
pub trait FleetTask: Clone + PartialEq + Send + Sync + 'static {
    type Event: Send + 'static;

    /// Run until cancelled. Transient failures should be retried inside;
    /// a returned error ends the task until the next spec change.
    async fn run(
        &self,
        events: mpsc::Sender<Self::Event>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

struct RunningTask<T> {
    spec: T,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Supervises one task per primary ID.
pub struct TaskRunner<T: FleetTask> {
    tasks: tokio::sync::Mutex<HashMap<String, RunningTask<T>>>,
    events_tx: mpsc::Sender<T::Event>,
}

impl<T: FleetTask> TaskRunner<T> {
    /// Create a runner and the fan-in event receiver for the run hook.
    #[must_use]
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<T::Event>) {
        let (events_tx, events_rx) = mpsc::channel(buffer);
        (
            Self {
                tasks: tokio::sync::Mutex::new(HashMap::new()),
                events_tx,
            },
            events_rx,
        )
    }

    /// Ensure the task for `id` runs with exactly this spec.
    pub async fn ensure(&self, id: &str, spec: T) {
        let mut tasks = self.tasks.lock().await;

        if let Some(existing) = tasks.get(id) {
            if existing.spec == spec {
                return;
            }
            debug!(id, "task spec changed, restarting");
            let existing = tasks.remove(id).expect("present");
            existing.cancel.cancel();
            let _ = existing.handle.await;
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task_spec = spec.clone();
        let events = self.events_tx.clone();
        let task_id = id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(err) = task_spec.run(events, task_cancel).await {
                warn!(id = %task_id, %err, "task exited with error");
            }
        });

        tasks.insert(
            id.to_string(),
            RunningTask {
                spec,
                cancel,
                handle,
            },
        );
    }

    /// Stop and await the task for `id`. Returns `true` when one ran.
    pub async fn stop(&self, id: &str) -> bool {
        let removed = self.tasks.lock().await.remove(id);
        match removed {
            Some(task) => {
                task.cancel.cancel();
                let _ = task.handle.await;
                true
            }
            None => false,
        }
    }

    /// Stop everything; used from shutdown hooks.
    pub async fn stop_all(&self) {
        let drained: Vec<_> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().collect()
        };
        for (_, task) in drained {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }

    /// Number of live tasks.
    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct TickTask {
        label: String,
    }

    #[async_trait]
    impl FleetTask for TickTask {
        type Event = String;

        async fn run(
            &self,
            events: mpsc::Sender<String>,
            cancel: CancellationToken,
        ) -> Result<()> {
            let _ = events.send(format!("start:{}", self.label)).await;
            cancel.cancelled().await;
            let _ = events.send(format!("stop:{}", self.label)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_one_task_per_id() {
        let (runner, mut events) = TaskRunner::<TickTask>::new(16);

        runner
            .ensure(
                "m-1",
                TickTask {
                    label: "a".into(),
                },
            )
            .await;
        assert_eq!(events.recv().await.unwrap(), "start:a");
        assert_eq!(runner.len().await, 1);

        // Same spec: no restart, no events.
        runner
            .ensure(
                "m-1",
                TickTask {
                    label: "a".into(),
                },
            )
            .await;
        assert_eq!(runner.len().await, 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spec_change_restarts() {
        let (runner, mut events) = TaskRunner::<TickTask>::new(16);

        runner
            .ensure(
                "m-1",
                TickTask {
                    label: "a".into(),
                },
            )
            .await;
        assert_eq!(events.recv().await.unwrap(), "start:a");

        runner
            .ensure(
                "m-1",
                TickTask {
                    label: "b".into(),
                },
            )
            .await;
        assert_eq!(events.recv().await.unwrap(), "stop:a");
        assert_eq!(events.recv().await.unwrap(), "start:b");
        assert_eq!(runner.len().await, 1);
    }

    #[tokio::test]
    async fn test_stop_and_stop_all() {
        let (runner, mut events) = TaskRunner::<TickTask>::new(16);

        runner
            .ensure(
                "m-1",
                TickTask {
                    label: "a".into(),
                },
            )
            .await;
        runner
            .ensure(
                "m-2",
                TickTask {
                    label: "b".into(),
                },
            )
            .await;
        assert_eq!(runner.len().await, 2);
        // Drain the two start events in either order.
        let _ = events.recv().await;
        let _ = events.recv().await;

        assert!(runner.stop("m-1").await);
        assert!(!runner.stop("m-1").await);
        assert_eq!(runner.len().await, 1);

        runner.stop_all().await;
        assert!(runner.is_empty().await);

        tokio::time::timeout(Duration::from_secs(1), async {
            let mut stops = 0;
            while stops < 2 {
                if events.recv().await.unwrap().starts_with("stop:") {
                    stops += 1;
                }
            }
        })
        .await
        .unwrap();
    }
}
