// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-controller reconcile queue.
//!
//! Guarantees the runtime's scheduling contract:
//! - reconciles for the same primary ID are serialized;
//! - events arriving while a reconcile for that ID is in flight coalesce
//!   into exactly one follow-up reconcile;
//! - duplicate pending events collapse.

use crate::resource::ResourcePointer;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ResourcePointer>,
    // Everything in `ready`.
    queued: HashSet<ResourcePointer>,
    running: HashSet<ResourcePointer>,
    // Re-enqueued while running; moved back to `ready` on completion.
    deferred: HashSet<ResourcePointer>,
}

/// Coalescing work queue keyed by primary resource pointer.
#[derive(Default)]
pub(crate) struct ReconcileQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ReconcileQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a pointer to the queue. Duplicates of pending work are dropped;
    /// pointers currently being reconciled are parked until the reconcile
    /// finishes.
    pub(crate) fn enqueue(&self, ptr: ResourcePointer) {
        let mut state = self.state.lock().unwrap();
        if state.running.contains(&ptr) {
            state.deferred.insert(ptr);
            return;
        }
        if state.queued.insert(ptr.clone()) {
            state.ready.push_back(ptr);
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Take the next pointer, marking it running. Returns `None` on cancel.
    pub(crate) async fn next(&self, cancel: &CancellationToken) -> Option<ResourcePointer> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(ptr) = state.ready.pop_front() {
                    state.queued.remove(&ptr);
                    state.running.insert(ptr.clone());
                    return Some(ptr);
                }
            }
            tokio::select! {
                () = self.notify.notified() => {}
                () = cancel.cancelled() => return None,
            }
        }
    }

    /// Mark a reconcile finished. Any events that arrived in the meantime
    /// put the pointer straight back on the queue.
    pub(crate) fn done(&self, ptr: &ResourcePointer) {
        let mut state = self.state.lock().unwrap();
        state.running.remove(ptr);
        if state.deferred.remove(ptr) && state.queued.insert(ptr.clone()) {
            state.ready.push_back(ptr.clone());
            drop(state);
            self.notify.notify_waiters();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }
}
