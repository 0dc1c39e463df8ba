// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory resource store.
//!
//! Implements the full [`Store`] contract: optimistic concurrency on the
//! per-ID version counter, owner-exclusive writes, the Running → TearingDown
//! phase machine, finalizer bookkeeping and gap-free watches. Suitable for
//! tests and for single-process deployments that keep all state external.

use super::{Event, EventKind, Store, WatchHandle};
use crate::error::{FleetError, Result};
use crate::resource::{DynResource, KindRef, LabelQuery, Phase, ResourcePointer};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::broadcast;

const WATCH_BUFFER: usize = 4096;

#[derive(Default)]
struct State {
    // kind -> id -> resource
    resources: HashMap<KindRef, BTreeMap<String, DynResource>>,
    watchers: HashMap<KindRef, broadcast::Sender<Event>>,
}

/// An in-memory [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(state: &mut State, kind: &KindRef, event: Event) {
        if let Some(tx) = state.watchers.get(kind) {
            // Nobody listening is fine.
            let _ = tx.send(event);
        }
    }

    fn check_writer(stored: &DynResource, writer: &str) -> Result<()> {
        let owner = &stored.metadata.owner;
        if !owner.is_empty() && owner != writer {
            return Err(FleetError::OwnerConflict {
                resource: stored.pointer().to_string(),
                owner: owner.clone(),
                writer: writer.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, ptr: &ResourcePointer) -> Result<DynResource> {
        let state = self.state.lock().unwrap();
        state
            .resources
            .get(&ptr.kind_ref())
            .and_then(|items| items.get(&ptr.id))
            .cloned()
            .ok_or_else(|| FleetError::NotFound(ptr.to_string()))
    }

    async fn create(&self, mut res: DynResource) -> Result<DynResource> {
        let mut state = self.state.lock().unwrap();
        let kind = res.metadata.pointer().kind_ref();
        let items = state.resources.entry(kind.clone()).or_default();
        if items.contains_key(&res.metadata.id) {
            return Err(FleetError::AlreadyExists(res.pointer().to_string()));
        }
        res.metadata.version = 1;
        res.metadata.phase = Phase::Running;
        items.insert(res.metadata.id.clone(), res.clone());
        Self::publish(
            &mut state,
            &kind,
            Event {
                kind: EventKind::Created,
                old: None,
                new: Some(res.clone()),
            },
        );
        Ok(res)
    }

    async fn update(&self, mut res: DynResource, writer: &str) -> Result<DynResource> {
        let mut state = self.state.lock().unwrap();
        let kind = res.metadata.pointer().kind_ref();
        let ptr = res.pointer();
        let items = state
            .resources
            .get_mut(&kind)
            .ok_or_else(|| FleetError::NotFound(ptr.to_string()))?;
        let stored = items
            .get(&res.metadata.id)
            .ok_or_else(|| FleetError::NotFound(ptr.to_string()))?
            .clone();

        Self::check_writer(&stored, writer)?;
        if stored.metadata.phase != res.metadata.phase {
            return Err(FleetError::PhaseConflict(ptr.to_string()));
        }
        if stored.metadata.version != res.metadata.version {
            return Err(FleetError::VersionConflict {
                resource: ptr.to_string(),
                submitted: res.metadata.version,
                stored: stored.metadata.version,
            });
        }

        // Owner, creation stamp and finalizers are store-managed.
        res.metadata.owner = stored.metadata.owner.clone();
        res.metadata.created = stored.metadata.created;
        res.metadata.finalizers = stored.metadata.finalizers.clone();
        res.metadata.version = stored.metadata.version + 1;

        items.insert(res.metadata.id.clone(), res.clone());
        Self::publish(
            &mut state,
            &kind,
            Event {
                kind: EventKind::Updated,
                old: Some(stored),
                new: Some(res.clone()),
            },
        );
        Ok(res)
    }

    async fn teardown(&self, ptr: &ResourcePointer, writer: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let kind = ptr.kind_ref();
        let items = state
            .resources
            .get_mut(&kind)
            .ok_or_else(|| FleetError::NotFound(ptr.to_string()))?;
        let stored = items
            .get_mut(&ptr.id)
            .ok_or_else(|| FleetError::NotFound(ptr.to_string()))?;

        Self::check_writer(stored, writer)?;
        if stored.metadata.phase == Phase::TearingDown {
            return Ok(stored.metadata.finalizers.is_empty());
        }

        let old = stored.clone();
        stored.metadata.phase = Phase::TearingDown;
        stored.metadata.version += 1;
        let ready = stored.metadata.finalizers.is_empty();
        let new = stored.clone();
        Self::publish(
            &mut state,
            &kind,
            Event {
                kind: EventKind::Updated,
                old: Some(old),
                new: Some(new),
            },
        );
        Ok(ready)
    }

    async fn destroy(&self, ptr: &ResourcePointer, writer: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let kind = ptr.kind_ref();
        let items = state
            .resources
            .get_mut(&kind)
            .ok_or_else(|| FleetError::NotFound(ptr.to_string()))?;
        let stored = items
            .get(&ptr.id)
            .ok_or_else(|| FleetError::NotFound(ptr.to_string()))?;

        Self::check_writer(stored, writer)?;
        if stored.metadata.phase != Phase::TearingDown {
            return Err(FleetError::PhaseConflict(ptr.to_string()));
        }
        if !stored.metadata.finalizers.is_empty() {
            return Err(FleetError::PendingFinalizers(ptr.to_string()));
        }

        let old = items.remove(&ptr.id);
        Self::publish(
            &mut state,
            &kind,
            Event {
                kind: EventKind::Destroyed,
                old,
                new: None,
            },
        );
        Ok(())
    }

    async fn list(&self, kind: &KindRef, query: &LabelQuery) -> Result<Vec<DynResource>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .resources
            .get(kind)
            .map(|items| {
                items
                    .values()
                    .filter(|res| query.matches(&res.metadata.labels))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_finalizer(&self, ptr: &ResourcePointer, finalizer: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let kind = ptr.kind_ref();
        let items = state
            .resources
            .get_mut(&kind)
            .ok_or_else(|| FleetError::NotFound(ptr.to_string()))?;
        let stored = items
            .get_mut(&ptr.id)
            .ok_or_else(|| FleetError::NotFound(ptr.to_string()))?;

        if stored.metadata.phase == Phase::TearingDown {
            return Err(FleetError::TearingDown(ptr.to_string()));
        }
        if stored.metadata.has_finalizer(finalizer) {
            return Ok(());
        }

        let old = stored.clone();
        stored.metadata.finalizers.push(finalizer.to_string());
        stored.metadata.version += 1;
        let new = stored.clone();
        Self::publish(
            &mut state,
            &kind,
            Event {
                kind: EventKind::Updated,
                old: Some(old),
                new: Some(new),
            },
        );
        Ok(())
    }

    async fn remove_finalizer(&self, ptr: &ResourcePointer, finalizer: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let kind = ptr.kind_ref();
        let items = state
            .resources
            .get_mut(&kind)
            .ok_or_else(|| FleetError::NotFound(ptr.to_string()))?;
        let stored = items
            .get_mut(&ptr.id)
            .ok_or_else(|| FleetError::NotFound(ptr.to_string()))?;

        if !stored.metadata.has_finalizer(finalizer) {
            return Ok(());
        }

        let old = stored.clone();
        stored.metadata.finalizers.retain(|f| f != finalizer);
        stored.metadata.version += 1;
        let new = stored.clone();
        Self::publish(
            &mut state,
            &kind,
            Event {
                kind: EventKind::Updated,
                old: Some(old),
                new: Some(new),
            },
        );
        Ok(())
    }

    fn watch(&self, kind: &KindRef) -> WatchHandle {
        let mut state = self.state.lock().unwrap();
        let bootstrap = state
            .resources
            .get(kind)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default();
        let events = state
            .watchers
            .entry(kind.clone())
            .or_insert_with(|| broadcast::channel(WATCH_BUFFER).0)
            .subscribe();
        WatchHandle { bootstrap, events }
    }
}
