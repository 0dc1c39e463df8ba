// SPDX-License-Identifier: MIT OR Apache-2.0

//! The resource-store contract consumed by the controller runtime.
//!
//! The store is an external collaborator; the core only relies on the
//! [`Store`] trait: transactional typed resources with namespaces, labels,
//! finalizers, owners, phases, optimistic concurrency and watches.
//! [`MemoryStore`] is the in-process implementation used by tests and local
//! wiring.
//!
//! Typed convenience methods live on [`StoreExt`]; controllers normally go
//! through the runtime handle instead of calling the store directly.

mod memory;

pub use memory::MemoryStore;

use crate::error::{FleetError, Result};
use crate::resource::{DynResource, KindRef, LabelQuery, Resource, ResourcePointer, ResourceSpec};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// What happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Destroyed,
    /// Initial-sync marker delivered by some store backends.
    Bootstrapped,
    /// Heartbeat with no state change.
    Noop,
}

/// A watch event with old and new payloads.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub old: Option<DynResource>,
    pub new: Option<DynResource>,
}

impl Event {
    /// The most current payload carried by the event.
    #[must_use]
    pub fn resource(&self) -> Option<&DynResource> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// A subscription to one resource kind.
///
/// `bootstrap` is a consistent snapshot taken at subscription time; `events`
/// delivers everything that happens afterwards, without gaps.
pub struct WatchHandle {
    pub bootstrap: Vec<DynResource>,
    pub events: broadcast::Receiver<Event>,
}

/// Minimum store API required by the core.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Fetch a single resource.
    async fn get(&self, ptr: &ResourcePointer) -> Result<DynResource>;

    /// Insert a new resource. The owner is taken from the metadata; an empty
    /// owner marks a shared resource.
    async fn create(&self, res: DynResource) -> Result<DynResource>;

    /// Replace an existing resource. The submitted version must match the
    /// stored one (optimistic concurrency); a phase change between read and
    /// write fails with [`FleetError::PhaseConflict`].
    async fn update(&self, res: DynResource, writer: &str) -> Result<DynResource>;

    /// Transition Running → TearingDown. Returns `true` when the resource has
    /// no finalizers left and is ready to be destroyed.
    async fn teardown(&self, ptr: &ResourcePointer, writer: &str) -> Result<bool>;

    /// Remove a TearingDown resource with no finalizers.
    async fn destroy(&self, ptr: &ResourcePointer, writer: &str) -> Result<()>;

    /// List resources of a kind matching a label query.
    async fn list(&self, kind: &KindRef, query: &LabelQuery) -> Result<Vec<DynResource>>;

    /// Append a finalizer. Fails on a TearingDown resource.
    async fn add_finalizer(&self, ptr: &ResourcePointer, finalizer: &str) -> Result<()>;

    /// Remove a finalizer. A no-op when the finalizer is absent.
    async fn remove_finalizer(&self, ptr: &ResourcePointer, finalizer: &str) -> Result<()>;

    /// Subscribe to a kind: snapshot plus subsequent events.
    fn watch(&self, kind: &KindRef) -> WatchHandle;
}

/// Typed helpers over the erased [`Store`] API.
#[async_trait]
pub trait StoreExt: Store {
    /// Typed get; `Ok(None)` when absent.
    async fn get_typed<S: ResourceSpec>(&self, id: &str) -> Result<Option<Resource<S>>> {
        let ptr = ResourcePointer::new::<S>(id);
        match self.get(&ptr).await {
            Ok(res) => Ok(Some(res.typed::<S>().ok_or_else(|| {
                FleetError::Validation(format!("kind mismatch reading {ptr}"))
            })?)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Typed list.
    async fn list_typed<S: ResourceSpec>(&self, query: &LabelQuery) -> Result<Vec<Resource<S>>> {
        let items = self.list(&KindRef::of::<S>(), query).await?;
        items
            .into_iter()
            .map(|res| {
                let ptr = res.pointer();
                res.typed::<S>()
                    .ok_or_else(|| FleetError::Validation(format!("kind mismatch listing {ptr}")))
            })
            .collect()
    }

    /// Read-modify-write with optimistic concurrency, creating the resource
    /// when absent. The write is skipped entirely when the mutator leaves
    /// both spec and metadata unchanged, so re-running a controller with
    /// unchanged inputs performs no writes.
    async fn create_or_modify<S, I, F>(
        &self,
        writer: &str,
        id: &str,
        init: I,
        mutate: F,
    ) -> Result<Resource<S>>
    where
        S: ResourceSpec,
        I: Fn() -> S + Send + Sync,
        F: Fn(&mut Resource<S>) -> Result<()> + Send + Sync,
    {
        loop {
            match self.get_typed::<S>(id).await? {
                Some(current) => {
                    if current.metadata.is_tearing_down() {
                        return Err(FleetError::PhaseConflict(current.pointer().to_string()));
                    }
                    let mut next = current.clone();
                    mutate(&mut next)?;
                    if next == current {
                        return Ok(current);
                    }
                    match self.update(next.into_dyn(), writer).await {
                        Ok(stored) => {
                            return stored.typed::<S>().ok_or_else(|| {
                                FleetError::Validation(format!("kind mismatch writing {id}"))
                            })
                        }
                        Err(err) if err.is_version_conflict() => continue,
                        Err(err) => return Err(err),
                    }
                }
                None => {
                    let mut fresh = Resource::new(id, init());
                    fresh.metadata.owner = writer.to_string();
                    mutate(&mut fresh)?;
                    match self.create(fresh.into_dyn()).await {
                        Ok(stored) => {
                            return stored.typed::<S>().ok_or_else(|| {
                                FleetError::Validation(format!("kind mismatch creating {id}"))
                            })
                        }
                        Err(FleetError::AlreadyExists(_)) => continue,
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// Like [`StoreExt::create_or_modify`] but creates the resource as
    /// *shared* (empty owner), so cooperating controllers can write and
    /// destroy it too.
    async fn create_or_modify_shared<S, I, F>(
        &self,
        writer: &str,
        id: &str,
        init: I,
        mutate: F,
    ) -> Result<Resource<S>>
    where
        S: ResourceSpec,
        I: Fn() -> S + Send + Sync,
        F: Fn(&mut Resource<S>) -> Result<()> + Send + Sync,
    {
        loop {
            match self.get_typed::<S>(id).await? {
                Some(current) => {
                    if current.metadata.is_tearing_down() {
                        return Err(FleetError::PhaseConflict(current.pointer().to_string()));
                    }
                    let mut next = current.clone();
                    mutate(&mut next)?;
                    if next == current {
                        return Ok(current);
                    }
                    match self.update(next.into_dyn(), writer).await {
                        Ok(stored) => {
                            return stored.typed::<S>().ok_or_else(|| {
                                FleetError::Validation(format!("kind mismatch writing {id}"))
                            })
                        }
                        Err(err) if err.is_version_conflict() => continue,
                        Err(err) => return Err(err),
                    }
                }
                None => {
                    let mut fresh = Resource::new(id, init());
                    mutate(&mut fresh)?;
                    match self.create(fresh.into_dyn()).await {
                        Ok(stored) => {
                            return stored.typed::<S>().ok_or_else(|| {
                                FleetError::Validation(format!("kind mismatch creating {id}"))
                            })
                        }
                        Err(FleetError::AlreadyExists(_)) => continue,
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// Like [`StoreExt::create_or_modify`] but never creates; `Ok(None)` when
    /// the resource is absent.
    async fn modify<S, F>(&self, writer: &str, id: &str, mutate: F) -> Result<Option<Resource<S>>>
    where
        S: ResourceSpec,
        F: Fn(&mut Resource<S>) -> Result<()> + Send + Sync,
    {
        loop {
            let Some(current) = self.get_typed::<S>(id).await? else {
                return Ok(None);
            };
            if current.metadata.is_tearing_down() {
                return Err(FleetError::PhaseConflict(current.pointer().to_string()));
            }
            let mut next = current.clone();
            mutate(&mut next)?;
            if next == current {
                return Ok(Some(current));
            }
            match self.update(next.into_dyn(), writer).await {
                Ok(stored) => {
                    return Ok(Some(stored.typed::<S>().ok_or_else(|| {
                        FleetError::Validation(format!("kind mismatch writing {id}"))
                    })?))
                }
                Err(err) if err.is_version_conflict() => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Tear a resource down and destroy it once no finalizers remain.
    /// Returns `true` when the resource is gone.
    async fn teardown_and_destroy<S: ResourceSpec>(&self, writer: &str, id: &str) -> Result<bool> {
        let ptr = ResourcePointer::new::<S>(id);
        let ready = match self.teardown(&ptr, writer).await {
            Ok(ready) => ready,
            Err(err) if err.is_not_found() => return Ok(true),
            Err(err) => return Err(err),
        };
        if !ready {
            return Ok(false);
        }
        match self.destroy(&ptr, writer).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(true),
            Err(err) => Err(err),
        }
    }
}

impl<T: Store + ?Sized> StoreExt for T {}
