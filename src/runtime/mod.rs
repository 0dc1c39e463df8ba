// SPDX-License-Identifier: MIT OR Apache-2.0

//! The queue-driven controller runtime.
//!
//! Controllers register with declared inputs and outputs; the runtime
//! subscribes to store watches, routes events through the controllers'
//! mappers and drives [`QController::reconcile`] from a per-controller
//! coalescing queue with bounded concurrency.
//!
//! Scheduling contract:
//! - within one controller, reconciles for the same primary ID are
//!   serialized and duplicate events coalesce;
//! - across controllers, reconciles run concurrently without ordering
//!   guarantees beyond those induced by finalizers;
//! - failed reconciles back off exponentially per primary ID.

mod backoff;
mod queue;

pub use backoff::{BackoffStrategy, ExponentialBackoff, FixedBackoff, NoBackoff};

use crate::error::{FleetError, Result};
use crate::resource::{
    KindRef, LabelQuery, Metadata, Resource, ResourcePointer, ResourceSpec,
};
use crate::store::{EventKind, Store, StoreExt};
use async_trait::async_trait;
use queue::ReconcileQueue;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

/// Routes an input event to the primary IDs that must be re-reconciled.
#[async_trait]
pub trait Mapper: Send + Sync + 'static {
    async fn map(
        &self,
        store: &Arc<dyn Store>,
        md: &Metadata,
    ) -> Result<Vec<ResourcePointer>>;
}

/// How events for an input type reach the reconcile queue.
#[derive(Clone)]
pub enum InputMapping {
    /// The input shares its identity with the primary; events enqueue the
    /// event resource's own pointer.
    PrimaryQueued,
    /// Events run through the mapper.
    Mapped(Arc<dyn Mapper>),
    /// Events run through the mapper, but only once the input is ready to be
    /// destroyed (TearingDown with no finalizers, or already destroyed).
    MappedDestroyReady(Arc<dyn Mapper>),
    /// Read-only dependency; never triggers reconciles.
    Weak,
}

/// A declared controller input.
#[derive(Clone)]
pub struct InputBinding {
    pub kind: KindRef,
    pub mapping: InputMapping,
}

/// Output sharing discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSharing {
    /// Exactly one controller owns the type.
    Exclusive,
    /// Several cooperating controllers write the type.
    Shared,
}

/// A declared controller output.
#[derive(Debug, Clone)]
pub struct OutputBinding {
    pub kind: KindRef,
    pub sharing: OutputSharing,
}

/// Declared shape of a controller.
#[derive(Clone, Default)]
pub struct ControllerSettings {
    pub inputs: Vec<InputBinding>,
    pub outputs: Vec<OutputBinding>,
    pub concurrency: usize,
}

impl ControllerSettings {
    #[must_use]
    pub fn builder() -> ControllerSettingsBuilder {
        ControllerSettingsBuilder::default()
    }
}

/// Builder for [`ControllerSettings`].
#[derive(Default)]
pub struct ControllerSettingsBuilder {
    inputs: Vec<InputBinding>,
    outputs: Vec<OutputBinding>,
    concurrency: Option<usize>,
}

impl ControllerSettingsBuilder {
    /// Declare the primary-queued input type.
    #[must_use]
    pub fn primary<S: ResourceSpec>(mut self) -> Self {
        self.inputs.push(InputBinding {
            kind: KindRef::of::<S>(),
            mapping: InputMapping::PrimaryQueued,
        });
        self
    }

    /// Declare a mapped input type.
    #[must_use]
    pub fn mapped<S: ResourceSpec>(mut self, mapper: Arc<dyn Mapper>) -> Self {
        self.inputs.push(InputBinding {
            kind: KindRef::of::<S>(),
            mapping: InputMapping::Mapped(mapper),
        });
        self
    }

    /// Declare a mapped input that only triggers when destroy-ready.
    #[must_use]
    pub fn mapped_destroy_ready<S: ResourceSpec>(mut self, mapper: Arc<dyn Mapper>) -> Self {
        self.inputs.push(InputBinding {
            kind: KindRef::of::<S>(),
            mapping: InputMapping::MappedDestroyReady(mapper),
        });
        self
    }

    /// Declare a weak (read-only, non-triggering) input type.
    #[must_use]
    pub fn weak<S: ResourceSpec>(mut self) -> Self {
        self.inputs.push(InputBinding {
            kind: KindRef::of::<S>(),
            mapping: InputMapping::Weak,
        });
        self
    }

    /// Declare an exclusively-owned output type.
    #[must_use]
    pub fn exclusive_output<S: ResourceSpec>(mut self) -> Self {
        self.outputs.push(OutputBinding {
            kind: KindRef::of::<S>(),
            sharing: OutputSharing::Exclusive,
        });
        self
    }

    /// Declare a shared output type.
    #[must_use]
    pub fn shared_output<S: ResourceSpec>(mut self) -> Self {
        self.outputs.push(OutputBinding {
            kind: KindRef::of::<S>(),
            sharing: OutputSharing::Shared,
        });
        self
    }

    /// Set the reconcile concurrency (default 1).
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    #[must_use]
    pub fn build(self) -> ControllerSettings {
        ControllerSettings {
            inputs: self.inputs,
            outputs: self.outputs,
            concurrency: self.concurrency.unwrap_or(1),
        }
    }
}

/// Result of a successful reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged; wait for the next event.
    Done,
    /// Inputs not ready; the last successful output stays untouched.
    Skip,
    /// Converged for now, run again after the delay.
    Requeue(Duration),
}

/// A registered controller.
#[async_trait]
pub trait QController: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn settings(&self) -> ControllerSettings;

    /// Reconcile one primary. Must be idempotent: identical observed inputs
    /// produce identical outputs and, on a second pass, no writes.
    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome>;

    /// Optional long-running companion; started once and cancelled on
    /// shutdown.
    async fn run_hook(&self, rt: QRuntime, cancel: CancellationToken) -> Result<()> {
        let _ = (rt, cancel);
        Ok(())
    }

    /// Invoked after all reconcile workers for this controller have exited.
    async fn shutdown_hook(&self) {}
}

/// Store handle scoped to one controller.
///
/// All writes go out under the controller's name, so the store can enforce
/// output exclusivity.
#[derive(Clone)]
pub struct QRuntime {
    store: Arc<dyn Store>,
    owner: String,
}

impl QRuntime {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
        }
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn get<S: ResourceSpec>(&self, id: &str) -> Result<Option<Resource<S>>> {
        self.store.get_typed::<S>(id).await
    }

    pub async fn list<S: ResourceSpec>(&self, query: &LabelQuery) -> Result<Vec<Resource<S>>> {
        self.store.list_typed::<S>(query).await
    }

    /// Owner-scoped read-modify-write, creating the output when absent.
    /// A phase conflict is swallowed as a benign race (`Ok(None)`); the next
    /// watch event retries.
    pub async fn create_or_modify<S, I, F>(
        &self,
        id: &str,
        init: I,
        mutate: F,
    ) -> Result<Option<Resource<S>>>
    where
        S: ResourceSpec,
        I: Fn() -> S + Send + Sync,
        F: Fn(&mut Resource<S>) -> Result<()> + Send + Sync,
    {
        match self
            .store
            .create_or_modify::<S, I, F>(&self.owner, id, init, mutate)
            .await
        {
            Ok(res) => Ok(Some(res)),
            Err(err) if err.is_phase_conflict() => {
                debug!(owner = %self.owner, id, "phase conflict, deferring to next event");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Like [`QRuntime::create_or_modify`] for shared outputs: the resource
    /// is created without an exclusive owner so cooperating controllers can
    /// write and destroy it too.
    pub async fn create_or_modify_shared<S, I, F>(
        &self,
        id: &str,
        init: I,
        mutate: F,
    ) -> Result<Option<Resource<S>>>
    where
        S: ResourceSpec,
        I: Fn() -> S + Send + Sync,
        F: Fn(&mut Resource<S>) -> Result<()> + Send + Sync,
    {
        match self
            .store
            .create_or_modify_shared::<S, I, F>(&self.owner, id, init, mutate)
            .await
        {
            Ok(res) => Ok(Some(res)),
            Err(err) if err.is_phase_conflict() => {
                debug!(owner = %self.owner, id, "phase conflict, deferring to next event");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Owner-scoped modify of an existing resource; `Ok(None)` when absent
    /// or when a phase conflict was swallowed.
    pub async fn modify<S, F>(&self, id: &str, mutate: F) -> Result<Option<Resource<S>>>
    where
        S: ResourceSpec,
        F: Fn(&mut Resource<S>) -> Result<()> + Send + Sync,
    {
        match self.store.modify::<S, F>(&self.owner, id, mutate).await {
            Ok(res) => Ok(res),
            Err(err) if err.is_phase_conflict() => {
                debug!(owner = %self.owner, id, "phase conflict, deferring to next event");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Tear down and, once finalizers clear, destroy an owned resource.
    /// Returns `true` when the resource is gone.
    pub async fn teardown_and_destroy<S: ResourceSpec>(&self, id: &str) -> Result<bool> {
        self.store.teardown_and_destroy::<S>(&self.owner, id).await
    }

    pub async fn teardown(&self, ptr: &ResourcePointer) -> Result<bool> {
        self.store.teardown(ptr, &self.owner).await
    }

    pub async fn destroy(&self, ptr: &ResourcePointer) -> Result<()> {
        self.store.destroy(ptr, &self.owner).await
    }

    /// Claim an input with this controller's finalizer.
    pub async fn add_finalizer(&self, ptr: &ResourcePointer) -> Result<()> {
        match self.store.add_finalizer(ptr, &self.owner).await {
            Ok(()) => Ok(()),
            // The input started tearing down between read and claim; the
            // teardown path of the next reconcile handles it.
            Err(FleetError::TearingDown(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn remove_finalizer(&self, ptr: &ResourcePointer) -> Result<()> {
        self.store.remove_finalizer(ptr, &self.owner).await
    }
}

/// Registers controllers and drives them from watch events.
pub struct ControllerRuntime {
    store: Arc<dyn Store>,
    controllers: Vec<Arc<dyn QController>>,
    backoff: ExponentialBackoff,
}

impl ControllerRuntime {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            controllers: Vec::new(),
            backoff: ExponentialBackoff::default(),
        }
    }

    /// Override the error backoff strategy (tests shrink it).
    #[must_use]
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn register(&mut self, controller: impl QController) -> &mut Self {
        self.controllers.push(Arc::new(controller));
        self
    }

    /// Validate registrations, subscribe to inputs and spawn workers.
    ///
    /// # Errors
    ///
    /// Fails when two controllers declare the same exclusive output type.
    pub fn start(self) -> Result<RunningRuntime> {
        let mut exclusive: HashSet<KindRef> = HashSet::new();
        for controller in &self.controllers {
            for output in controller.settings().outputs {
                if output.sharing == OutputSharing::Exclusive
                    && !exclusive.insert(output.kind.clone())
                {
                    return Err(FleetError::Validation(format!(
                        "duplicate exclusive output {} declared by {}",
                        output.kind,
                        controller.name()
                    )));
                }
            }
        }

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        for controller in &self.controllers {
            handles.extend(spawn_controller(
                Arc::clone(&self.store),
                Arc::clone(controller),
                self.backoff,
                cancel.clone(),
            ));
        }

        info!(controllers = self.controllers.len(), "controller runtime started");

        Ok(RunningRuntime {
            cancel,
            handles,
            controllers: self.controllers,
        })
    }
}

/// Handle to a started runtime.
pub struct RunningRuntime {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    controllers: Vec<Arc<dyn QController>>,
}

impl RunningRuntime {
    /// Token cancelled on shutdown; hooks may watch it.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel everything, wait for workers to drain, then run shutdown
    /// hooks.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        for controller in &self.controllers {
            controller.shutdown_hook().await;
        }
        info!("controller runtime stopped");
    }
}

fn spawn_controller(
    store: Arc<dyn Store>,
    controller: Arc<dyn QController>,
    backoff: ExponentialBackoff,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let name = controller.name();
    let settings = controller.settings();
    let queue = Arc::new(ReconcileQueue::new());
    let qrt = QRuntime::new(Arc::clone(&store), name);
    let mut handles = Vec::new();

    for binding in settings.inputs {
        if matches!(binding.mapping, InputMapping::Weak) {
            continue;
        }
        handles.push(tokio::spawn(dispatch_input(
            Arc::clone(&store),
            binding,
            Arc::clone(&queue),
            cancel.clone(),
            name,
        )));
    }

    let attempts: Arc<Mutex<HashMap<ResourcePointer, u32>>> = Arc::default();
    for _ in 0..settings.concurrency {
        let controller = Arc::clone(&controller);
        let queue = Arc::clone(&queue);
        let qrt = qrt.clone();
        let cancel = cancel.clone();
        let attempts = Arc::clone(&attempts);
        handles.push(tokio::spawn(async move {
            worker_loop(controller, queue, qrt, backoff, attempts, cancel).await;
        }));
    }

    {
        let controller = Arc::clone(&controller);
        let qrt = qrt.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = controller.run_hook(qrt, cancel).await {
                warn!(controller = controller.name(), %err, "run hook failed");
            }
        }));
    }

    handles
}

async fn dispatch_input(
    store: Arc<dyn Store>,
    binding: InputBinding,
    queue: Arc<ReconcileQueue>,
    cancel: CancellationToken,
    controller: &'static str,
) {
    let mut handle = store.watch(&binding.kind);

    for res in std::mem::take(&mut handle.bootstrap) {
        map_and_enqueue(&store, &binding, &queue, &res.metadata, false, controller).await;
    }

    loop {
        let event = tokio::select! {
            event = handle.events.recv() => event,
            () = cancel.cancelled() => return,
        };
        match event {
            Ok(event) => match event.kind {
                EventKind::Noop => {}
                EventKind::Bootstrapped => {
                    // Backend re-synced; replay the current state.
                    match store.list(&binding.kind, &LabelQuery::all()).await {
                        Ok(items) => {
                            for res in items {
                                map_and_enqueue(
                                    &store,
                                    &binding,
                                    &queue,
                                    &res.metadata,
                                    false,
                                    controller,
                                )
                                .await;
                            }
                        }
                        Err(err) => {
                            warn!(controller, kind = %binding.kind, %err, "bootstrap list failed");
                        }
                    }
                }
                EventKind::Created | EventKind::Updated | EventKind::Destroyed => {
                    if let Some(res) = event.resource() {
                        let destroyed = event.kind == EventKind::Destroyed;
                        map_and_enqueue(
                            &store,
                            &binding,
                            &queue,
                            &res.metadata,
                            destroyed,
                            controller,
                        )
                        .await;
                    }
                }
            },
            Err(RecvError::Lagged(missed)) => {
                warn!(controller, kind = %binding.kind, missed, "watch lagged, replaying state");
                if let Ok(items) = store.list(&binding.kind, &LabelQuery::all()).await {
                    for res in items {
                        map_and_enqueue(&store, &binding, &queue, &res.metadata, false, controller)
                            .await;
                    }
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn map_and_enqueue(
    store: &Arc<dyn Store>,
    binding: &InputBinding,
    queue: &ReconcileQueue,
    md: &Metadata,
    destroyed: bool,
    controller: &'static str,
) {
    match &binding.mapping {
        InputMapping::Weak => {}
        InputMapping::PrimaryQueued => {
            queue.enqueue(md.pointer());
        }
        InputMapping::Mapped(mapper) => match mapper.map(store, md).await {
            Ok(pointers) => {
                for ptr in pointers {
                    queue.enqueue(ptr);
                }
            }
            Err(err) => warn!(controller, input = %md.pointer(), %err, "mapper failed"),
        },
        InputMapping::MappedDestroyReady(mapper) => {
            let ready = destroyed || (md.is_tearing_down() && md.finalizers.is_empty());
            if !ready {
                return;
            }
            match mapper.map(store, md).await {
                Ok(pointers) => {
                    for ptr in pointers {
                        queue.enqueue(ptr);
                    }
                }
                Err(err) => warn!(controller, input = %md.pointer(), %err, "mapper failed"),
            }
        }
    }
}

async fn worker_loop(
    controller: Arc<dyn QController>,
    queue: Arc<ReconcileQueue>,
    qrt: QRuntime,
    backoff: ExponentialBackoff,
    attempts: Arc<Mutex<HashMap<ResourcePointer, u32>>>,
    cancel: CancellationToken,
) {
    let name = controller.name();
    loop {
        let Some(ptr) = queue.next(&cancel).await else {
            return;
        };

        let span = tracing::info_span!("reconcile", controller = name, resource = %ptr);
        let result = controller.reconcile(&qrt, &ptr).instrument(span).await;

        match result {
            Ok(ReconcileOutcome::Done) => {
                attempts.lock().unwrap().remove(&ptr);
            }
            Ok(ReconcileOutcome::Skip) => {
                attempts.lock().unwrap().remove(&ptr);
                trace!(controller = name, resource = %ptr, "reconcile skipped");
            }
            Ok(ReconcileOutcome::Requeue(delay)) => {
                attempts.lock().unwrap().remove(&ptr);
                schedule_requeue(&queue, &cancel, ptr.clone(), delay);
            }
            Err(err) => {
                let attempt = {
                    let mut attempts = attempts.lock().unwrap();
                    let counter = attempts.entry(ptr.clone()).or_insert(0);
                    let current = *counter;
                    *counter += 1;
                    current
                };
                let delay = backoff.delay(attempt);
                warn!(
                    controller = name,
                    resource = %ptr,
                    %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconcile failed, backing off"
                );
                schedule_requeue(&queue, &cancel, ptr.clone(), delay);
            }
        }

        queue.done(&ptr);
    }
}

fn schedule_requeue(
    queue: &Arc<ReconcileQueue>,
    cancel: &CancellationToken,
    ptr: ResourcePointer,
    delay: Duration,
) {
    let queue = Arc::clone(queue);
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(delay) => queue.enqueue(ptr),
            () = cancel.cancelled() => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Default)]
    struct PrimarySpec {
        value: u32,
    }

    impl ResourceSpec for PrimarySpec {
        const KIND: &'static str = "Primaries";
    }

    #[derive(Debug, Clone, PartialEq, Default)]
    struct EchoSpec {
        value: u32,
    }

    impl ResourceSpec for EchoSpec {
        const KIND: &'static str = "Echoes";
    }

    struct EchoController {
        reconciles: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl QController for EchoController {
        fn name(&self) -> &'static str {
            "EchoController"
        }

        fn settings(&self) -> ControllerSettings {
            ControllerSettings::builder()
                .primary::<PrimarySpec>()
                .exclusive_output::<EchoSpec>()
                .build()
        }

        async fn reconcile(
            &self,
            rt: &QRuntime,
            ptr: &ResourcePointer,
        ) -> Result<ReconcileOutcome> {
            self.reconciles.fetch_add(1, Ordering::SeqCst);
            let Some(primary) = rt.get::<PrimarySpec>(&ptr.id).await? else {
                rt.teardown_and_destroy::<EchoSpec>(&ptr.id).await?;
                return Ok(ReconcileOutcome::Done);
            };
            rt.create_or_modify::<EchoSpec, _, _>(&ptr.id, EchoSpec::default, |res| {
                res.spec.value = primary.spec.value;
                Ok(())
            })
            .await?;
            Ok(ReconcileOutcome::Done)
        }
    }

    async fn eventually<F, Fut>(check: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_primary_event_drives_reconcile() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let reconciles = Arc::new(AtomicUsize::new(0));
        let mut runtime = ControllerRuntime::new(Arc::clone(&store));
        runtime.register(EchoController {
            reconciles: Arc::clone(&reconciles),
        });
        let running = runtime.start().unwrap();

        store
            .create(Resource::new("p-1", PrimarySpec { value: 42 }).into_dyn())
            .await
            .unwrap();

        let check_store = Arc::clone(&store);
        eventually(move || {
            let store = Arc::clone(&check_store);
            async move {
                store
                    .get_typed::<EchoSpec>("p-1")
                    .await
                    .unwrap()
                    .is_some_and(|echo| echo.spec.value == 42)
            }
        })
        .await;

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_exclusive_output_rejected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut runtime = ControllerRuntime::new(store);
        runtime.register(EchoController {
            reconciles: Arc::default(),
        });
        runtime.register(EchoController {
            reconciles: Arc::default(),
        });
        assert!(runtime.start().is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_reconciles_existing_resources() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store
            .create(Resource::new("p-1", PrimarySpec { value: 7 }).into_dyn())
            .await
            .unwrap();

        let mut runtime = ControllerRuntime::new(Arc::clone(&store));
        runtime.register(EchoController {
            reconciles: Arc::default(),
        });
        let running = runtime.start().unwrap();

        let check_store = Arc::clone(&store);
        eventually(move || {
            let store = Arc::clone(&check_store);
            async move {
                store
                    .get_typed::<EchoSpec>("p-1")
                    .await
                    .unwrap()
                    .is_some()
            }
        })
        .await;

        running.shutdown().await;
    }
}
