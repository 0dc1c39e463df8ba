// SPDX-License-Identifier: MIT OR Apache-2.0

//! The teardown-cascade controller pattern.
//!
//! A cleanup controller claims its primary with a finalizer while the
//! primary is Running and runs a handler once the primary enters
//! TearingDown. Handlers typically destroy dependent resources by label
//! query and report NotReady until everything dependent is gone.

use crate::error::Result;
use crate::resource::{LabelQuery, Resource, ResourceSpec};
use crate::runtime::{
    ControllerSettings, InputBinding, OutputBinding, QController, QRuntime, ReconcileOutcome,
};
use async_trait::async_trait;
use std::marker::PhantomData;

/// Whether a handler finished its part of the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Everything dependent is gone; the finalizer may be released.
    Done,
    /// Dependents still draining; come back on the next event.
    NotReady,
}

/// The teardown work of a cleanup controller.
#[async_trait]
pub trait CleanupHandler: Send + Sync + 'static {
    type Primary: ResourceSpec;

    /// Drive the cascade one step. Runs repeatedly until it reports Done.
    async fn teardown(
        &self,
        rt: &QRuntime,
        primary: &Resource<Self::Primary>,
    ) -> Result<CleanupOutcome>;

    /// Extra inputs whose events must re-trigger the cascade.
    fn inputs(&self) -> Vec<InputBinding> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<OutputBinding> {
        Vec::new()
    }
}

/// Hosts a [`CleanupHandler`] as a [`QController`].
pub struct CleanupController<H: CleanupHandler> {
    name: &'static str,
    handler: H,
}

impl<H: CleanupHandler> CleanupController<H> {
    #[must_use]
    pub fn new(name: &'static str, handler: H) -> Self {
        Self { name, handler }
    }
}

#[async_trait]
impl<H: CleanupHandler> QController for CleanupController<H> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::builder()
            .primary::<H::Primary>()
            .build();
        settings.inputs.extend(self.handler.inputs());
        settings.outputs.extend(self.handler.outputs());
        settings
    }

    async fn reconcile(
        &self,
        rt: &QRuntime,
        ptr: &crate::resource::ResourcePointer,
    ) -> Result<ReconcileOutcome> {
        let Some(primary) = rt.get::<H::Primary>(&ptr.id).await? else {
            return Ok(ReconcileOutcome::Done);
        };

        if !primary.metadata.is_tearing_down() {
            rt.add_finalizer(&primary.pointer()).await?;
            return Ok(ReconcileOutcome::Done);
        }

        if !primary.metadata.has_finalizer(self.name) {
            return Ok(ReconcileOutcome::Done);
        }

        match self.handler.teardown(rt, &primary).await? {
            CleanupOutcome::Done => {
                rt.remove_finalizer(&primary.pointer()).await?;
                Ok(ReconcileOutcome::Done)
            }
            CleanupOutcome::NotReady => Ok(ReconcileOutcome::Skip),
        }
    }
}

/// Handler that destroys all children selected by a label query derived
/// from the primary, reporting Done once none are left.
pub struct DestroyChildren<P, C, F> {
    query: F,
    _marker: PhantomData<fn() -> (P, C)>,
}

impl<P, C, F> DestroyChildren<P, C, F>
where
    P: ResourceSpec,
    C: ResourceSpec,
    F: Fn(&Resource<P>) -> LabelQuery + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(query: F) -> Self {
        Self {
            query,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<P, C, F> CleanupHandler for DestroyChildren<P, C, F>
where
    P: ResourceSpec,
    C: ResourceSpec,
    F: Fn(&Resource<P>) -> LabelQuery + Send + Sync + 'static,
{
    type Primary = P;

    async fn teardown(&self, rt: &QRuntime, primary: &Resource<P>) -> Result<CleanupOutcome> {
        let children = rt.list::<C>(&(self.query)(primary)).await?;
        let mut all_gone = true;
        for child in &children {
            all_gone &= rt.teardown_and_destroy::<C>(child.id()).await?;
        }
        Ok(if all_gone {
            CleanupOutcome::Done
        } else {
            CleanupOutcome::NotReady
        })
    }
}
