// SPDX-License-Identifier: MIT OR Apache-2.0

//! The 1:1 transform controller pattern.
//!
//! A qtransform controller derives exactly one output resource from each
//! primary input. The pattern supplies the full lifecycle around the
//! transform function: finalizer claim on the input, optimistic-concurrency
//! writes of the output, teardown-and-destroy of the output when the input
//! goes away, and the finalizer release that lets the input die.

use crate::error::Result;
use crate::resource::{LabelQuery, Metadata, Resource, ResourcePointer, ResourceSpec};
use crate::runtime::{
    ControllerSettings, InputBinding, Mapper, OutputBinding, QController, QRuntime,
    ReconcileOutcome,
};
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a transform pass decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOutcome {
    /// Write the mutated output.
    Modified,
    /// Inputs not ready; leave the last successful output untouched.
    Skip,
    /// The output must go away even though the input is Running.
    DestroyOutput,
    /// Like [`TransformOutcome::Skip`], but run again after the delay.
    Requeue(Duration),
}

/// A 1:1 input→output transformation.
#[async_trait]
pub trait QTransform: Send + Sync + 'static {
    type Input: ResourceSpec;
    type Output: ResourceSpec + Default;

    fn name(&self) -> &'static str;

    /// Output ID for an input. `None` declines the input entirely.
    fn map_metadata(&self, input: &Metadata) -> Option<String> {
        Some(input.id.clone())
    }

    /// Input ID for an output; the inverse of `map_metadata`.
    fn unmap_metadata(&self, output: &Metadata) -> String {
        output.id.clone()
    }

    /// Additional mapped inputs beyond the primary.
    fn extra_inputs(&self) -> Vec<InputBinding> {
        Vec::new()
    }

    /// Additional outputs beyond the mapped output.
    fn extra_outputs(&self) -> Vec<OutputBinding> {
        Vec::new()
    }

    fn concurrency(&self) -> usize {
        1
    }

    /// Compute the output from the input. `output` arrives as the stored
    /// resource (or a default one); mutate its spec, labels and annotations.
    async fn transform(
        &self,
        rt: &QRuntime,
        input: &Resource<Self::Input>,
        output: &mut Resource<Self::Output>,
    ) -> Result<TransformOutcome>;

    /// Runs while the input tears down, before this controller's finalizer
    /// is removed. Clean up extra outputs here.
    async fn finalizer_removal(
        &self,
        rt: &QRuntime,
        input: &Resource<Self::Input>,
    ) -> Result<()> {
        let _ = (rt, input);
        Ok(())
    }

    /// Optional long-running companion, forwarded to the hosting
    /// controller's run hook.
    async fn run_hook(&self, rt: QRuntime, cancel: CancellationToken) -> Result<()> {
        let _ = (rt, cancel);
        Ok(())
    }
}

struct UnmapMapper<T: QTransform> {
    transform: Arc<T>,
}

#[async_trait]
impl<T: QTransform> Mapper for UnmapMapper<T> {
    async fn map(
        &self,
        _store: &Arc<dyn Store>,
        md: &Metadata,
    ) -> Result<Vec<ResourcePointer>> {
        Ok(vec![ResourcePointer::new::<T::Input>(
            self.transform.unmap_metadata(md),
        )])
    }
}

/// Hosts a [`QTransform`] as a [`QController`].
pub struct QTransformController<T: QTransform> {
    transform: Arc<T>,
}

impl<T: QTransform> QTransformController<T> {
    #[must_use]
    pub fn new(transform: T) -> Self {
        Self {
            transform: Arc::new(transform),
        }
    }
}

#[async_trait]
impl<T: QTransform> QController for QTransformController<T> {
    fn name(&self) -> &'static str {
        self.transform.name()
    }

    fn settings(&self) -> ControllerSettings {
        // The own output maps back to the primary so that teardown
        // completion (downstream finalizers clearing) resumes the input's
        // teardown.
        let mut settings = ControllerSettings::builder()
            .primary::<T::Input>()
            .mapped_destroy_ready::<T::Output>(Arc::new(UnmapMapper {
                transform: Arc::clone(&self.transform),
            }))
            .exclusive_output::<T::Output>()
            .concurrency(self.transform.concurrency())
            .build();
        settings.inputs.extend(self.transform.extra_inputs());
        settings.outputs.extend(self.transform.extra_outputs());
        settings
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome> {
        let Some(input) = rt.get::<T::Input>(&ptr.id).await? else {
            return self.destroy_orphaned_outputs(rt, &ptr.id).await;
        };

        if input.metadata.is_tearing_down() {
            return self.teardown(rt, &input).await;
        }

        let Some(output_id) = self.transform.map_metadata(&input.metadata) else {
            return Ok(ReconcileOutcome::Skip);
        };

        rt.add_finalizer(&input.pointer()).await?;

        let mut scratch = rt
            .get::<T::Output>(&output_id)
            .await?
            .unwrap_or_else(|| Resource::new(&output_id, T::Output::default()));

        match self.transform.transform(rt, &input, &mut scratch).await? {
            TransformOutcome::Skip => Ok(ReconcileOutcome::Skip),
            TransformOutcome::Requeue(delay) => Ok(ReconcileOutcome::Requeue(delay)),
            TransformOutcome::DestroyOutput => {
                rt.teardown_and_destroy::<T::Output>(&output_id).await?;
                Ok(ReconcileOutcome::Done)
            }
            TransformOutcome::Modified => {
                let desired = scratch;
                rt.create_or_modify::<T::Output, _, _>(
                    &output_id,
                    T::Output::default,
                    |res| {
                        res.spec = desired.spec.clone();
                        res.metadata.labels = desired.metadata.labels.clone();
                        res.metadata.annotations = desired.metadata.annotations.clone();
                        Ok(())
                    },
                )
                .await?;
                Ok(ReconcileOutcome::Done)
            }
        }
    }

    async fn run_hook(&self, rt: QRuntime, cancel: CancellationToken) -> Result<()> {
        self.transform.run_hook(rt, cancel).await
    }
}

impl<T: QTransform> QTransformController<T> {
    /// The input is gone entirely (destroyed before we saw its teardown):
    /// sweep outputs that unmap back to it.
    async fn destroy_orphaned_outputs(
        &self,
        rt: &QRuntime,
        input_id: &str,
    ) -> Result<ReconcileOutcome> {
        let outputs = rt.list::<T::Output>(&LabelQuery::all()).await?;
        let mut all_gone = true;
        for output in outputs {
            if self.transform.unmap_metadata(&output.metadata) == input_id {
                all_gone &= rt.teardown_and_destroy::<T::Output>(output.id()).await?;
            }
        }
        Ok(if all_gone {
            ReconcileOutcome::Done
        } else {
            ReconcileOutcome::Skip
        })
    }

    async fn teardown(
        &self,
        rt: &QRuntime,
        input: &Resource<T::Input>,
    ) -> Result<ReconcileOutcome> {
        if !input.metadata.has_finalizer(self.name()) {
            return Ok(ReconcileOutcome::Done);
        }

        self.transform.finalizer_removal(rt, input).await?;

        if let Some(output_id) = self.transform.map_metadata(&input.metadata) {
            if !rt.teardown_and_destroy::<T::Output>(&output_id).await? {
                // Downstream finalizers still hold the output; its
                // destroy-ready event maps back here.
                return Ok(ReconcileOutcome::Skip);
            }
        }

        rt.remove_finalizer(&input.pointer()).await?;
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Phase;
    use crate::runtime::ControllerRuntime;
    use crate::store::{MemoryStore, StoreExt};

    #[derive(Debug, Clone, PartialEq, Default)]
    struct SourceSpec {
        value: u32,
    }

    impl ResourceSpec for SourceSpec {
        const KIND: &'static str = "Sources";
    }

    #[derive(Debug, Clone, PartialEq, Default)]
    struct DoubledSpec {
        value: u32,
    }

    impl ResourceSpec for DoubledSpec {
        const KIND: &'static str = "Doubleds";
    }

    struct Doubler;

    #[async_trait]
    impl QTransform for Doubler {
        type Input = SourceSpec;
        type Output = DoubledSpec;

        fn name(&self) -> &'static str {
            "DoublerController"
        }

        async fn transform(
            &self,
            _rt: &QRuntime,
            input: &Resource<SourceSpec>,
            output: &mut Resource<DoubledSpec>,
        ) -> Result<TransformOutcome> {
            if input.spec.value == 0 {
                return Ok(TransformOutcome::Skip);
            }
            output.spec.value = input.spec.value * 2;
            Ok(TransformOutcome::Modified)
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
    async fn test_transform_lifecycle() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut runtime = ControllerRuntime::new(Arc::clone(&store));
        runtime.register(QTransformController::new(Doubler));
        let running = runtime.start().unwrap();

        store
            .create(Resource::new("s-1", SourceSpec { value: 21 }).into_dyn())
            .await
            .unwrap();

        let s = Arc::clone(&store);
        eventually(move || {
            let store = Arc::clone(&s);
            async move {
                store
                    .get_typed::<DoubledSpec>("s-1")
                    .await
                    .unwrap()
                    .is_some_and(|out| out.spec.value == 42)
            }
        })
        .await;

        // The input carries the controller's finalizer now.
        let s = Arc::clone(&store);
        eventually(move || {
            let store = Arc::clone(&s);
            async move {
                store
                    .get_typed::<SourceSpec>("s-1")
                    .await
                    .unwrap()
                    .is_some_and(|input| input.metadata.has_finalizer("DoublerController"))
            }
        })
        .await;

        // Teardown: the output goes away, the finalizer is released and the
        // input becomes destroyable.
        store
            .teardown(&ResourcePointer::new::<SourceSpec>("s-1"), "")
            .await
            .unwrap();

        let s = Arc::clone(&store);
        eventually(move || {
            let store = Arc::clone(&s);
            async move {
                let output_gone = store
                    .get_typed::<DoubledSpec>("s-1")
                    .await
                    .unwrap()
                    .is_none();
                let input_ready = store
                    .get_typed::<SourceSpec>("s-1")
                    .await
                    .unwrap()
                    .is_some_and(|input| {
                        input.metadata.phase == Phase::TearingDown
                            && input.metadata.finalizers.is_empty()
                    });
                output_gone && input_ready
            }
        })
        .await;

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_skip_leaves_previous_output() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut runtime = ControllerRuntime::new(Arc::clone(&store));
        runtime.register(QTransformController::new(Doubler));
        let running = runtime.start().unwrap();

        store
            .create(Resource::new("s-1", SourceSpec { value: 5 }).into_dyn())
            .await
            .unwrap();

        let s = Arc::clone(&store);
        eventually(move || {
            let store = Arc::clone(&s);
            async move {
                store
                    .get_typed::<DoubledSpec>("s-1")
                    .await
                    .unwrap()
                    .is_some_and(|out| out.spec.value == 10)
            }
        })
        .await;

        // value == 0 makes the transform skip; the old output stays.
        store
            .modify::<SourceSpec, _>("", "s-1", |res| {
                res.spec.value = 0;
                Ok(())
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let out = store.get_typed::<DoubledSpec>("s-1").await.unwrap().unwrap();
        assert_eq!(out.spec.value, 10);

        running.shutdown().await;
    }
}
