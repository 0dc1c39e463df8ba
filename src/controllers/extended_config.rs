// SPDX-License-Identifier: MIT OR Apache-2.0

//! `ClusterMachineConfig` + `MachineConfigGenOptions.install_image` →
//! `ClusterMachineExtendedConfig`.
//!
//! Downstream consumers read one resource instead of combining the config
//! document with the install image themselves. The output is exclusive, so
//! nothing outside this controller can interfere with the handover.

use crate::error::Result;
use crate::patterns::mappers;
use crate::patterns::{QTransform, TransformOutcome};
use crate::resource::{KindRef, Resource};
use crate::resources::{
    ClusterMachineConfigSpec, ClusterMachineExtendedConfigSpec, MachineConfigGenOptionsSpec,
};
use crate::runtime::{InputBinding, InputMapping, QRuntime};
use async_trait::async_trait;

pub struct ExtendedConfigController;

#[async_trait]
impl QTransform for ExtendedConfigController {
    type Input = ClusterMachineConfigSpec;
    type Output = ClusterMachineExtendedConfigSpec;

    fn name(&self) -> &'static str {
        "ExtendedConfigController"
    }

    fn extra_inputs(&self) -> Vec<InputBinding> {
        vec![InputBinding {
            kind: KindRef::of::<MachineConfigGenOptionsSpec>(),
            mapping: InputMapping::Mapped(mappers::same_id::<ClusterMachineConfigSpec>()),
        }]
    }

    async fn transform(
        &self,
        rt: &QRuntime,
        input: &Resource<ClusterMachineConfigSpec>,
        output: &mut Resource<ClusterMachineExtendedConfigSpec>,
    ) -> Result<TransformOutcome> {
        if input.spec.data.is_empty() {
            return Ok(TransformOutcome::Skip);
        }

        let install_image = rt
            .get::<MachineConfigGenOptionsSpec>(input.id())
            .await?
            .and_then(|options| options.spec.install_image);

        for (key, value) in input.metadata.labels.iter() {
            output.metadata.labels.set(key, value);
        }
        output.spec.data = input.spec.data.clone();
        output.spec.install_image = install_image;
        Ok(TransformOutcome::Modified)
    }
}
