// SPDX-License-Identifier: MIT OR Apache-2.0

//! `MachineStatus` → `MachineStatusLink`: the per-machine rollup kept in
//! the metrics namespace.

use crate::error::Result;
use crate::patterns::{QTransform, TransformOutcome};
use crate::resource::Resource;
use crate::resources::label;
use crate::resources::{MachineStatusLinkSpec, MachineStatusSpec};
use crate::runtime::QRuntime;
use async_trait::async_trait;

pub struct MachineStatusLinkController;

#[async_trait]
impl QTransform for MachineStatusLinkController {
    type Input = MachineStatusSpec;
    type Output = MachineStatusLinkSpec;

    fn name(&self) -> &'static str {
        "MachineStatusLinkController"
    }

    fn concurrency(&self) -> usize {
        4
    }

    async fn transform(
        &self,
        _rt: &QRuntime,
        input: &Resource<MachineStatusSpec>,
        output: &mut Resource<MachineStatusLinkSpec>,
    ) -> Result<TransformOutcome> {
        output.spec.connected = input.metadata.labels.contains(label::CONNECTED);
        output.spec.talos_version = input.spec.talos_version.clone();
        output.spec.cluster = input
            .metadata
            .labels
            .get(label::CLUSTER)
            .unwrap_or_default()
            .to_string();
        Ok(TransformOutcome::Modified)
    }
}
