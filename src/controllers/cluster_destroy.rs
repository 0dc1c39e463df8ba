// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cluster destroy: the outer teardown cascade and its progress report.
//!
//! When a `Cluster` enters TearingDown, its machine sets are torn down; the
//! machine-set controller drains the cluster machines underneath. The
//! remaining machine-set and machine counts are projected into
//! `ClusterDestroyStatus` as human-readable text. The finalizer is released
//! once nothing labeled with the cluster remains; the cluster is then
//! destroyable as soon as every other controller has released it too.

use crate::error::Result;
use crate::patterns::mappers;
use crate::resource::{KindRef, LabelQuery, ResourcePointer};
use crate::resources::label;
use crate::resources::{
    ClusterDestroyStatusSpec, ClusterMachineSpec, ClusterSpec, MachineSetSpec,
};
use crate::runtime::{
    ControllerSettings, InputBinding, InputMapping, QController, QRuntime, ReconcileOutcome,
};
use async_trait::async_trait;
use tracing::info;

const CONTROLLER_NAME: &str = "ClusterDestroyStatusController";

/// Progress text shown to operators.
#[must_use]
pub fn destroy_phase_text(machine_sets: usize, machines: usize) -> String {
    format!("{machine_sets} machine sets, {machines} machines")
}

pub struct ClusterDestroyController;

#[async_trait]
impl QController for ClusterDestroyController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::builder()
            .primary::<ClusterSpec>()
            .exclusive_output::<ClusterDestroyStatusSpec>()
            .build();
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<MachineSetSpec>(),
            mapping: InputMapping::Mapped(mappers::by_cluster_label::<ClusterSpec>()),
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<ClusterMachineSpec>(),
            mapping: InputMapping::Mapped(mappers::by_cluster_label::<ClusterSpec>()),
        });
        settings
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome> {
        let Some(cluster) = rt.get::<ClusterSpec>(&ptr.id).await? else {
            rt.teardown_and_destroy::<ClusterDestroyStatusSpec>(&ptr.id)
                .await?;
            return Ok(ReconcileOutcome::Done);
        };

        if !cluster.metadata.is_tearing_down() {
            rt.add_finalizer(&cluster.pointer()).await?;
            return Ok(ReconcileOutcome::Done);
        }

        let machine_sets = rt
            .list::<MachineSetSpec>(&LabelQuery::all().eq(label::CLUSTER, &ptr.id))
            .await?;
        let machines = rt
            .list::<ClusterMachineSpec>(&LabelQuery::all().eq(label::CLUSTER, &ptr.id))
            .await?;

        for machine_set in &machine_sets {
            rt.teardown_and_destroy::<MachineSetSpec>(&machine_set.metadata.id)
                .await?;
        }

        let phase = destroy_phase_text(machine_sets.len(), machines.len());
        rt.create_or_modify::<ClusterDestroyStatusSpec, _, _>(
            &ptr.id,
            ClusterDestroyStatusSpec::default,
            |res| {
                res.metadata.labels.set(label::CLUSTER, &ptr.id);
                res.spec.phase = phase.clone();
                Ok(())
            },
        )
        .await?;

        if machine_sets.is_empty() && machines.is_empty() {
            if cluster.metadata.has_finalizer(CONTROLLER_NAME) {
                info!(cluster = %ptr.id, "cluster drained");
                rt.remove_finalizer(&cluster.pointer()).await?;
            }
            return Ok(ReconcileOutcome::Done);
        }

        Ok(ReconcileOutcome::Skip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroy_phase_text() {
        assert_eq!(destroy_phase_text(3, 3), "3 machine sets, 3 machines");
        assert_eq!(destroy_phase_text(0, 0), "0 machine sets, 0 machines");
    }
}
