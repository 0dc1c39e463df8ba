// SPDX-License-Identifier: MIT OR Apache-2.0

//! `Cluster` → `ClusterStatus`: the aggregate health consumed by the
//! upgrade gate and the UI.

use crate::error::Result;
use crate::patterns::mappers;
use crate::patterns::{QTransform, TransformOutcome};
use crate::resource::{KindRef, LabelQuery, Resource};
use crate::resources::label;
use crate::resources::{
    ClusterPhase, ClusterSpec, ClusterStatusSpec, LoadBalancerStatusSpec, MachineSetStatusSpec,
};
use crate::runtime::{InputBinding, InputMapping, QRuntime};
use async_trait::async_trait;

pub struct ClusterStatusController;

#[async_trait]
impl QTransform for ClusterStatusController {
    type Input = ClusterSpec;
    type Output = ClusterStatusSpec;

    fn name(&self) -> &'static str {
        "ClusterStatusController"
    }

    fn extra_inputs(&self) -> Vec<InputBinding> {
        vec![
            InputBinding {
                kind: KindRef::of::<MachineSetStatusSpec>(),
                mapping: InputMapping::Mapped(mappers::by_cluster_label::<ClusterSpec>()),
            },
            InputBinding {
                kind: KindRef::of::<LoadBalancerStatusSpec>(),
                mapping: InputMapping::Mapped(mappers::same_id::<ClusterSpec>()),
            },
        ]
    }

    async fn transform(
        &self,
        rt: &QRuntime,
        input: &Resource<ClusterSpec>,
        output: &mut Resource<ClusterStatusSpec>,
    ) -> Result<TransformOutcome> {
        let set_statuses = rt
            .list::<MachineSetStatusSpec>(&LabelQuery::all().eq(label::CLUSTER, input.id()))
            .await?;
        let lb_healthy = rt
            .get::<LoadBalancerStatusSpec>(input.id())
            .await?
            .is_some_and(|status| status.spec.healthy);

        let machines: u32 = set_statuses
            .iter()
            .map(|status| status.spec.machines.requested)
            .sum();
        let healthy_machines: u32 = set_statuses
            .iter()
            .map(|status| status.spec.machines.synced)
            .sum();
        let sets_ready = !set_statuses.is_empty() && set_statuses.iter().all(|s| s.spec.ready);
        let controlplane_ready = set_statuses
            .iter()
            .filter(|s| s.metadata.labels.contains(label::ROLE_CONTROLPLANE))
            .all(|s| s.spec.ready)
            && set_statuses
                .iter()
                .any(|s| s.metadata.labels.contains(label::ROLE_CONTROLPLANE));

        output.metadata.labels.set(label::CLUSTER, input.id());
        output.spec.available = machines > 0;
        output.spec.ready = sets_ready && lb_healthy;
        output.spec.controlplane_ready = controlplane_ready;
        output.spec.machines = machines;
        output.spec.healthy_machines = healthy_machines;
        output.spec.phase = if output.spec.ready {
            ClusterPhase::Running
        } else if machines > 0 {
            ClusterPhase::Scaling
        } else {
            ClusterPhase::Unknown
        };
        Ok(TransformOutcome::Modified)
    }
}
