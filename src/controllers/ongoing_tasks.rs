// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ephemeral `OngoingTask` projection.
//!
//! Long-running operations (cluster destroy, Talos upgrade) surface as
//! resources in the ephemeral namespace under stable IDs
//! (`destroy-<cluster>`, `talos-upgrade-<cluster>`), so UIs can list
//! everything in flight with one query.

use crate::error::Result;
use crate::patterns::mappers;
use crate::resource::{KindRef, ResourcePointer};
use crate::resources::label;
use crate::resources::{
    ClusterDestroyStatusSpec, ClusterSpec, OngoingTaskKind, OngoingTaskSpec, TalosUpgradeStatusSpec,
    UpgradePhase,
};
use crate::runtime::{
    ControllerSettings, InputBinding, InputMapping, QController, QRuntime, ReconcileOutcome,
};
use async_trait::async_trait;

const CONTROLLER_NAME: &str = "OngoingTaskController";

/// Stable task ID per (kind, cluster).
#[must_use]
pub fn task_id(kind: &OngoingTaskKind, cluster_id: &str) -> String {
    match kind {
        OngoingTaskKind::ClusterDestroy => format!("destroy-{cluster_id}"),
        OngoingTaskKind::TalosUpgrade => format!("talos-upgrade-{cluster_id}"),
    }
}

pub struct OngoingTaskController;

impl OngoingTaskController {
    async fn project(
        &self,
        rt: &QRuntime,
        cluster_id: &str,
        kind: OngoingTaskKind,
        active: bool,
        title: String,
    ) -> Result<()> {
        let id = task_id(&kind, cluster_id);
        if !active {
            rt.teardown_and_destroy::<OngoingTaskSpec>(&id).await?;
            return Ok(());
        }
        let cluster = cluster_id.to_string();
        rt.create_or_modify::<OngoingTaskSpec, _, _>(
            &id,
            OngoingTaskSpec::default,
            |task| {
                task.metadata.labels.set(label::CLUSTER, &cluster);
                task.spec.kind = kind.clone();
                task.spec.cluster_id = cluster.clone();
                task.spec.title = title.clone();
                Ok(())
            },
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QController for OngoingTaskController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::builder()
            .primary::<ClusterSpec>()
            .exclusive_output::<OngoingTaskSpec>()
            .build();
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<TalosUpgradeStatusSpec>(),
            mapping: InputMapping::Mapped(mappers::same_id::<ClusterSpec>()),
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<ClusterDestroyStatusSpec>(),
            mapping: InputMapping::Mapped(mappers::same_id::<ClusterSpec>()),
        });
        settings
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome> {
        let cluster = rt.get::<ClusterSpec>(&ptr.id).await?;

        let destroying = cluster
            .as_ref()
            .is_some_and(|c| c.metadata.is_tearing_down());
        let destroy_phase = rt
            .get::<ClusterDestroyStatusSpec>(&ptr.id)
            .await?
            .map(|status| status.spec.phase)
            .unwrap_or_default();
        self.project(
            rt,
            &ptr.id,
            OngoingTaskKind::ClusterDestroy,
            destroying,
            format!("destroying cluster: {destroy_phase}"),
        )
        .await?;

        let upgrade = rt.get::<TalosUpgradeStatusSpec>(&ptr.id).await?;
        let upgrading = cluster.is_some()
            && upgrade.as_ref().is_some_and(|status| {
                !matches!(
                    status.spec.phase,
                    UpgradePhase::Done | UpgradePhase::Unknown
                )
            });
        let title = upgrade
            .map(|status| {
                format!(
                    "talos upgrade to {}",
                    status.spec.current_upgrade_version
                )
            })
            .unwrap_or_default();
        self.project(rt, &ptr.id, OngoingTaskKind::TalosUpgrade, upgrading, title)
            .await?;

        Ok(ReconcileOutcome::Done)
    }
}
