// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cluster-machine leave cascade.
//!
//! Runs strictly after the config-status controller has released the
//! machine (Talos reset done): requests the discovery service to drop the
//! machine's affiliate, deletes the Kubernetes node when its name is
//! unambiguous among the cluster's identities, drops the identity record
//! and only then lets the `ClusterMachine` die.

use crate::clients::KubernetesClientFactory;
use crate::config::FleetSettings;
use crate::error::Result;
use crate::resource::{KindRef, LabelQuery, Resource, ResourcePointer};
use crate::resources::label;
use crate::resources::{
    ClusterMachineIdentitySpec, ClusterMachineSpec, DiscoveryAffiliateDeleteTaskSpec,
};
use crate::runtime::{
    ControllerSettings, InputBinding, InputMapping, QController, QRuntime, ReconcileOutcome,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

const CONTROLLER_NAME: &str = "MachineCleanupController";

/// The finalizer that must clear before the cascade may run.
const CONFIG_STATUS_FINALIZER: &str = "ConfigStatusController";

pub struct MachineCleanupController {
    kubernetes: Arc<dyn KubernetesClientFactory>,
    settings: FleetSettings,
}

impl MachineCleanupController {
    #[must_use]
    pub fn new(kubernetes: Arc<dyn KubernetesClientFactory>, settings: FleetSettings) -> Self {
        Self {
            kubernetes,
            settings,
        }
    }

    async fn delete_kubernetes_node(
        &self,
        rt: &QRuntime,
        cluster_id: &str,
        identity: &Resource<ClusterMachineIdentitySpec>,
    ) -> Result<()> {
        if identity.spec.nodename.is_empty() {
            return Ok(());
        }

        // A duplicated nodename means another machine may legitimately own
        // the Kubernetes node; leave it alone.
        let identities = rt
            .list::<ClusterMachineIdentitySpec>(&LabelQuery::all().eq(label::CLUSTER, cluster_id))
            .await?;
        let duplicates = identities
            .iter()
            .filter(|other| other.spec.nodename == identity.spec.nodename)
            .count();
        if duplicates > 1 {
            warn!(
                nodename = %identity.spec.nodename,
                "nodename not unique, skipping kubernetes node deletion"
            );
            return Ok(());
        }

        let client = self.kubernetes.client_for(cluster_id).await?;
        tokio::time::timeout(
            self.settings.external_call_timeout,
            client.delete_node(&identity.spec.nodename),
        )
        .await
        .map_err(|_| {
            crate::error::FleetError::Runtime(format!(
                "node delete {} timed out",
                identity.spec.nodename
            ))
        })??;
        info!(nodename = %identity.spec.nodename, "kubernetes node deleted");
        Ok(())
    }
}

#[async_trait]
impl QController for MachineCleanupController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::builder()
            .primary::<ClusterMachineSpec>()
            .shared_output::<DiscoveryAffiliateDeleteTaskSpec>()
            .build();
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<ClusterMachineIdentitySpec>(),
            mapping: InputMapping::Weak,
        });
        settings
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome> {
        let Some(cluster_machine) = rt.get::<ClusterMachineSpec>(&ptr.id).await? else {
            return Ok(ReconcileOutcome::Done);
        };

        if !cluster_machine.metadata.is_tearing_down() {
            rt.add_finalizer(&cluster_machine.pointer()).await?;
            return Ok(ReconcileOutcome::Done);
        }

        if !cluster_machine.metadata.has_finalizer(CONTROLLER_NAME) {
            return Ok(ReconcileOutcome::Done);
        }

        // The reset must have happened first; the config-status finalizer
        // disappearing is the signal.
        if cluster_machine
            .metadata
            .has_finalizer(CONFIG_STATUS_FINALIZER)
        {
            return Ok(ReconcileOutcome::Skip);
        }

        let cluster_id = cluster_machine
            .metadata
            .labels
            .get(label::CLUSTER)
            .unwrap_or_default()
            .to_string();

        if let Some(identity) = rt.get::<ClusterMachineIdentitySpec>(&ptr.id).await? {
            if !identity.spec.node_identity.is_empty() && !cluster_id.is_empty() {
                let affiliate = identity.spec.node_identity.clone();
                let task_cluster = cluster_id.clone();
                rt.create_or_modify_shared::<DiscoveryAffiliateDeleteTaskSpec, _, _>(
                    &ptr.id,
                    DiscoveryAffiliateDeleteTaskSpec::default,
                    |task| {
                        task.metadata.labels.set(label::CLUSTER, &task_cluster);
                        task.spec.cluster_id = task_cluster.clone();
                        task.spec.affiliate_id = affiliate.clone();
                        Ok(())
                    },
                )
                .await?;
            }

            if !cluster_id.is_empty() {
                if let Err(err) = self
                    .delete_kubernetes_node(rt, &cluster_id, &identity)
                    .await
                {
                    warn!(machine = %ptr.id, %err, "kubernetes node deletion failed, retrying");
                    return Err(err);
                }
            }

            rt.teardown_and_destroy::<ClusterMachineIdentitySpec>(&ptr.id)
                .await?;
        }

        rt.remove_finalizer(&cluster_machine.pointer()).await?;
        Ok(ReconcileOutcome::Done)
    }
}
