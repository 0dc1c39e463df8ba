// SPDX-License-Identifier: MIT OR Apache-2.0

//! Machine-set reconciliation: membership, rolling config rollout and
//! ordered teardown.
//!
//! Membership is driven by `MachineSetNode`s. The controller keeps a
//! finalizer on every node so a deleted node stays readable (TearingDown)
//! until its `ClusterMachine` has fully drained; that is also what makes
//! the `MachineLocked` annotation enforceable for deletes.
//!
//! Config rollout moves the per-machine patch snapshot forward at most
//! `max_update_parallelism` machines at a time, counting a machine as
//! in-flight until its `ClusterMachineConfigStatus` reports the new
//! patch-set watermark. Deletes batch symmetrically.

use crate::error::Result;
use crate::patterns::mappers;
use crate::resource::{KindRef, LabelQuery, Resource, ResourcePointer};
use crate::resources::{annotation, label};
use crate::resources::{
    ClusterMachineConfigPatchesSpec, ClusterMachineConfigStatusSpec, ClusterMachineSpec,
    ClusterSpec, ConfigPatchSpec, MachineCounts, MachineSetNodeSpec, MachineSetPhase,
    MachineSetSpec, MachineSetStatusSpec,
};
use crate::runtime::{
    ControllerSettings, InputBinding, InputMapping, Mapper, QController, QRuntime,
    ReconcileOutcome,
};
use crate::store::Store;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

const CONTROLLER_NAME: &str = "MachineSetStatusController";

/// Routes a `ConfigPatch` event to the machine sets it affects.
struct PatchMapper;

#[async_trait]
impl Mapper for PatchMapper {
    async fn map(
        &self,
        store: &Arc<dyn Store>,
        md: &crate::resource::Metadata,
    ) -> Result<Vec<ResourcePointer>> {
        use crate::store::StoreExt;

        if let Some(machine_set) = md.labels.get(label::MACHINE_SET) {
            return Ok(vec![ResourcePointer::new::<MachineSetSpec>(machine_set)]);
        }
        if let Some(cluster) = md.labels.get(label::CLUSTER) {
            let sets = store
                .list_typed::<MachineSetSpec>(&LabelQuery::all().eq(label::CLUSTER, cluster))
                .await?;
            return Ok(sets.into_iter().map(|set| set.pointer()).collect());
        }
        Ok(Vec::new())
    }
}

/// `ClusterLocked` blocks deletions unless an import is in progress.
fn cluster_delete_locked(cluster: &Resource<ClusterSpec>) -> bool {
    cluster
        .metadata
        .annotations
        .contains(annotation::CLUSTER_LOCKED)
        && !cluster
            .metadata
            .annotations
            .contains(annotation::IMPORT_IN_PROGRESS)
}

fn node_locked(node: &Resource<MachineSetNodeSpec>) -> bool {
    node.metadata
        .annotations
        .contains(annotation::MACHINE_LOCKED)
}

/// Assemble the ordered patch list for one machine: cluster-wide patches,
/// then machine-set patches, then machine-specific ones; stable by ID
/// within each level.
pub(crate) fn desired_patches(
    all_patches: &[Resource<ConfigPatchSpec>],
    cluster_id: &str,
    machine_set_id: &str,
    machine_id: &str,
) -> Vec<String> {
    let mut cluster_level = Vec::new();
    let mut set_level = Vec::new();
    let mut machine_level = Vec::new();

    for patch in all_patches {
        let labels = &patch.metadata.labels;
        if labels.get(label::CLUSTER) != Some(cluster_id) {
            continue;
        }
        match (labels.get(label::MACHINE_SET), labels.get(label::MACHINE)) {
            (_, Some(machine)) => {
                if machine == machine_id {
                    machine_level.push(patch);
                }
            }
            (Some(set), None) => {
                if set == machine_set_id {
                    set_level.push(patch);
                }
            }
            (None, None) => cluster_level.push(patch),
        }
    }

    for level in [&mut cluster_level, &mut set_level, &mut machine_level] {
        level.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
    }

    cluster_level
        .into_iter()
        .chain(set_level)
        .chain(machine_level)
        .map(|patch| patch.spec.data.clone())
        .collect()
}

pub struct MachineSetController;

#[async_trait]
impl QController for MachineSetController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::builder()
            .primary::<MachineSetSpec>()
            .exclusive_output::<ClusterMachineSpec>()
            .exclusive_output::<ClusterMachineConfigPatchesSpec>()
            .exclusive_output::<MachineSetStatusSpec>()
            .build();
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<MachineSetNodeSpec>(),
            mapping: InputMapping::Mapped(mappers::by_machine_set_label::<MachineSetSpec>()),
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<ClusterMachineSpec>(),
            mapping: InputMapping::Mapped(mappers::by_machine_set_label::<MachineSetSpec>()),
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<ClusterMachineConfigStatusSpec>(),
            mapping: InputMapping::Mapped(mappers::by_machine_set_label::<MachineSetSpec>()),
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<ConfigPatchSpec>(),
            mapping: InputMapping::Mapped(Arc::new(PatchMapper)),
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<ClusterSpec>(),
            mapping: InputMapping::Mapped(mappers::select::<MachineSetSpec>(|md| {
                Some(LabelQuery::all().eq(label::CLUSTER, &md.id))
            })),
        });
        settings
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome> {
        let Some(machine_set) = rt.get::<MachineSetSpec>(&ptr.id).await? else {
            return self.sweep(rt, &ptr.id).await;
        };

        if machine_set.metadata.is_tearing_down() {
            return self.teardown(rt, &machine_set).await;
        }

        rt.add_finalizer(&machine_set.pointer()).await?;

        let Some(cluster_id) = machine_set
            .metadata
            .labels
            .get(label::CLUSTER)
            .map(String::from)
        else {
            return Ok(ReconcileOutcome::Skip);
        };
        let Some(cluster) = rt.get::<ClusterSpec>(&cluster_id).await? else {
            return Ok(ReconcileOutcome::Skip);
        };

        let nodes = rt
            .list::<MachineSetNodeSpec>(&LabelQuery::all().eq(label::MACHINE_SET, &ptr.id))
            .await?;
        let machines = rt
            .list::<ClusterMachineSpec>(&LabelQuery::all().eq(label::MACHINE_SET, &ptr.id))
            .await?;
        let statuses: HashMap<String, Resource<ClusterMachineConfigStatusSpec>> = rt
            .list::<ClusterMachineConfigStatusSpec>(
                &LabelQuery::all().eq(label::MACHINE_SET, &ptr.id),
            )
            .await?
            .into_iter()
            .map(|status| (status.metadata.id.clone(), status))
            .collect();
        let all_patches = rt
            .list::<ConfigPatchSpec>(&LabelQuery::all().eq(label::CLUSTER, &cluster_id))
            .await?;

        let machine_index: HashMap<&str, &Resource<ClusterMachineSpec>> = machines
            .iter()
            .map(|machine| (machine.metadata.id.as_str(), machine))
            .collect();

        // Claim every node so deletion goes through a visible TearingDown
        // phase.
        for node in &nodes {
            if !node.metadata.is_tearing_down() {
                rt.add_finalizer(&node.pointer()).await?;
            }
        }

        let mut scaling_up = false;
        let mut scaling_down = false;

        // Scale up: nodes without a cluster machine.
        for node in &nodes {
            if node.metadata.is_tearing_down() {
                continue;
            }
            if machine_index.contains_key(node.metadata.id.as_str()) {
                continue;
            }
            scaling_up = true;
            self.create_cluster_machine(rt, &machine_set, &cluster, node, &all_patches, &cluster_id)
                .await?;
        }

        // Rolling patch updates, bounded by max_update_parallelism.
        let mut in_flight = 0usize;
        let mut candidates = Vec::new();
        for machine in &machines {
            if machine.metadata.is_tearing_down() {
                continue;
            }
            let desired = desired_patches(
                &all_patches,
                &cluster_id,
                &ptr.id,
                &machine.metadata.id,
            );
            let Some(current) = rt
                .get::<ClusterMachineConfigPatchesSpec>(&machine.metadata.id)
                .await?
            else {
                continue;
            };
            let desired_sha = ClusterMachineConfigPatchesSpec {
                patches: desired.clone(),
            }
            .sha256();
            let status_sha = statuses
                .get(&machine.metadata.id)
                .map(|status| status.spec.cluster_machine_config_sha256.clone())
                .unwrap_or_default();

            if current.spec.patches == desired {
                if status_sha != desired_sha {
                    in_flight += 1;
                }
                continue;
            }

            let locked = match rt.get::<MachineSetNodeSpec>(&machine.metadata.id).await? {
                Some(node) => node_locked(&node),
                None => false,
            };
            if locked {
                debug!(machine = %machine.metadata.id, "patch update blocked by machine lock");
                continue;
            }
            candidates.push((machine.metadata.id.clone(), desired));
        }

        let budget = if machine_set.spec.max_update_parallelism == 0 {
            usize::MAX
        } else {
            machine_set
                .spec
                .max_update_parallelism
                .saturating_sub(in_flight)
        };
        for (machine_id, patches) in candidates.into_iter().take(budget) {
            info!(machine = %machine_id, "advancing config patches");
            rt.create_or_modify::<ClusterMachineConfigPatchesSpec, _, _>(
                &machine_id,
                ClusterMachineConfigPatchesSpec::default,
                |res| {
                    res.spec.patches = patches.clone();
                    Ok(())
                },
            )
            .await?;
        }

        // Scale down: nodes torn down (or machines without a node).
        let node_index: HashMap<&str, &Resource<MachineSetNodeSpec>> = nodes
            .iter()
            .map(|node| (node.metadata.id.as_str(), node))
            .collect();
        let mut deleting = machines
            .iter()
            .filter(|machine| machine.metadata.is_tearing_down())
            .count();
        let delete_locked = cluster_delete_locked(&cluster);

        for machine in &machines {
            let node = node_index.get(machine.metadata.id.as_str());
            let removal_requested = match node {
                Some(node) => node.metadata.is_tearing_down(),
                None => true,
            };
            if !removal_requested {
                continue;
            }
            scaling_down = true;

            if delete_locked {
                debug!(machine = %machine.metadata.id, "deletion blocked by cluster lock");
                continue;
            }
            if node.is_some_and(|node| node_locked(node)) {
                debug!(machine = %machine.metadata.id, "deletion blocked by machine lock");
                continue;
            }

            let already_deleting = machine.metadata.is_tearing_down();
            if !already_deleting {
                let unlimited = machine_set.spec.max_delete_parallelism == 0;
                if !unlimited && deleting >= machine_set.spec.max_delete_parallelism {
                    continue;
                }
                deleting += 1;
            }

            if rt
                .teardown_and_destroy::<ClusterMachineSpec>(&machine.metadata.id)
                .await?
            {
                rt.teardown_and_destroy::<ClusterMachineConfigPatchesSpec>(&machine.metadata.id)
                    .await?;
                if let Some(node) = node {
                    rt.remove_finalizer(&node.pointer()).await?;
                    rt.teardown_and_destroy::<MachineSetNodeSpec>(&node.metadata.id)
                        .await?;
                }
            }
        }

        self.write_status(
            rt,
            &machine_set,
            &cluster_id,
            &nodes,
            &machines,
            &statuses,
            scaling_up,
            scaling_down,
        )
        .await?;

        Ok(ReconcileOutcome::Done)
    }
}

impl MachineSetController {
    async fn create_cluster_machine(
        &self,
        rt: &QRuntime,
        machine_set: &Resource<MachineSetSpec>,
        cluster: &Resource<ClusterSpec>,
        node: &Resource<MachineSetNodeSpec>,
        all_patches: &[Resource<ConfigPatchSpec>],
        cluster_id: &str,
    ) -> Result<()> {
        let machine_id = node.metadata.id.clone();
        let is_control_plane = machine_set
            .metadata
            .labels
            .contains(label::ROLE_CONTROLPLANE);
        let kubernetes_version = cluster.spec.kubernetes_version.clone();
        let machine_set_id = machine_set.metadata.id.clone();

        info!(machine = %machine_id, machine_set = %machine_set_id, "adding cluster machine");

        rt.create_or_modify::<ClusterMachineSpec, _, _>(
            &machine_id,
            ClusterMachineSpec::default,
            |res| {
                res.metadata.labels.set(label::CLUSTER, cluster_id);
                res.metadata.labels.set(label::MACHINE_SET, &machine_set_id);
                if is_control_plane {
                    res.metadata.labels.set(label::ROLE_CONTROLPLANE, "");
                } else {
                    res.metadata.labels.set(label::ROLE_WORKER, "");
                }
                // The join version is pinned on first creation.
                if res.spec.kubernetes_version.is_empty() {
                    res.spec.kubernetes_version = kubernetes_version.clone();
                }
                Ok(())
            },
        )
        .await?;

        let patches = desired_patches(all_patches, cluster_id, &machine_set_id, &machine_id);
        rt.create_or_modify::<ClusterMachineConfigPatchesSpec, _, _>(
            &machine_id,
            ClusterMachineConfigPatchesSpec::default,
            |res| {
                res.metadata.labels.set(label::CLUSTER, cluster_id);
                res.metadata.labels.set(label::MACHINE_SET, &machine_set_id);
                res.spec.patches = patches.clone();
                Ok(())
            },
        )
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_status(
        &self,
        rt: &QRuntime,
        machine_set: &Resource<MachineSetSpec>,
        cluster_id: &str,
        nodes: &[Resource<MachineSetNodeSpec>],
        machines: &[Resource<ClusterMachineSpec>],
        statuses: &HashMap<String, Resource<ClusterMachineConfigStatusSpec>>,
        scaling_up: bool,
        scaling_down: bool,
    ) -> Result<()> {
        let requested = nodes
            .iter()
            .filter(|node| !node.metadata.is_tearing_down())
            .count() as u32;
        let synced = machines
            .iter()
            .filter(|machine| {
                !machine.metadata.is_tearing_down()
                    && statuses
                        .get(&machine.metadata.id)
                        .is_some_and(|status| status.spec.last_config_error.is_empty())
            })
            .count() as u32;

        let phase = if scaling_up {
            MachineSetPhase::ScalingUp
        } else if scaling_down {
            MachineSetPhase::ScalingDown
        } else {
            MachineSetPhase::Running
        };
        let ready = phase == MachineSetPhase::Running && synced == requested;
        let machine_set_id = machine_set.metadata.id.clone();
        let is_control_plane = machine_set
            .metadata
            .labels
            .contains(label::ROLE_CONTROLPLANE);

        rt.create_or_modify::<MachineSetStatusSpec, _, _>(
            &machine_set_id,
            MachineSetStatusSpec::default,
            |res| {
                res.metadata.labels.set(label::CLUSTER, cluster_id);
                res.metadata
                    .labels
                    .set(label::MACHINE_SET, &machine_set_id);
                if is_control_plane {
                    res.metadata.labels.set(label::ROLE_CONTROLPLANE, "");
                }
                res.spec.phase = phase;
                res.spec.ready = ready;
                res.spec.machines = MachineCounts {
                    requested,
                    synced,
                    connected: synced,
                };
                res.spec.error.clear();
                Ok(())
            },
        )
        .await?;
        Ok(())
    }

    /// Machine set destroyed out from under us: drop the derived resources.
    async fn sweep(&self, rt: &QRuntime, machine_set_id: &str) -> Result<ReconcileOutcome> {
        let machines = rt
            .list::<ClusterMachineSpec>(&LabelQuery::all().eq(label::MACHINE_SET, machine_set_id))
            .await?;
        let mut all_gone = true;
        for machine in &machines {
            let gone = rt
                .teardown_and_destroy::<ClusterMachineSpec>(&machine.metadata.id)
                .await?;
            if gone {
                rt.teardown_and_destroy::<ClusterMachineConfigPatchesSpec>(&machine.metadata.id)
                    .await?;
            }
            all_gone &= gone;
        }
        rt.teardown_and_destroy::<MachineSetStatusSpec>(machine_set_id)
            .await?;
        Ok(if all_gone {
            ReconcileOutcome::Done
        } else {
            ReconcileOutcome::Skip
        })
    }

    async fn teardown(
        &self,
        rt: &QRuntime,
        machine_set: &Resource<MachineSetSpec>,
    ) -> Result<ReconcileOutcome> {
        let machine_set_id = &machine_set.metadata.id;

        // Nodes go first so no new members appear mid-teardown.
        let nodes = rt
            .list::<MachineSetNodeSpec>(&LabelQuery::all().eq(label::MACHINE_SET, machine_set_id))
            .await?;
        for node in &nodes {
            rt.remove_finalizer(&node.pointer()).await?;
            rt.teardown_and_destroy::<MachineSetNodeSpec>(&node.metadata.id)
                .await?;
        }

        let machines = rt
            .list::<ClusterMachineSpec>(&LabelQuery::all().eq(label::MACHINE_SET, machine_set_id))
            .await?;
        let mut all_gone = true;
        for machine in &machines {
            let gone = rt
                .teardown_and_destroy::<ClusterMachineSpec>(&machine.metadata.id)
                .await?;
            if gone {
                rt.teardown_and_destroy::<ClusterMachineConfigPatchesSpec>(&machine.metadata.id)
                    .await?;
            }
            all_gone &= gone;
        }

        if !all_gone {
            return Ok(ReconcileOutcome::Skip);
        }

        rt.teardown_and_destroy::<MachineSetStatusSpec>(machine_set_id)
            .await?;
        if machine_set.metadata.has_finalizer(CONTROLLER_NAME) {
            rt.remove_finalizer(&machine_set.pointer()).await?;
        }
        Ok(ReconcileOutcome::Done)
    }
}
