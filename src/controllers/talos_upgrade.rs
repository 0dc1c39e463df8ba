// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cluster-wide rolling Talos upgrades.
//!
//! The controller owns one `ClusterMachineTalosVersion` per cluster machine
//! and the cluster's `TalosUpgradeStatus`. One machine advances per
//! reconcile pass; the status events of that machine trigger the next pass.
//! Control-plane machines finish before any worker starts, candidates are
//! ordered by their `MachineSetNode` creation time, a `MachineLocked`
//! annotation on the next candidate pauses the whole rollout, and an
//! unready cluster pauses advancement without regressing the phase.

use crate::error::Result;
use crate::patterns::mappers;
use crate::resource::{KindRef, LabelQuery, Resource, ResourcePointer};
use crate::resources::{annotation, label};
use crate::resources::{
    ClusterMachineConfigStatusSpec, ClusterMachineSpec, ClusterMachineTalosVersionSpec,
    ClusterSpec, ClusterStatusSpec, MachineSetNodeSpec, SchematicConfigurationSpec,
    TalosUpgradeStatusSpec, UpgradePhase,
};
use crate::runtime::{
    ControllerSettings, InputBinding, InputMapping, QController, QRuntime, ReconcileOutcome,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::info;

const CONTROLLER_NAME: &str = "TalosUpgradeStatusController";

/// Talos releases with the Kubernetes minor versions they support.
const TALOS_VERSIONS: &[(&str, u32, u32)] = &[
    ("1.6.7", 24, 29),
    ("1.7.5", 26, 30),
    ("1.7.6", 26, 30),
    ("1.7.7", 26, 30),
    ("1.8.3", 27, 31),
    ("1.9.1", 28, 32),
];

fn parse_version(version: &str) -> (u32, u32, u32) {
    let mut parts = version.split('.').map(|p| p.parse().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

fn kubernetes_minor(version: &str) -> u32 {
    version
        .split('.')
        .nth(1)
        .and_then(|minor| minor.parse().ok())
        .unwrap_or(0)
}

/// Talos versions the cluster can move to next: strictly newer than the
/// current one and compatible with the running Kubernetes version.
#[must_use]
pub fn upgrade_targets(current_talos: &str, kubernetes_version: &str) -> Vec<String> {
    let current = parse_version(current_talos);
    let minor = kubernetes_minor(kubernetes_version);
    TALOS_VERSIONS
        .iter()
        .filter(|(version, min_k8s, max_k8s)| {
            parse_version(version) > current && (*min_k8s..=*max_k8s).contains(&minor)
        })
        .map(|(version, _, _)| (*version).to_string())
        .collect()
}

struct MachineState {
    machine_id: String,
    is_control_plane: bool,
    node_created: Option<chrono::DateTime<chrono::Utc>>,
    locked: bool,
    desired_schematic: String,
    needs_update: bool,
}

pub struct TalosUpgradeController;

#[async_trait]
impl QController for TalosUpgradeController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::builder()
            .primary::<ClusterSpec>()
            .exclusive_output::<TalosUpgradeStatusSpec>()
            .exclusive_output::<ClusterMachineTalosVersionSpec>()
            .build();
        for binding in [
            KindRef::of::<ClusterMachineSpec>(),
            KindRef::of::<ClusterMachineConfigStatusSpec>(),
            KindRef::of::<SchematicConfigurationSpec>(),
            KindRef::of::<MachineSetNodeSpec>(),
        ] {
            settings.inputs.push(InputBinding {
                kind: binding,
                mapping: InputMapping::Mapped(mappers::by_cluster_label::<ClusterSpec>()),
            });
        }
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<ClusterStatusSpec>(),
            mapping: InputMapping::Mapped(mappers::same_id::<ClusterSpec>()),
        });
        settings
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome> {
        let cluster = rt.get::<ClusterSpec>(&ptr.id).await?;
        let Some(cluster) = cluster.filter(|c| !c.metadata.is_tearing_down()) else {
            return self.sweep(rt, &ptr.id).await;
        };

        // A locked cluster is pinned entirely unless it is being imported.
        let locked = cluster
            .metadata
            .annotations
            .contains(annotation::CLUSTER_LOCKED)
            && !cluster
                .metadata
                .annotations
                .contains(annotation::IMPORT_IN_PROGRESS);
        if locked {
            return Ok(ReconcileOutcome::Skip);
        }

        let desired_version = cluster.spec.talos_version.clone();
        if desired_version.is_empty() {
            return Ok(ReconcileOutcome::Skip);
        }

        let machines = rt
            .list::<ClusterMachineSpec>(&LabelQuery::all().eq(label::CLUSTER, &ptr.id))
            .await?;
        let statuses: HashMap<String, Resource<ClusterMachineConfigStatusSpec>> = rt
            .list::<ClusterMachineConfigStatusSpec>(&LabelQuery::all().eq(label::CLUSTER, &ptr.id))
            .await?
            .into_iter()
            .map(|status| (status.metadata.id.clone(), status))
            .collect();
        let nodes: HashMap<String, Resource<MachineSetNodeSpec>> = rt
            .list::<MachineSetNodeSpec>(&LabelQuery::all().eq(label::CLUSTER, &ptr.id))
            .await?
            .into_iter()
            .map(|node| (node.metadata.id.clone(), node))
            .collect();

        let previous_status = rt.get::<TalosUpgradeStatusSpec>(&ptr.id).await?;
        let last_upgrade_version = previous_status
            .as_ref()
            .map(|status| status.spec.last_upgrade_version.clone())
            .unwrap_or_default();

        let mut states = Vec::new();
        let mut version_drift = false;
        let mut schematic_drift = false;

        for machine in &machines {
            if machine.metadata.is_tearing_down() {
                continue;
            }
            let machine_id = machine.metadata.id.clone();

            // The desired schematic must have been resolved for the desired
            // Talos version; a stale resolution means this machine is not
            // ready to be considered at all.
            let schematic = rt
                .get::<SchematicConfigurationSpec>(&machine_id)
                .await?;
            let desired_schematic = match &schematic {
                Some(config) if config.spec.talos_version == desired_version => {
                    config.spec.schematic_id.clone()
                }
                Some(_) => continue,
                None => String::new(),
            };

            let status = statuses.get(&machine_id);
            let current_version = status
                .map(|s| s.spec.talos_version.clone())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| desired_version.clone());
            let current_schematic = status
                .map(|s| s.spec.schematic_id.clone())
                .unwrap_or_else(|| desired_schematic.clone());

            let schematic_for_init = current_schematic.clone();
            let version_for_init = current_version.clone();
            let cluster_labels: Vec<(String, String)> = machine
                .metadata
                .labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let cmtv = rt
                .create_or_modify::<ClusterMachineTalosVersionSpec, _, _>(
                    &machine_id,
                    move || ClusterMachineTalosVersionSpec {
                        talos_version: version_for_init.clone(),
                        schematic_id: schematic_for_init.clone(),
                    },
                    |res| {
                        for (key, value) in &cluster_labels {
                            res.metadata.labels.set(key, value);
                        }
                        Ok(())
                    },
                )
                .await?;
            let Some(cmtv) = cmtv else {
                continue;
            };

            let status_lags = match status {
                Some(status) => {
                    (!status.spec.talos_version.is_empty()
                        && status.spec.talos_version != desired_version)
                        || !status.spec.last_config_error.is_empty()
                }
                None => false,
            };
            let version_mismatch = cmtv.spec.talos_version != desired_version
                || status
                    .is_some_and(|s| !s.spec.talos_version.is_empty()
                        && s.spec.talos_version != desired_version);
            // An empty desired schematic means no resolution exists yet for
            // this machine; that is not drift.
            let schematic_mismatch = !desired_schematic.is_empty()
                && (cmtv.spec.schematic_id != desired_schematic
                    || status.is_some_and(|s| s.spec.schematic_id != desired_schematic));
            let needs_update = version_mismatch || schematic_mismatch || status_lags;

            version_drift |= version_mismatch;
            schematic_drift |= schematic_mismatch;

            states.push(MachineState {
                locked: nodes
                    .get(&machine_id)
                    .is_some_and(|node| {
                        node.metadata
                            .annotations
                            .contains(annotation::MACHINE_LOCKED)
                    }),
                node_created: nodes.get(&machine_id).map(|node| node.metadata.created),
                is_control_plane: machine.metadata.labels.contains(label::ROLE_CONTROLPLANE),
                desired_schematic,
                needs_update,
                machine_id,
            });
        }

        if !states.iter().any(|state| state.needs_update) {
            let targets = upgrade_targets(&desired_version, &cluster.spec.kubernetes_version);
            self.write_status(rt, &ptr.id, |spec| {
                spec.phase = UpgradePhase::Done;
                spec.step.clear();
                spec.status.clear();
                spec.error.clear();
                spec.last_upgrade_version = desired_version.clone();
                spec.current_upgrade_version.clear();
                spec.upgrade_versions = targets.clone();
            })
            .await?;
            return Ok(ReconcileOutcome::Done);
        }

        let phase = if version_drift {
            if !last_upgrade_version.is_empty() && last_upgrade_version == desired_version {
                UpgradePhase::Reverting
            } else {
                UpgradePhase::Upgrading
            }
        } else if schematic_drift {
            UpgradePhase::UpdatingMachineSchematics
        } else {
            UpgradePhase::Upgrading
        };

        // Pause while the cluster is unhealthy, without regressing phase.
        let cluster_ready = rt
            .get::<ClusterStatusSpec>(&ptr.id)
            .await?
            .is_some_and(|status| status.spec.ready);
        if !cluster_ready {
            self.write_status(rt, &ptr.id, |spec| {
                spec.phase = phase;
                spec.current_upgrade_version = desired_version.clone();
                spec.status = "waiting for the cluster to be ready".to_string();
            })
            .await?;
            return Ok(ReconcileOutcome::Skip);
        }

        // Control plane first, then workers; oldest membership first.
        let mut candidates: Vec<&MachineState> =
            states.iter().filter(|state| state.needs_update).collect();
        candidates.sort_by(|a, b| {
            b.is_control_plane
                .cmp(&a.is_control_plane)
                .then(a.node_created.cmp(&b.node_created))
                .then(a.machine_id.cmp(&b.machine_id))
        });

        let next = candidates[0];
        if next.locked {
            let step = format!("waiting for the machine {} to be unlocked", next.machine_id);
            self.write_status(rt, &ptr.id, |spec| {
                spec.phase = phase;
                spec.current_upgrade_version = desired_version.clone();
                spec.step = step.clone();
                spec.status = "paused".to_string();
            })
            .await?;
            return Ok(ReconcileOutcome::Skip);
        }

        info!(machine = %next.machine_id, version = %desired_version, "advancing machine");
        let schematic = next.desired_schematic.clone();
        let version = desired_version.clone();
        rt.modify::<ClusterMachineTalosVersionSpec, _>(&next.machine_id, |res| {
            res.spec.talos_version = version.clone();
            res.spec.schematic_id = schematic.clone();
            Ok(())
        })
        .await?;

        let step = format!("updating machine {}", next.machine_id);
        self.write_status(rt, &ptr.id, |spec| {
            spec.phase = phase;
            spec.current_upgrade_version = desired_version.clone();
            spec.step = step.clone();
            spec.status = "in progress".to_string();
            spec.error.clear();
        })
        .await?;

        Ok(ReconcileOutcome::Done)
    }
}

impl TalosUpgradeController {
    async fn write_status<F>(&self, rt: &QRuntime, cluster_id: &str, apply: F) -> Result<()>
    where
        F: Fn(&mut TalosUpgradeStatusSpec) + Send + Sync,
    {
        rt.create_or_modify::<TalosUpgradeStatusSpec, _, _>(
            cluster_id,
            TalosUpgradeStatusSpec::default,
            |res| {
                res.metadata.labels.set(label::CLUSTER, cluster_id);
                apply(&mut res.spec);
                Ok(())
            },
        )
        .await?;
        Ok(())
    }

    /// Cluster gone or tearing down: drop the owned outputs.
    async fn sweep(&self, rt: &QRuntime, cluster_id: &str) -> Result<ReconcileOutcome> {
        let versions = rt
            .list::<ClusterMachineTalosVersionSpec>(
                &LabelQuery::all().eq(label::CLUSTER, cluster_id),
            )
            .await?;
        for version in &versions {
            rt.teardown_and_destroy::<ClusterMachineTalosVersionSpec>(&version.metadata.id)
                .await?;
        }
        rt.teardown_and_destroy::<TalosUpgradeStatusSpec>(cluster_id)
            .await?;
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_targets_respect_kubernetes_compat() {
        let targets = upgrade_targets("1.7.5", "1.30.2");
        assert_eq!(targets, vec!["1.7.6", "1.7.7", "1.8.3", "1.9.1"]);

        // Kubernetes 1.24 rules out everything newer than the 1.6 line.
        let targets = upgrade_targets("1.6.7", "1.24.0");
        assert!(targets.is_empty());

        let targets = upgrade_targets("1.8.3", "1.31.0");
        assert_eq!(targets, vec!["1.9.1"]);
    }

    #[test]
    fn test_parse_version_ordering() {
        assert!(parse_version("1.8.0") > parse_version("1.7.9"));
        assert!(parse_version("1.10.0") > parse_version("1.9.1"));
        assert_eq!(parse_version("bogus"), (0, 0, 0));
    }
}
