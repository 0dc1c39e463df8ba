// SPDX-License-Identifier: MIT OR Apache-2.0

//! Control-plane health.
//!
//! For every control-plane machine set a chain of checks runs under one
//! deadline: wireguard connectivity of all members first, then etcd
//! membership through the first reachable member. The first failing check
//! marks its condition and every later check reports Unknown with the
//! reason, so operators always see which link broke first.

use crate::clients::{MachineClientFactory, TalosClientCerts, TalosClientSpec};
use crate::config::FleetSettings;
use crate::error::Result;
use crate::patterns::mappers;
use crate::resource::{KindRef, LabelQuery, Metadata, Resource, ResourcePointer};
use crate::resources::label;
use crate::resources::{
    ConditionStatus, ConditionType, ControlPlaneCondition, ControlPlaneStatusSpec,
    MachineSetNodeSpec, MachineSetSpec, MachineSpec, TalosConfigSpec,
};
use crate::runtime::{
    ControllerSettings, InputBinding, InputMapping, Mapper, QController, QRuntime,
    ReconcileOutcome,
};
use crate::resources::Severity;
use crate::store::{Store, StoreExt};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const CONTROLLER_NAME: &str = "ControlPlaneStatusController";

/// Machines carry no cluster label; follow the machine-set node that binds
/// them instead.
struct MachineToMachineSet;

#[async_trait]
impl Mapper for MachineToMachineSet {
    async fn map(
        &self,
        store: &Arc<dyn Store>,
        md: &Metadata,
    ) -> Result<Vec<ResourcePointer>> {
        let Some(node) = store.get_typed::<MachineSetNodeSpec>(&md.id).await? else {
            return Ok(Vec::new());
        };
        Ok(node
            .metadata
            .labels
            .get(crate::resources::label::MACHINE_SET)
            .map(|set| vec![ResourcePointer::new::<MachineSetSpec>(set)])
            .unwrap_or_default())
    }
}

struct CheckResult {
    status: ConditionStatus,
    severity: Severity,
    /// Stop the chain; later checks go Unknown.
    interrupt: bool,
    reason: String,
}

impl CheckResult {
    fn ready() -> Self {
        Self {
            status: ConditionStatus::Ready,
            severity: Severity::Info,
            interrupt: false,
            reason: String::new(),
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: ConditionStatus::NotReady,
            severity: Severity::Error,
            interrupt: true,
            reason: reason.into(),
        }
    }
}

pub struct ControlPlaneStatusController {
    factory: Arc<dyn MachineClientFactory>,
    settings: FleetSettings,
}

impl ControlPlaneStatusController {
    #[must_use]
    pub fn new(factory: Arc<dyn MachineClientFactory>, settings: FleetSettings) -> Self {
        Self { factory, settings }
    }

    async fn members(
        &self,
        rt: &QRuntime,
        machine_set_id: &str,
    ) -> Result<Vec<Resource<MachineSpec>>> {
        let nodes = rt
            .list::<MachineSetNodeSpec>(
                &LabelQuery::all().eq(label::MACHINE_SET, machine_set_id),
            )
            .await?;
        let mut machines = Vec::new();
        for node in &nodes {
            if let Some(machine) = rt.get::<MachineSpec>(&node.metadata.id).await? {
                machines.push(machine);
            }
        }
        Ok(machines)
    }

    fn check_wireguard(machines: &[Resource<MachineSpec>]) -> CheckResult {
        if machines.is_empty() {
            return CheckResult::failed("no control plane machines");
        }
        for machine in machines {
            if !machine.spec.connected {
                return CheckResult::failed(format!(
                    "machine {} is not connected",
                    machine.metadata.id
                ));
            }
        }
        CheckResult::ready()
    }

    async fn check_etcd(
        &self,
        rt: &QRuntime,
        machines: &[Resource<MachineSpec>],
    ) -> CheckResult {
        for machine in machines {
            let endpoint = format!("https://{}:50000", machine.spec.management_address);
            let spec = match rt.get::<TalosConfigSpec>(&machine.metadata.id).await {
                Ok(Some(config)) => TalosClientSpec::secure(
                    endpoint,
                    TalosClientCerts {
                        ca: config.spec.ca.clone(),
                        crt: config.spec.crt.clone(),
                        key: config.spec.key.clone(),
                    },
                ),
                Ok(None) => TalosClientSpec::maintenance(endpoint),
                Err(_) => continue,
            };
            let Ok(client) = self.factory.open(&spec).await else {
                continue;
            };
            match client.etcd_member_list().await {
                Ok(members) => {
                    if members.len() == machines.len() {
                        return CheckResult::ready();
                    }
                    return CheckResult {
                        status: ConditionStatus::NotReady,
                        severity: Severity::Warning,
                        interrupt: true,
                        reason: format!(
                            "etcd has {} members, expected {}",
                            members.len(),
                            machines.len()
                        ),
                    };
                }
                Err(err) => {
                    debug!(machine = %machine.metadata.id, %err, "etcd member list failed");
                }
            }
        }
        CheckResult::failed("no control plane machine answered the etcd member list")
    }

    async fn run_checks(&self, rt: &QRuntime, machine_set_id: &str) -> Result<Vec<ControlPlaneCondition>> {
        let machines = self.members(rt, machine_set_id).await?;
        let mut conditions = Vec::new();
        let mut interrupted: Option<String> = None;

        for condition_type in [ConditionType::WireguardConnection, ConditionType::Etcd] {
            if let Some(reason) = &interrupted {
                conditions.push(ControlPlaneCondition {
                    condition: condition_type,
                    status: ConditionStatus::Unknown,
                    severity: Severity::Info,
                    reason: format!("skipped: {reason}"),
                });
                continue;
            }

            let result = match condition_type {
                ConditionType::WireguardConnection => Self::check_wireguard(&machines),
                ConditionType::Etcd => self.check_etcd(rt, &machines).await,
            };
            if result.interrupt {
                interrupted = Some(result.reason.clone());
            }
            conditions.push(ControlPlaneCondition {
                condition: condition_type,
                status: result.status,
                severity: result.severity,
                reason: result.reason,
            });
        }

        Ok(conditions)
    }
}

#[async_trait]
impl QController for ControlPlaneStatusController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::builder()
            .primary::<MachineSetSpec>()
            .exclusive_output::<ControlPlaneStatusSpec>()
            .build();
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<MachineSpec>(),
            mapping: InputMapping::Mapped(Arc::new(MachineToMachineSet)),
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<MachineSetNodeSpec>(),
            mapping: InputMapping::Mapped(mappers::by_machine_set_label::<MachineSetSpec>()),
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<TalosConfigSpec>(),
            mapping: InputMapping::Weak,
        });
        settings
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome> {
        let Some(machine_set) = rt.get::<MachineSetSpec>(&ptr.id).await? else {
            rt.teardown_and_destroy::<ControlPlaneStatusSpec>(&ptr.id)
                .await?;
            return Ok(ReconcileOutcome::Done);
        };

        if !machine_set
            .metadata
            .labels
            .contains(label::ROLE_CONTROLPLANE)
        {
            return Ok(ReconcileOutcome::Done);
        }

        if machine_set.metadata.is_tearing_down() {
            rt.teardown_and_destroy::<ControlPlaneStatusSpec>(&ptr.id)
                .await?;
            return Ok(ReconcileOutcome::Done);
        }

        let conditions = tokio::time::timeout(
            self.settings.control_plane_check_timeout,
            self.run_checks(rt, &ptr.id),
        )
        .await
        .unwrap_or_else(|_| {
            Ok(vec![ControlPlaneCondition {
                condition: ConditionType::WireguardConnection,
                status: ConditionStatus::Unknown,
                severity: Severity::Error,
                reason: "health checks timed out".to_string(),
            }])
        })?;

        let cluster = machine_set
            .metadata
            .labels
            .get(label::CLUSTER)
            .unwrap_or_default()
            .to_string();
        rt.create_or_modify::<ControlPlaneStatusSpec, _, _>(
            &ptr.id,
            ControlPlaneStatusSpec::default,
            |res| {
                if !cluster.is_empty() {
                    res.metadata.labels.set(label::CLUSTER, &cluster);
                }
                res.metadata.labels.set(label::MACHINE_SET, &ptr.id);
                res.spec.conditions = conditions.clone();
                Ok(())
            },
        )
        .await?;

        // Health drifts without resource events; poll on a timer.
        Ok(ReconcileOutcome::Requeue(self.settings.audit_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(id: &str, connected: bool) -> Resource<MachineSpec> {
        Resource::new(
            id,
            MachineSpec {
                management_address: format!("10.0.0.{}", id.len()),
                connected,
            },
        )
    }

    #[test]
    fn test_wireguard_check() {
        let result = ControlPlaneStatusController::check_wireguard(&[]);
        assert_eq!(result.status, ConditionStatus::NotReady);

        let result = ControlPlaneStatusController::check_wireguard(&[
            machine("m-1", true),
            machine("m-2", true),
        ]);
        assert_eq!(result.status, ConditionStatus::Ready);

        let result = ControlPlaneStatusController::check_wireguard(&[
            machine("m-1", true),
            machine("m-2", false),
        ]);
        assert_eq!(result.status, ConditionStatus::NotReady);
        assert!(result.reason.contains("m-2"));
        assert!(result.interrupt);
    }
}
