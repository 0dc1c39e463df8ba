// SPDX-License-Identifier: MIT OR Apache-2.0

//! Config application and the reset-on-leave step.
//!
//! Pushes each machine's generated config to the node and records what the
//! node acknowledged in `ClusterMachineConfigStatus`: the config resource
//! version, the patch-set watermark, and the applied (version, schematic).
//! The controller holds a finalizer on the `ClusterMachine`; on teardown it
//! resets the node (leaving etcd gracefully while the cluster still
//! exists) before letting go, which is what the rest of the teardown
//! cascade orders itself around.

use crate::clients::{MachineClientFactory, TalosClientCerts, TalosClientSpec, WipeMode};
use crate::config::FleetSettings;
use crate::error::{FleetError, Result};
use crate::patterns::mappers;
use crate::resource::{KindRef, Resource, ResourcePointer};
use crate::resources::label;
use crate::resources::{
    ClusterMachineConfigPatchesSpec, ClusterMachineConfigStatusSpec,
    ClusterMachineExtendedConfigSpec, ClusterMachineSpec, ClusterSpec, MachineSpec,
    TalosConfigSpec,
};
use crate::runtime::{
    ControllerSettings, InputBinding, InputMapping, QController, QRuntime, ReconcileOutcome,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, warn};

use super::machine_config::decompress_config;

const CONTROLLER_NAME: &str = "ConfigStatusController";

pub struct ConfigStatusController {
    factory: Arc<dyn MachineClientFactory>,
    settings: FleetSettings,
}

impl ConfigStatusController {
    #[must_use]
    pub fn new(factory: Arc<dyn MachineClientFactory>, settings: FleetSettings) -> Self {
        Self { factory, settings }
    }

    async fn client_spec(
        &self,
        rt: &QRuntime,
        machine: &Resource<MachineSpec>,
    ) -> Result<TalosClientSpec> {
        let endpoint = format!("https://{}:50000", machine.spec.management_address);
        Ok(match rt.get::<TalosConfigSpec>(machine.id()).await? {
            Some(config) => TalosClientSpec::secure(
                endpoint,
                TalosClientCerts {
                    ca: config.spec.ca.clone(),
                    crt: config.spec.crt.clone(),
                    key: config.spec.key.clone(),
                },
            ),
            None => TalosClientSpec::maintenance(endpoint),
        })
    }

    async fn apply(
        &self,
        rt: &QRuntime,
        machine: &Resource<MachineSpec>,
        data: Bytes,
    ) -> Result<()> {
        let spec = self.client_spec(rt, machine).await?;
        let client = self.factory.open(&spec).await?;
        tokio::time::timeout(
            self.settings.external_call_timeout,
            client.apply_configuration(data),
        )
        .await
        .map_err(|_| FleetError::Runtime(format!("apply to {} timed out", machine.id())))?
    }

    async fn reset(&self, rt: &QRuntime, machine: &Resource<MachineSpec>, graceful: bool) -> Result<()> {
        let spec = self.client_spec(rt, machine).await?;
        let client = self.factory.open(&spec).await?;
        tokio::time::timeout(
            self.settings.external_call_timeout,
            client.reset(graceful, false, WipeMode::SystemDisk),
        )
        .await
        .map_err(|_| FleetError::Runtime(format!("reset of {} timed out", machine.id())))?
    }

    async fn teardown(
        &self,
        rt: &QRuntime,
        cluster_machine: &Resource<ClusterMachineSpec>,
    ) -> Result<ReconcileOutcome> {
        if !cluster_machine.metadata.has_finalizer(CONTROLLER_NAME) {
            return Ok(ReconcileOutcome::Done);
        }

        if let Some(machine) = rt.get::<MachineSpec>(cluster_machine.id()).await? {
            if machine.spec.connected {
                // Leave etcd gracefully while the cluster is still alive; a
                // cluster teardown wants speed over etcd ceremony.
                let graceful = match cluster_machine.metadata.labels.get(label::CLUSTER) {
                    Some(cluster_id) => rt
                        .get::<ClusterSpec>(cluster_id)
                        .await?
                        .is_some_and(|cluster| !cluster.metadata.is_tearing_down()),
                    None => false,
                };
                if let Err(err) = self.reset(rt, &machine, graceful).await {
                    warn!(machine = %cluster_machine.id(), %err, "reset failed, retrying");
                    return Err(err);
                }
                info!(machine = %cluster_machine.id(), graceful, "machine reset");
            }
        }

        rt.teardown_and_destroy::<ClusterMachineConfigStatusSpec>(cluster_machine.id())
            .await?;
        rt.remove_finalizer(&cluster_machine.pointer()).await?;
        Ok(ReconcileOutcome::Done)
    }
}

#[async_trait]
impl QController for ConfigStatusController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::builder()
            .primary::<ClusterMachineSpec>()
            .exclusive_output::<ClusterMachineConfigStatusSpec>()
            .concurrency(4)
            .build();
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<ClusterMachineExtendedConfigSpec>(),
            mapping: InputMapping::Mapped(mappers::same_id::<ClusterMachineSpec>()),
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<MachineSpec>(),
            mapping: InputMapping::Mapped(mappers::same_id::<ClusterMachineSpec>()),
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<ClusterMachineConfigPatchesSpec>(),
            mapping: InputMapping::Weak,
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<TalosConfigSpec>(),
            mapping: InputMapping::Weak,
        });
        settings
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome> {
        let Some(cluster_machine) = rt.get::<ClusterMachineSpec>(&ptr.id).await? else {
            rt.teardown_and_destroy::<ClusterMachineConfigStatusSpec>(&ptr.id)
                .await?;
            return Ok(ReconcileOutcome::Done);
        };

        if cluster_machine.metadata.is_tearing_down() {
            return self.teardown(rt, &cluster_machine).await;
        }

        rt.add_finalizer(&cluster_machine.pointer()).await?;

        let Some(extended) = rt
            .get::<ClusterMachineExtendedConfigSpec>(&ptr.id)
            .await?
        else {
            return Ok(ReconcileOutcome::Skip);
        };
        if extended.spec.data.is_empty() {
            return Ok(ReconcileOutcome::Skip);
        }

        let Some(machine) = rt.get::<MachineSpec>(&ptr.id).await? else {
            return Ok(ReconcileOutcome::Skip);
        };
        if !machine.spec.connected {
            return Ok(ReconcileOutcome::Skip);
        }

        let applied_version = rt
            .get::<ClusterMachineConfigStatusSpec>(&ptr.id)
            .await?
            .map(|status| status.spec.cluster_machine_config_version)
            .unwrap_or(0);
        if applied_version == extended.metadata.version {
            return Ok(ReconcileOutcome::Done);
        }

        let plain = decompress_config(&extended.spec.data)?;
        let apply_result = self.apply(rt, &machine, Bytes::from(plain)).await;

        let patches_sha = rt
            .get::<ClusterMachineConfigPatchesSpec>(&ptr.id)
            .await?
            .map(|patches| patches.spec.sha256())
            .unwrap_or_default();
        let install_image = extended.spec.install_image.clone();
        let config_version = extended.metadata.version;
        let cluster_labels: Vec<(String, String)> = cluster_machine
            .metadata
            .labels
            .iter()
            .filter(|(key, _)| [label::CLUSTER, label::MACHINE_SET].contains(key))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        let error_message = apply_result.as_ref().err().map(ToString::to_string);

        rt.create_or_modify::<ClusterMachineConfigStatusSpec, _, _>(
            &ptr.id,
            ClusterMachineConfigStatusSpec::default,
            |status| {
                for (key, value) in &cluster_labels {
                    status.metadata.labels.set(key, value);
                }
                match &error_message {
                    Some(message) => {
                        status.spec.last_config_error = message.clone();
                    }
                    None => {
                        status.spec.cluster_machine_config_version = config_version;
                        status.spec.cluster_machine_config_sha256 = patches_sha.clone();
                        if let Some(image) = &install_image {
                            status.spec.talos_version = image.talos_version.clone();
                            status.spec.schematic_id = image.schematic_id.clone();
                        }
                        status.spec.last_config_error.clear();
                    }
                }
                Ok(())
            },
        )
        .await?;

        apply_result?;
        Ok(ReconcileOutcome::Done)
    }
}
