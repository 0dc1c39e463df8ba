// SPDX-License-Identifier: MIT OR Apache-2.0

//! Machine wipe-on-leave.
//!
//! Holds a finalizer on every `Machine`. When the machine tears down and a
//! system disk is known, the Talos installation is reset (no reboot, system
//! disk only) before the finalizer is released. Disconnected machines skip
//! the wipe; there is nothing to reach.

use crate::clients::{MachineClientFactory, TalosClientCerts, TalosClientSpec, WipeMode};
use crate::config::FleetSettings;
use crate::error::Result;
use crate::resource::{KindRef, Resource, ResourcePointer};
use crate::resources::{MachineSpec, MachineStatusSpec, TalosConfigSpec};
use crate::runtime::{
    ControllerSettings, InputBinding, InputMapping, QController, QRuntime, ReconcileOutcome,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

const CONTROLLER_NAME: &str = "MachineTeardownController";

pub struct MachineTeardownController {
    factory: Arc<dyn MachineClientFactory>,
    settings: FleetSettings,
}

impl MachineTeardownController {
    #[must_use]
    pub fn new(factory: Arc<dyn MachineClientFactory>, settings: FleetSettings) -> Self {
        Self { factory, settings }
    }

    fn has_system_disk(status: &Resource<MachineStatusSpec>) -> bool {
        status
            .spec
            .hardware
            .as_ref()
            .is_some_and(|hw| hw.blockdevices.iter().any(|disk| disk.system_disk))
    }

    async fn wipe(&self, rt: &QRuntime, machine: &Resource<MachineSpec>) -> Result<()> {
        let endpoint = format!("https://{}:50000", machine.spec.management_address);
        let spec = match rt.get::<TalosConfigSpec>(machine.id()).await? {
            Some(config) => TalosClientSpec::secure(
                endpoint,
                TalosClientCerts {
                    ca: config.spec.ca.clone(),
                    crt: config.spec.crt.clone(),
                    key: config.spec.key.clone(),
                },
            ),
            None => TalosClientSpec::maintenance(endpoint),
        };

        let client = self.factory.open(&spec).await?;
        tokio::time::timeout(
            self.settings.external_call_timeout,
            client.reset(false, false, WipeMode::SystemDisk),
        )
        .await
        .map_err(|_| {
            crate::error::FleetError::Runtime(format!("reset of {} timed out", machine.id()))
        })??;
        info!(machine = %machine.id(), "wiped Talos installation");
        Ok(())
    }
}

#[async_trait]
impl QController for MachineTeardownController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::builder()
            .primary::<MachineSpec>()
            .build();
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<MachineStatusSpec>(),
            mapping: InputMapping::Weak,
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<TalosConfigSpec>(),
            mapping: InputMapping::Weak,
        });
        settings
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome> {
        let Some(machine) = rt.get::<MachineSpec>(&ptr.id).await? else {
            return Ok(ReconcileOutcome::Done);
        };

        if !machine.metadata.is_tearing_down() {
            rt.add_finalizer(&machine.pointer()).await?;
            return Ok(ReconcileOutcome::Done);
        }

        if !machine.metadata.has_finalizer(CONTROLLER_NAME) {
            return Ok(ReconcileOutcome::Done);
        }

        let status = rt.get::<MachineStatusSpec>(&ptr.id).await?;
        let wipeable = machine.spec.connected
            && status.as_ref().is_some_and(Self::has_system_disk);

        if wipeable {
            if let Err(err) = self.wipe(rt, &machine).await {
                warn!(machine = %ptr.id, %err, "wipe failed, retrying");
                return Err(err);
            }
        }

        rt.remove_finalizer(&machine.pointer()).await?;
        Ok(ReconcileOutcome::Done)
    }
}
