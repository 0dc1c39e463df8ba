// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-machine config-generation options.
//!
//! Joins `MachineStatus` with the machine's desired
//! `ClusterMachineTalosVersion` into `MachineConfigGenOptions`: the install
//! disk (system disk if known, largest block device otherwise) and the
//! install image. A machine whose desired schematic is still empty falls
//! back to the initial schematic it registered with; that fallback waits
//! until the machine has reported its boot-security state, because the
//! image differs between secure-boot and plain installs.

use crate::error::Result;
use crate::patterns::mappers;
use crate::patterns::{QTransform, TransformOutcome};
use crate::resource::{KindRef, Resource};
use crate::resources::label;
use crate::resources::{
    ClusterMachineTalosVersionSpec, InstallImage, MachineConfigGenOptionsSpec, MachineStatusSpec,
};
use crate::runtime::{InputBinding, InputMapping, QRuntime};
use async_trait::async_trait;

pub struct MachineConfigGenOptionsController;

fn pick_install_disk(status: &MachineStatusSpec) -> String {
    let Some(hardware) = &status.hardware else {
        return String::new();
    };
    if let Some(system) = hardware.blockdevices.iter().find(|d| d.system_disk) {
        return system.linux_name.clone();
    }
    hardware
        .blockdevices
        .iter()
        .max_by_key(|d| d.size)
        .map(|d| d.linux_name.clone())
        .unwrap_or_default()
}

#[async_trait]
impl QTransform for MachineConfigGenOptionsController {
    type Input = MachineStatusSpec;
    type Output = MachineConfigGenOptionsSpec;

    fn name(&self) -> &'static str {
        "MachineConfigGenOptionsController"
    }

    fn extra_inputs(&self) -> Vec<InputBinding> {
        vec![InputBinding {
            kind: KindRef::of::<ClusterMachineTalosVersionSpec>(),
            mapping: InputMapping::Mapped(mappers::same_id::<MachineStatusSpec>()),
        }]
    }

    async fn transform(
        &self,
        rt: &QRuntime,
        input: &Resource<MachineStatusSpec>,
        output: &mut Resource<MachineConfigGenOptionsSpec>,
    ) -> Result<TransformOutcome> {
        for (key, value) in input.metadata.labels.iter() {
            if key == label::CLUSTER || key == label::MACHINE_SET {
                output.metadata.labels.set(key, value);
            }
        }

        output.spec.install_disk = pick_install_disk(&input.spec);

        let Some(desired) = rt
            .get::<ClusterMachineTalosVersionSpec>(input.id())
            .await?
        else {
            // Not part of a cluster; nothing to install.
            output.spec.install_image = None;
            return Ok(TransformOutcome::Modified);
        };

        let secure_boot = input.spec.security_state.map(|s| s.secure_boot);
        let mut schematic_id = desired.spec.schematic_id.clone();
        let mut schematic_initialized = !schematic_id.is_empty();

        if !schematic_initialized {
            // Fall back to the schematic the machine registered with, once
            // the security state is known.
            if secure_boot.is_some() {
                if let Some(schematic) = &input.spec.schematic {
                    if !schematic.initial_schematic.is_empty() {
                        schematic_id = schematic.initial_schematic.clone();
                        schematic_initialized = true;
                    }
                }
            }
        }

        output.spec.install_image = Some(InstallImage {
            talos_version: desired.spec.talos_version.clone(),
            schematic_id,
            schematic_initialized,
            schematic_invalid: input
                .spec
                .schematic
                .as_ref()
                .is_some_and(|s| s.invalid),
            secure_boot,
            platform: input
                .spec
                .platform_metadata
                .as_ref()
                .map(|p| p.platform.clone())
                .unwrap_or_default(),
        });

        // Copy the cluster labels from the desired-version resource too; the
        // status may not carry them for machines joined out-of-band.
        for (key, value) in desired.metadata.labels.iter() {
            if key == label::CLUSTER || key == label::MACHINE_SET {
                output.metadata.labels.set(key, value);
            }
        }

        Ok(TransformOutcome::Modified)
    }
}
