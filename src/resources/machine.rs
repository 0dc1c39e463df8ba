// SPDX-License-Identifier: MIT OR Apache-2.0

//! Machine-level resources: the machine itself, the live status projection
//! collected over the Talos API, and the client credentials used to reach
//! the node.

use crate::resource::{ns, Labels, ResourceSpec};
use serde::{Deserialize, Serialize};

/// A machine known to the control plane. Created when its siderolink comes
/// up, torn down when the link is removed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Address the Talos API is reachable on.
    pub management_address: String,
    /// Whether the link is currently up.
    pub connected: bool,
}

impl ResourceSpec for MachineSpec {
    const KIND: &'static str = "Machines";
}

/// One entry of the machine's block-device inventory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockDevice {
    pub linux_name: String,
    pub size: u64,
    pub system_disk: bool,
    pub transport: String,
}

/// Hardware inventory reported by the machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardwareStatus {
    pub processors: u32,
    pub memory_bytes: u64,
    pub blockdevices: Vec<BlockDevice>,
}

/// Network facts reported by the machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub hostname: String,
    pub domainname: String,
    pub addresses: Vec<String>,
    pub default_gateways: Vec<String>,
}

/// Image customization the machine booted with.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchematicInfo {
    /// Schematic currently installed.
    pub id: String,
    /// Schematic the machine first registered with. One-shot: set on first
    /// observation, never overwritten.
    pub initial_schematic: String,
    /// Set when the schematic cannot be decoded from the node.
    pub invalid: bool,
    pub extensions: Vec<String>,
    pub overlay: String,
}

/// Where the machine runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlatformMetadata {
    pub platform: String,
    pub hostname: String,
    pub region: String,
    pub zone: String,
}

/// Boot-security facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityState {
    pub secure_boot: bool,
}

/// A diagnostic condition reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Diagnostic {
    pub id: String,
    pub message: String,
    pub details: Vec<String>,
}

/// Live data collected from a machine.
///
/// Outlives the `Machine` during teardown so the wipe step still knows the
/// disk layout and credentials.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineStatusSpec {
    pub talos_version: String,
    /// Talos version the machine first registered with. One-shot.
    pub initial_talos_version: String,
    pub schematic: Option<SchematicInfo>,
    pub platform_metadata: Option<PlatformMetadata>,
    pub hardware: Option<HardwareStatus>,
    pub network: Option<NetworkStatus>,
    pub security_state: Option<SecurityState>,
    pub diagnostics: Vec<Diagnostic>,
    pub cmdline: String,
    pub last_error: String,
    /// True while the machine runs in maintenance mode (unconfigured).
    pub maintenance: bool,
    /// Labels baked into the boot image. One-shot; mirrored onto the
    /// resource labels under [`crate::resources::label::IMAGE_LABEL_PREFIX`].
    pub image_labels: Labels,
}

impl ResourceSpec for MachineStatusSpec {
    const KIND: &'static str = "MachineStatuses";
}

/// Client credentials for the machine's Talos API, present once the machine
/// joined a cluster. Absent for machines still in maintenance mode.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TalosConfigSpec {
    pub ca: String,
    pub crt: String,
    pub key: String,
}

impl ResourceSpec for TalosConfigSpec {
    const KIND: &'static str = "TalosConfigs";
}

/// Per-machine rollup consumed by the metrics pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineStatusLinkSpec {
    pub connected: bool,
    pub talos_version: String,
    pub cluster: String,
}

impl ResourceSpec for MachineStatusLinkSpec {
    const KIND: &'static str = "MachineStatusLinks";
    const NAMESPACE: &'static str = ns::METRICS;
}
