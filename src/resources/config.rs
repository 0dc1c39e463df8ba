// SPDX-License-Identifier: MIT OR Apache-2.0

//! Machine-configuration pipeline resources: generation options, patches,
//! the generated document, its redacted mirror, diffs and the apply status.

use crate::resource::ResourceSpec;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The install image a machine should run, resolved from the image factory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstallImage {
    pub talos_version: String,
    pub schematic_id: String,
    /// False until a schematic has been determined for the machine.
    pub schematic_initialized: bool,
    /// Set when the machine reports a schematic the factory cannot decode.
    pub schematic_invalid: bool,
    /// `None` until the machine reported its boot-security state.
    pub secure_boot: Option<bool>,
    pub platform: String,
}

/// Per-machine inputs to config generation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineConfigGenOptionsSpec {
    pub install_disk: String,
    pub install_image: Option<InstallImage>,
}

impl ResourceSpec for MachineConfigGenOptionsSpec {
    const KIND: &'static str = "MachineConfigGenOptions";
}

/// A user-supplied config patch, attached to a cluster, machine set or
/// machine via labels.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfigPatchSpec {
    pub data: String,
}

impl ResourceSpec for ConfigPatchSpec {
    const KIND: &'static str = "ConfigPatches";
}

/// The ordered patch set for one cluster machine, snapshotted by the
/// machine-set controller. The SHA-256 over the patch list is the rollout
/// watermark: a machine is in sync once its config status reports the same
/// hash.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterMachineConfigPatchesSpec {
    pub patches: Vec<String>,
}

impl ClusterMachineConfigPatchesSpec {
    /// Rollout watermark over the patch list.
    #[must_use]
    pub fn sha256(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for patch in &self.patches {
            hasher.update((patch.len() as u64).to_be_bytes());
            hasher.update(patch.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl ResourceSpec for ClusterMachineConfigPatchesSpec {
    const KIND: &'static str = "ClusterMachineConfigPatches";
}

/// The generated full Talos machine config, stored zstd-compressed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterMachineConfigSpec {
    /// zstd-compressed YAML document stream.
    pub data: Bytes,
    /// Version of the `ClusterMachine` the document was generated from.
    pub cluster_machine_version: u64,
    /// Set instead of `data` updates when generation fails; the document
    /// keeps its last good value.
    pub generation_error: String,
}

impl ResourceSpec for ClusterMachineConfigSpec {
    const KIND: &'static str = "ClusterMachineConfigs";
}

/// The same document with secret material replaced by a marker.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RedactedClusterMachineConfigSpec {
    pub data: String,
}

impl ResourceSpec for RedactedClusterMachineConfigSpec {
    const KIND: &'static str = "RedactedClusterMachineConfigs";
}

/// A unified diff between two consecutive redacted configs. The ID is
/// `<machine>-<modified-at>`; retention prunes by age and count.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineConfigDiffSpec {
    pub diff: String,
}

impl ResourceSpec for MachineConfigDiffSpec {
    const KIND: &'static str = "MachineConfigDiffs";
}

/// What the machine last acknowledged applying.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterMachineConfigStatusSpec {
    /// Version of the `ClusterMachineConfig` that was applied.
    pub cluster_machine_config_version: u64,
    /// Watermark of the patch set baked into the applied config.
    pub cluster_machine_config_sha256: String,
    pub talos_version: String,
    pub schematic_id: String,
    pub last_config_error: String,
}

impl ResourceSpec for ClusterMachineConfigStatusSpec {
    const KIND: &'static str = "ClusterMachineConfigStatuses";
}

/// Join parameters for machines on Talos versions with multi-document
/// config support.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineJoinConfigSpec {
    pub config: String,
}

impl ResourceSpec for MachineJoinConfigSpec {
    const KIND: &'static str = "MachineJoinConfigs";
}

/// The generated config joined with its install image, so downstream
/// consumers read one resource instead of combining two.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterMachineExtendedConfigSpec {
    pub data: Bytes,
    pub install_image: Option<InstallImage>,
}

impl ResourceSpec for ClusterMachineExtendedConfigSpec {
    const KIND: &'static str = "ClusterMachineExtendedConfigs";
}
