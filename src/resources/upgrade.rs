// SPDX-License-Identifier: MIT OR Apache-2.0

//! Upgrade-pipeline resources.

use crate::resource::ResourceSpec;
use serde::{Deserialize, Serialize};

/// Desired schematic for a machine inside a cluster, resolved for a
/// specific Talos version.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchematicConfigurationSpec {
    pub schematic_id: String,
    /// Talos version the schematic was resolved for. A mismatch with the
    /// cluster's desired version means the resolution is still in flight.
    pub talos_version: String,
}

impl ResourceSpec for SchematicConfigurationSpec {
    const KIND: &'static str = "SchematicConfigurations";
}

/// Desired (version, schematic) pair for one machine; what the config
/// generator installs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterMachineTalosVersionSpec {
    pub talos_version: String,
    pub schematic_id: String,
}

impl ResourceSpec for ClusterMachineTalosVersionSpec {
    const KIND: &'static str = "ClusterMachineTalosVersions";
}

/// Phase of a cluster-wide Talos upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpgradePhase {
    #[default]
    Unknown,
    /// Talos versions differ between desired and installed.
    Upgrading,
    /// Versions match everywhere; only schematics drift.
    UpdatingMachineSchematics,
    /// The desired version equals the last successful one but drift exists.
    Reverting,
    Done,
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradePhase::Unknown => write!(f, "unknown"),
            UpgradePhase::Upgrading => write!(f, "upgrading"),
            UpgradePhase::UpdatingMachineSchematics => write!(f, "updatingMachineSchematics"),
            UpgradePhase::Reverting => write!(f, "reverting"),
            UpgradePhase::Done => write!(f, "done"),
        }
    }
}

/// Cluster-level upgrade state machine, one per cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TalosUpgradeStatusSpec {
    pub phase: UpgradePhase,
    /// Human-readable current step ("updating machine m-1", "waiting for
    /// the machine m-2 to be unlocked").
    pub step: String,
    pub status: String,
    pub error: String,
    /// Last version every machine converged on.
    pub last_upgrade_version: String,
    /// Version currently rolling out, empty when done.
    pub current_upgrade_version: String,
    /// Talos versions the cluster could upgrade to next, filtered for
    /// compatibility with the cluster's Kubernetes version.
    pub upgrade_versions: Vec<String>,
}

impl ResourceSpec for TalosUpgradeStatusSpec {
    const KIND: &'static str = "TalosUpgradeStatuses";
}
