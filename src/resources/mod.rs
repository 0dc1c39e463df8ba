// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed resource specs for the cluster-orchestration graph, plus the
//! shared label and annotation vocabulary controllers coordinate through.

mod cluster;
mod config;
mod machine;
mod machine_set;
mod status;
mod upgrade;

pub use cluster::{
    CertificatePair, ClusterConfigVersionSpec, ClusterDestroyStatusSpec, ClusterIdentitySpec,
    ClusterPhase, ClusterSecretsSpec, ClusterSpec, ClusterStatusSpec, LoadBalancerConfigSpec,
    LoadBalancerStatusSpec, SecretBundle,
};
pub use config::{
    ClusterMachineConfigPatchesSpec, ClusterMachineConfigSpec, ClusterMachineConfigStatusSpec,
    ClusterMachineExtendedConfigSpec, ConfigPatchSpec, InstallImage, MachineConfigDiffSpec,
    MachineConfigGenOptionsSpec, MachineJoinConfigSpec, RedactedClusterMachineConfigSpec,
};
pub use machine::{
    BlockDevice, Diagnostic, HardwareStatus, MachineSpec, MachineStatusLinkSpec, MachineStatusSpec,
    NetworkStatus, PlatformMetadata, SchematicInfo, SecurityState, TalosConfigSpec,
};
pub use machine_set::{
    ClusterMachineIdentitySpec, ClusterMachineSpec, MachineCounts, MachineSetNodeSpec,
    MachineSetPhase, MachineSetSpec, MachineSetStatusSpec,
};
pub use status::{
    ConditionStatus, ConditionType, ControlPlaneCondition, ControlPlaneStatusSpec,
    DiscoveryAffiliateDeleteTaskSpec, EtcdAuditResultSpec, OngoingTaskKind, OngoingTaskSpec,
    Severity,
};
pub use upgrade::{
    ClusterMachineTalosVersionSpec, SchematicConfigurationSpec, TalosUpgradeStatusSpec,
    UpgradePhase,
};

/// Queryable labels shared across controllers.
pub mod label {
    /// Cluster the resource belongs to.
    pub const CLUSTER: &str = "fleet.xmv.dev/cluster";
    /// Machine set the resource belongs to.
    pub const MACHINE_SET: &str = "fleet.xmv.dev/machine-set";
    /// Present on control-plane machine sets and their resources.
    pub const ROLE_CONTROLPLANE: &str = "fleet.xmv.dev/role-controlplane";
    /// Present on worker machine sets and their resources.
    pub const ROLE_WORKER: &str = "fleet.xmv.dev/role-worker";
    /// Machine the resource belongs to (used on config patches).
    pub const MACHINE: &str = "fleet.xmv.dev/machine";

    // MachineStatus state labels, toggled by the status collector.
    pub const CONNECTED: &str = "fleet.xmv.dev/connected";
    pub const DISCONNECTED: &str = "fleet.xmv.dev/disconnected";
    pub const READY_TO_USE: &str = "fleet.xmv.dev/ready-to-use";
    pub const REPORTING_EVENTS: &str = "fleet.xmv.dev/reporting-events";
    pub const INVALID_STATE: &str = "fleet.xmv.dev/invalid-state";
    pub const AVAILABLE: &str = "fleet.xmv.dev/available";

    /// Prefix under which machine image labels are mirrored to
    /// `MachineStatus`.
    pub const IMAGE_LABEL_PREFIX: &str = "fleet.xmv.dev/image.";
}

/// Non-queryable annotations.
pub mod annotation {
    /// Pins a machine against disruptive operations (update, delete).
    pub const MACHINE_LOCKED: &str = "fleet.xmv.dev/machine-locked";
    /// Pins a cluster against disruptive operations.
    pub const CLUSTER_LOCKED: &str = "fleet.xmv.dev/cluster-locked";
    /// Set while a locked cluster is being imported; suspends the lock.
    pub const IMPORT_IN_PROGRESS: &str = "fleet.xmv.dev/import-in-progress";
    /// Timestamp annotation on `MachineConfigDiff` resources. Fixed-width
    /// fractional seconds keep lexicographic order equal to time order.
    pub const MODIFIED_AT: &str = "fleet.xmv.dev/modified-at";
    /// Keep the legacy apid `checkExtKeyUsage` setting when regenerating.
    pub const PRESERVE_APID_CHECK_EXT_KEY_USAGE: &str =
        "fleet.xmv.dev/preserve-apid-check-ext-key-usage";
    /// Keep the legacy disk-quota-support setting when regenerating.
    pub const PRESERVE_DISK_QUOTA_SUPPORT: &str = "fleet.xmv.dev/preserve-disk-quota-support";
}

/// Conventional ID of a cluster's control-plane machine set.
#[must_use]
pub fn control_plane_machine_set_id(cluster: &str) -> String {
    format!("{cluster}-control-planes")
}

/// Timestamp format used in `modified-at` annotations and diff IDs.
/// `%.9f` pads fractional seconds to nine digits so string order matches
/// time order.
pub const MODIFIED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";
