// SPDX-License-Identifier: MIT OR Apache-2.0

//! Machine sets: groups of machines sharing a role within a cluster, and
//! the per-machine binding resources derived from them.

use crate::resource::ResourceSpec;
use serde::{Deserialize, Serialize};

/// A user-created group of machines with a shared role and rollout policy.
/// Labeled with the cluster and either the control-plane or worker role.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineSetSpec {
    /// Upper bound on cluster machines whose config may be rolling forward
    /// at once. Zero means unbounded.
    pub max_update_parallelism: usize,
    /// Upper bound on cluster machines torn down at once. Zero means
    /// unbounded.
    pub max_delete_parallelism: usize,
}

impl ResourceSpec for MachineSetSpec {
    const KIND: &'static str = "MachineSets";
}

/// Assignment of a machine into a machine set. The ID is the machine ID;
/// cluster and machine-set labels carry the membership. The creation
/// timestamp orders rolling updates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineSetNodeSpec {}

impl ResourceSpec for MachineSetNodeSpec {
    const KIND: &'static str = "MachineSetNodes";
}

/// Lifecycle phase of a machine set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MachineSetPhase {
    #[default]
    Running,
    ScalingUp,
    ScalingDown,
    Destroying,
}

impl std::fmt::Display for MachineSetPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineSetPhase::Running => write!(f, "running"),
            MachineSetPhase::ScalingUp => write!(f, "scalingUp"),
            MachineSetPhase::ScalingDown => write!(f, "scalingDown"),
            MachineSetPhase::Destroying => write!(f, "destroying"),
        }
    }
}

/// Machine tallies for a machine set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineCounts {
    pub requested: u32,
    pub synced: u32,
    pub connected: u32,
}

/// Observed state of a machine set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineSetStatusSpec {
    pub phase: MachineSetPhase,
    pub ready: bool,
    pub error: String,
    pub machines: MachineCounts,
}

impl ResourceSpec for MachineSetStatusSpec {
    const KIND: &'static str = "MachineSetStatuses";
}

/// The binding of a machine into a cluster; the unit of config rollout.
/// Derived from `MachineSetNode` by the machine-set controller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterMachineSpec {
    /// Kubernetes version the machine joined with. Pinned at creation;
    /// Kubernetes upgrades move it explicitly.
    pub kubernetes_version: String,
}

impl ResourceSpec for ClusterMachineSpec {
    const KIND: &'static str = "ClusterMachines";
}

/// Identity facts for a machine inside its cluster, reported once the node
/// joined Kubernetes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterMachineIdentitySpec {
    pub node_identity: String,
    pub nodename: String,
    pub etcd_member_id: u64,
}

impl ResourceSpec for ClusterMachineIdentitySpec {
    const KIND: &'static str = "ClusterMachineIdentities";
}
