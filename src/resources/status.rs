// SPDX-License-Identifier: MIT OR Apache-2.0

//! Status-aggregation resources.

use crate::resource::{ns, ResourceSpec};
use serde::{Deserialize, Serialize};

/// Outcome of a single health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConditionStatus {
    #[default]
    Unknown,
    Ready,
    NotReady,
}

/// How bad a failed condition is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

/// The checks run against a control-plane machine set, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    WireguardConnection,
    Etcd,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::WireguardConnection => write!(f, "wireguardConnection"),
            ConditionType::Etcd => write!(f, "etcd"),
        }
    }
}

/// One evaluated condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneCondition {
    pub condition: ConditionType,
    pub status: ConditionStatus,
    pub severity: Severity,
    pub reason: String,
}

/// Aggregate health of a control-plane machine set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlPlaneStatusSpec {
    pub conditions: Vec<ControlPlaneCondition>,
}

impl ResourceSpec for ControlPlaneStatusSpec {
    const KIND: &'static str = "ControlPlaneStatuses";
}

/// Result of the last etcd audit for a cluster: the member IDs removed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EtcdAuditResultSpec {
    pub removed_members: Vec<u64>,
}

impl ResourceSpec for EtcdAuditResultSpec {
    const KIND: &'static str = "EtcdAuditResults";
}

/// A request for the discovery service to drop an affiliate. Shared output:
/// written by teardown controllers, consumed and destroyed by the discovery
/// forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryAffiliateDeleteTaskSpec {
    pub cluster_id: String,
    pub affiliate_id: String,
}

impl ResourceSpec for DiscoveryAffiliateDeleteTaskSpec {
    const KIND: &'static str = "DiscoveryAffiliateDeleteTasks";
}

/// What kind of long-running work an `OngoingTask` tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OngoingTaskKind {
    ClusterDestroy,
    TalosUpgrade,
}

/// A user-visible long-running operation, projected into the ephemeral
/// namespace with a stable ID per (kind, cluster).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OngoingTaskSpec {
    pub title: String,
    pub kind: OngoingTaskKind,
    pub cluster_id: String,
}

impl Default for OngoingTaskSpec {
    fn default() -> Self {
        Self {
            title: String::new(),
            kind: OngoingTaskKind::TalosUpgrade,
            cluster_id: String::new(),
        }
    }
}

impl ResourceSpec for OngoingTaskSpec {
    const KIND: &'static str = "OngoingTasks";
    const NAMESPACE: &'static str = ns::EPHEMERAL;
}
