// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cluster-level resources.

use crate::resource::ResourceSpec;
use serde::{Deserialize, Serialize};

/// A user-created cluster. Everything below it is derived.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Desired Talos version for every machine in the cluster.
    pub talos_version: String,
    /// Desired Kubernetes version.
    pub kubernetes_version: String,
}

impl ResourceSpec for ClusterSpec {
    const KIND: &'static str = "Clusters";
}

/// A certificate with its private key, PEM-encoded and base64-wrapped.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CertificatePair {
    pub crt: String,
    pub key: String,
}

/// The immutable PKI and token material of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecretBundle {
    /// Cluster identity: name and the shared cluster secret.
    pub cluster_id: String,
    pub cluster_secret: String,
    pub bootstrap_token: String,
    pub secretbox_encryption_secret: String,
    pub trustd_token: String,
    pub etcd_ca: CertificatePair,
    pub kubernetes_ca: CertificatePair,
    pub os_ca: CertificatePair,
    pub service_account: CertificatePair,
    pub aggregator_ca: CertificatePair,
}

/// Generated on cluster create; never regenerated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterSecretsSpec {
    pub bundle: SecretBundle,
}

impl ResourceSpec for ClusterSecretsSpec {
    const KIND: &'static str = "ClusterSecrets";
}

/// Identity facts derived from the secret bundle plus the set of node
/// identities currently part of the cluster. `node_ids` is kept sorted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterIdentitySpec {
    pub cluster_id: String,
    pub node_ids: Vec<String>,
}

impl ResourceSpec for ClusterIdentitySpec {
    const KIND: &'static str = "ClusterIdentities";
}

/// Where machines reach the cluster's Kubernetes API.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadBalancerConfigSpec {
    pub endpoint: String,
    pub siderolink_endpoint: String,
}

impl ResourceSpec for LoadBalancerConfigSpec {
    const KIND: &'static str = "LoadBalancerConfigs";
}

/// Health of the cluster's load balancer, reported by the LB service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadBalancerStatusSpec {
    pub healthy: bool,
}

impl ResourceSpec for LoadBalancerStatusSpec {
    const KIND: &'static str = "LoadBalancerStatuses";
}

/// The Talos version the cluster was created with. Written once; the
/// config generator keeps using it as the generation contract version even
/// as the cluster upgrades.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterConfigVersionSpec {
    pub version: String,
}

impl ResourceSpec for ClusterConfigVersionSpec {
    const KIND: &'static str = "ClusterConfigVersions";
}

/// Aggregate cluster lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClusterPhase {
    #[default]
    Unknown,
    Scaling,
    Running,
}

/// Aggregated cluster health consumed by the upgrade gate and the UI.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterStatusSpec {
    pub available: bool,
    pub ready: bool,
    pub phase: ClusterPhase,
    pub controlplane_ready: bool,
    pub machines: u32,
    pub healthy_machines: u32,
}

impl ResourceSpec for ClusterStatusSpec {
    const KIND: &'static str = "ClusterStatuses";
}

/// Human-readable progress of a cluster teardown.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterDestroyStatusSpec {
    pub phase: String,
}

impl ResourceSpec for ClusterDestroyStatusSpec {
    const KIND: &'static str = "ClusterDestroyStatuses";
}
