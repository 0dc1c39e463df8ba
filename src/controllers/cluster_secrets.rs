// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cluster secret material and identity projection.
//!
//! `ClusterSecretsController` generates the immutable PKI/token bundle when
//! a cluster appears. `ClusterConfigVersionController` pins the Talos
//! version the cluster was created with; the config generator keeps using
//! that contract version across upgrades. `ClusterIdentityController`
//! projects the bundle plus the live set of node identities into
//! `ClusterIdentity`.

use crate::error::Result;
use crate::patterns::mappers;
use crate::patterns::{QTransform, TransformOutcome};
use crate::resource::{KindRef, LabelQuery, Resource};
use crate::resources::label;
use crate::resources::{
    CertificatePair, ClusterConfigVersionSpec, ClusterIdentitySpec, ClusterMachineIdentitySpec,
    ClusterSecretsSpec, ClusterSpec, SecretBundle,
};
use crate::runtime::{InputBinding, InputMapping, QRuntime};
use async_trait::async_trait;
use base64::prelude::*;

fn random_secret(len: usize) -> String {
    let bytes: Vec<u8> = std::iter::repeat_with(rand::random::<u8>).take(len).collect();
    BASE64_STANDARD.encode(bytes)
}

fn random_token() -> String {
    let id: Vec<u8> = std::iter::repeat_with(rand::random::<u8>).take(3).collect();
    let secret: Vec<u8> = std::iter::repeat_with(rand::random::<u8>).take(8).collect();
    format!("{}.{}", hex::encode(id), hex::encode(secret))
}

fn random_cert_pair() -> CertificatePair {
    CertificatePair {
        crt: random_secret(48),
        key: random_secret(48),
    }
}

/// Generate a fresh secret bundle for a cluster.
#[must_use]
pub fn generate_bundle(cluster_id: &str) -> SecretBundle {
    SecretBundle {
        cluster_id: cluster_id.to_string(),
        cluster_secret: random_secret(32),
        bootstrap_token: random_token(),
        secretbox_encryption_secret: random_secret(32),
        trustd_token: random_token(),
        etcd_ca: random_cert_pair(),
        kubernetes_ca: random_cert_pair(),
        os_ca: random_cert_pair(),
        service_account: random_cert_pair(),
        aggregator_ca: random_cert_pair(),
    }
}

/// `Cluster` → `ClusterSecrets`. The bundle is generated exactly once; an
/// existing bundle is never regenerated.
pub struct ClusterSecretsController;

#[async_trait]
impl QTransform for ClusterSecretsController {
    type Input = ClusterSpec;
    type Output = ClusterSecretsSpec;

    fn name(&self) -> &'static str {
        "ClusterSecretsController"
    }

    async fn transform(
        &self,
        _rt: &QRuntime,
        input: &Resource<ClusterSpec>,
        output: &mut Resource<ClusterSecretsSpec>,
    ) -> Result<TransformOutcome> {
        output
            .metadata
            .labels
            .set(label::CLUSTER, input.id());
        if output.spec.bundle == SecretBundle::default() {
            output.spec.bundle = generate_bundle(input.id());
        }
        Ok(TransformOutcome::Modified)
    }
}

/// `Cluster` → `ClusterConfigVersion`. Pins the initial Talos version; the
/// pinned value never follows later cluster edits.
pub struct ClusterConfigVersionController;

#[async_trait]
impl QTransform for ClusterConfigVersionController {
    type Input = ClusterSpec;
    type Output = ClusterConfigVersionSpec;

    fn name(&self) -> &'static str {
        "ClusterConfigVersionController"
    }

    async fn transform(
        &self,
        _rt: &QRuntime,
        input: &Resource<ClusterSpec>,
        output: &mut Resource<ClusterConfigVersionSpec>,
    ) -> Result<TransformOutcome> {
        if input.spec.talos_version.is_empty() {
            return Ok(TransformOutcome::Skip);
        }
        output.metadata.labels.set(label::CLUSTER, input.id());
        if output.spec.version.is_empty() {
            output.spec.version = input.spec.talos_version.clone();
        }
        Ok(TransformOutcome::Modified)
    }
}

/// `ClusterSecrets` → `ClusterIdentity`, joined with the live set of
/// `ClusterMachineIdentity` resources. Node IDs are kept sorted so the
/// projection is deterministic.
pub struct ClusterIdentityController;

#[async_trait]
impl QTransform for ClusterIdentityController {
    type Input = ClusterSecretsSpec;
    type Output = ClusterIdentitySpec;

    fn name(&self) -> &'static str {
        "ClusterIdentityController"
    }

    fn extra_inputs(&self) -> Vec<InputBinding> {
        vec![InputBinding {
            kind: KindRef::of::<ClusterMachineIdentitySpec>(),
            mapping: InputMapping::Mapped(mappers::by_cluster_label::<ClusterSecretsSpec>()),
        }]
    }

    async fn transform(
        &self,
        rt: &QRuntime,
        input: &Resource<ClusterSecretsSpec>,
        output: &mut Resource<ClusterIdentitySpec>,
    ) -> Result<TransformOutcome> {
        let identities = rt
            .list::<ClusterMachineIdentitySpec>(&LabelQuery::all().eq(label::CLUSTER, input.id()))
            .await?;

        let mut node_ids: Vec<String> = identities
            .into_iter()
            .map(|identity| identity.spec.node_identity)
            .filter(|id| !id.is_empty())
            .collect();
        node_ids.sort();
        node_ids.dedup();

        output.metadata.labels.set(label::CLUSTER, input.id());
        output.spec.cluster_id = input.spec.bundle.cluster_id.clone();
        output.spec.node_ids = node_ids;
        Ok(TransformOutcome::Modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_bundle_is_unique() {
        let a = generate_bundle("c1");
        let b = generate_bundle("c1");
        assert_eq!(a.cluster_id, "c1");
        assert_ne!(a.cluster_secret, b.cluster_secret);
        assert_ne!(a.bootstrap_token, b.bootstrap_token);
        assert_ne!(a.etcd_ca.key, b.etcd_ca.key);
    }

    #[test]
    fn test_bootstrap_token_shape() {
        let token = random_token();
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 6);
        assert_eq!(parts[1].len(), 16);
    }
}
