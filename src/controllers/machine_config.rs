// SPDX-License-Identifier: MIT OR Apache-2.0

//! Machine-config generation.
//!
//! For each `ClusterMachine` the controller joins the cluster, its secret
//! bundle, the load-balancer endpoints, the pinned config-contract version,
//! the per-machine generation options, the patch set and the join
//! parameters into the full Talos machine-config document. The document is
//! compared byte-for-byte against the previous generation and stored
//! zstd-compressed only when it changed. Generation failures land in
//! `generation_error` instead of failing the reconcile, so the status stays
//! observable.

use crate::error::{FleetError, Result};
use crate::patterns::mappers;
use crate::patterns::{QTransform, TransformOutcome};
use crate::resource::{KindRef, LabelQuery, Resource};
use crate::resources::{annotation, label};
use crate::resources::{
    ClusterConfigVersionSpec, ClusterMachineConfigPatchesSpec, ClusterMachineConfigSpec,
    ClusterMachineSpec, ClusterSecretsSpec, ClusterSpec, InstallImage, LoadBalancerConfigSpec,
    MachineConfigGenOptionsSpec, MachineJoinConfigSpec, MachineSetSpec, SecretBundle,
};
use crate::runtime::{InputBinding, InputMapping, QRuntime};
use async_trait::async_trait;
use bytes::Bytes;
use serde_yaml::Value;
use tracing::debug;

const IMAGE_FACTORY_HOST: &str = "factory.talos.dev";
const ZSTD_LEVEL: i32 = 3;

/// Compose the installer image reference for a machine.
#[must_use]
pub fn format_install_image(image: &InstallImage) -> String {
    let installer = if image.secure_boot == Some(true) {
        "installer-secureboot"
    } else {
        "installer"
    };
    format!(
        "{IMAGE_FACTORY_HOST}/{installer}/{}:v{}",
        image.schematic_id, image.talos_version
    )
}

/// Multi-document machine configs exist since Talos 1.5.
#[must_use]
pub fn supports_multidoc(version: &str) -> bool {
    let mut parts = version.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor) >= (1, 5)
}

/// Recursively merge `patch` into `base`: mappings merge per key, anything
/// else replaces.
pub(crate) fn merge_values(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Mapping(base_map), Value::Mapping(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, patch) => *base_slot = patch,
    }
}

fn mapping_path<'a>(root: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
    let mut current = root;
    for key in path {
        current = current.get_mut(*key)?;
    }
    Some(current)
}

/// Drop `os:admin` from the Talos API access feature's allowed roles.
/// The generator never emits it; a patch sneaking it in is silently
/// stripped.
pub(crate) fn strip_talos_api_access_os_admin_role(doc: &mut Value) -> bool {
    let Some(roles) = mapping_path(
        doc,
        &[
            "machine",
            "features",
            "kubernetesTalosAPIAccess",
            "allowedRoles",
        ],
    ) else {
        return false;
    };
    let Some(seq) = roles.as_sequence_mut() else {
        return false;
    };
    let before = seq.len();
    seq.retain(|role| role.as_str() != Some("os:admin"));
    before != seq.len()
}

fn yaml(value: &str) -> Value {
    Value::String(value.to_string())
}

fn cert_pair(pair: &crate::resources::CertificatePair) -> Value {
    let mut map = serde_yaml::Mapping::new();
    map.insert(yaml("crt"), yaml(&pair.crt));
    map.insert(yaml("key"), yaml(&pair.key));
    Value::Mapping(map)
}

/// Everything generation needs, joined by the controller.
pub(crate) struct GenerationInput<'a> {
    pub cluster_id: &'a str,
    pub contract_version: &'a str,
    pub kubernetes_version: &'a str,
    pub is_control_plane: bool,
    pub install_disk: &'a str,
    pub install_image: String,
    pub endpoint: &'a str,
    pub bundle: &'a SecretBundle,
    pub preserve_apid_check_ext_key_usage: bool,
    pub preserve_disk_quota_support: bool,
    pub user_patches: &'a [String],
    pub join_config: Option<&'a str>,
    pub registry_mirrors: &'a [String],
}

/// Build the full document stream. Returns the encoded YAML.
pub(crate) fn generate_config(input: &GenerationInput<'_>) -> Result<String> {
    let machine_type = if input.is_control_plane {
        "controlplane"
    } else {
        "worker"
    };

    let base = format!(
        concat!(
            "version: v1alpha1\n",
            "machine:\n",
            "  type: {machine_type}\n",
            "  token: {trustd_token}\n",
            "  ca:\n",
            "    crt: {os_crt}\n",
            "    key: {os_key}\n",
            "  kubelet:\n",
            "    image: ghcr.io/siderolabs/kubelet:v{kubernetes_version}\n",
            "  install:\n",
            "    disk: {install_disk}\n",
            "    image: {install_image}\n",
            "    wipe: false\n",
            "  features:\n",
            "    kubernetesTalosAPIAccess:\n",
            "      enabled: true\n",
            "      allowedRoles:\n",
            "        - os:reader\n",
            "      allowedKubernetesNamespaces:\n",
            "        - kube-system\n",
            "cluster:\n",
            "  id: {cluster_id}\n",
            "  secret: {cluster_secret}\n",
            "  clusterName: {cluster_name}\n",
            "  controlPlane:\n",
            "    endpoint: {endpoint}\n",
            "  token: {bootstrap_token}\n",
            "  secretboxEncryptionSecret: {secretbox}\n",
            "  ca:\n",
            "    crt: {k8s_crt}\n",
            "    key: {k8s_key}\n",
        ),
        machine_type = machine_type,
        trustd_token = input.bundle.trustd_token,
        os_crt = input.bundle.os_ca.crt,
        os_key = input.bundle.os_ca.key,
        kubernetes_version = input.kubernetes_version,
        install_disk = input.install_disk,
        install_image = input.install_image,
        cluster_id = input.bundle.cluster_id,
        cluster_secret = input.bundle.cluster_secret,
        cluster_name = input.cluster_id,
        endpoint = input.endpoint,
        bootstrap_token = input.bundle.bootstrap_token,
        secretbox = input.bundle.secretbox_encryption_secret,
        k8s_crt = input.bundle.kubernetes_ca.crt,
        k8s_key = input.bundle.kubernetes_ca.key,
    );

    let mut doc: Value = serde_yaml::from_str(&base)
        .map_err(|err| FleetError::Generation(format!("base document: {err}")))?;

    if input.is_control_plane {
        let cluster = mapping_path(&mut doc, &["cluster"])
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| FleetError::Generation("cluster section missing".into()))?;
        cluster.insert(yaml("etcd"), {
            let mut etcd = serde_yaml::Mapping::new();
            etcd.insert(yaml("ca"), cert_pair(&input.bundle.etcd_ca));
            Value::Mapping(etcd)
        });
        cluster.insert(yaml("aggregatorCA"), cert_pair(&input.bundle.aggregator_ca));
        cluster.insert(
            yaml("serviceAccount"),
            cert_pair(&input.bundle.service_account),
        );
    }

    if !input.registry_mirrors.is_empty() {
        let machine = mapping_path(&mut doc, &["machine"])
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| FleetError::Generation("machine section missing".into()))?;
        let mut endpoints = serde_yaml::Mapping::new();
        endpoints.insert(
            yaml("endpoints"),
            Value::Sequence(input.registry_mirrors.iter().map(|m| yaml(m)).collect()),
        );
        let mut mirrors = serde_yaml::Mapping::new();
        mirrors.insert(yaml("docker.io"), Value::Mapping(endpoints));
        let mut registries = serde_yaml::Mapping::new();
        registries.insert(yaml("mirrors"), Value::Mapping(mirrors));
        machine.insert(yaml("registries"), Value::Mapping(registries));
    }

    // Compatibility patches first, then user patches, in order.
    if input.preserve_apid_check_ext_key_usage {
        merge_values(
            &mut doc,
            serde_yaml::from_str("machine:\n  features:\n    apidCheckExtKeyUsage: true\n")
                .expect("static patch"),
        );
    }
    if input.preserve_disk_quota_support {
        merge_values(
            &mut doc,
            serde_yaml::from_str("machine:\n  features:\n    diskQuotaSupport: true\n")
                .expect("static patch"),
        );
    }

    for (index, patch) in input.user_patches.iter().enumerate() {
        let value: Value = serde_yaml::from_str(patch)
            .map_err(|err| FleetError::Generation(format!("patch {index}: {err}")))?;
        if !value.is_mapping() && !value.is_null() {
            return Err(FleetError::Generation(format!(
                "patch {index}: not a mapping"
            )));
        }
        merge_values(&mut doc, value);
    }

    if strip_talos_api_access_os_admin_role(&mut doc) {
        debug!("stripped os:admin from Talos API access roles");
    }

    let mut encoded = serde_yaml::to_string(&doc)
        .map_err(|err| FleetError::Generation(format!("encode: {err}")))?;

    // The join document rides along only on contracts with multi-document
    // support.
    if let Some(join_config) = input.join_config {
        if supports_multidoc(input.contract_version) && !join_config.is_empty() {
            encoded.push_str("---\n");
            encoded.push_str(join_config);
            if !join_config.ends_with('\n') {
                encoded.push('\n');
            }
        }
    }

    Ok(encoded)
}

/// Compress an encoded document for storage.
pub fn compress_config(data: &str) -> Result<Bytes> {
    zstd::bulk::compress(data.as_bytes(), ZSTD_LEVEL)
        .map(Bytes::from)
        .map_err(|err| FleetError::Generation(format!("compress: {err}")))
}

/// Recover the encoded document from storage.
pub fn decompress_config(data: &[u8]) -> Result<String> {
    let raw = zstd::bulk::decompress(data, 16 << 20)
        .map_err(|err| FleetError::Generation(format!("decompress: {err}")))?;
    String::from_utf8(raw).map_err(|err| FleetError::Generation(format!("decode: {err}")))
}

/// `ClusterMachine` → `ClusterMachineConfig`.
pub struct MachineConfigController {
    registry_mirrors: Vec<String>,
}

impl MachineConfigController {
    #[must_use]
    pub fn new(registry_mirrors: Vec<String>) -> Self {
        Self { registry_mirrors }
    }
}

impl Default for MachineConfigController {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl QTransform for MachineConfigController {
    type Input = ClusterMachineSpec;
    type Output = ClusterMachineConfigSpec;

    fn name(&self) -> &'static str {
        "MachineConfigController"
    }

    fn concurrency(&self) -> usize {
        4
    }

    fn extra_inputs(&self) -> Vec<InputBinding> {
        vec![
            InputBinding {
                kind: KindRef::of::<ClusterSpec>(),
                mapping: InputMapping::Mapped(mappers::cluster_to_members::<ClusterMachineSpec>()),
            },
            InputBinding {
                kind: KindRef::of::<ClusterSecretsSpec>(),
                mapping: InputMapping::Mapped(mappers::cluster_to_members::<ClusterMachineSpec>()),
            },
            InputBinding {
                kind: KindRef::of::<LoadBalancerConfigSpec>(),
                mapping: InputMapping::Mapped(mappers::cluster_to_members::<ClusterMachineSpec>()),
            },
            InputBinding {
                kind: KindRef::of::<ClusterConfigVersionSpec>(),
                mapping: InputMapping::Mapped(mappers::cluster_to_members::<ClusterMachineSpec>()),
            },
            InputBinding {
                kind: KindRef::of::<ClusterMachineConfigPatchesSpec>(),
                mapping: InputMapping::Mapped(mappers::same_id::<ClusterMachineSpec>()),
            },
            InputBinding {
                kind: KindRef::of::<MachineConfigGenOptionsSpec>(),
                mapping: InputMapping::Mapped(mappers::same_id::<ClusterMachineSpec>()),
            },
            InputBinding {
                kind: KindRef::of::<MachineJoinConfigSpec>(),
                mapping: InputMapping::Mapped(mappers::same_id::<ClusterMachineSpec>()),
            },
            InputBinding {
                kind: KindRef::of::<MachineSetSpec>(),
                mapping: InputMapping::Mapped(mappers::select::<ClusterMachineSpec>(|md| {
                    Some(LabelQuery::all().eq(label::MACHINE_SET, &md.id))
                })),
            },
        ]
    }

    async fn transform(
        &self,
        rt: &QRuntime,
        input: &Resource<ClusterMachineSpec>,
        output: &mut Resource<ClusterMachineConfigSpec>,
    ) -> Result<TransformOutcome> {
        let Some(cluster_id) = input.metadata.labels.get(label::CLUSTER).map(String::from)
        else {
            return Ok(TransformOutcome::Skip);
        };

        let Some(machine_set_id) = input.metadata.labels.get(label::MACHINE_SET) else {
            return Ok(TransformOutcome::Skip);
        };
        let Some(machine_set) = rt.get::<MachineSetSpec>(machine_set_id).await? else {
            return Ok(TransformOutcome::Skip);
        };
        if machine_set.metadata.is_tearing_down() {
            return Ok(TransformOutcome::Skip);
        }

        let Some(_cluster) = rt.get::<ClusterSpec>(&cluster_id).await? else {
            return Ok(TransformOutcome::Skip);
        };
        let Some(secrets) = rt.get::<ClusterSecretsSpec>(&cluster_id).await? else {
            return Ok(TransformOutcome::Skip);
        };
        let Some(lb_config) = rt.get::<LoadBalancerConfigSpec>(&cluster_id).await? else {
            return Ok(TransformOutcome::Skip);
        };
        let Some(contract) = rt.get::<ClusterConfigVersionSpec>(&cluster_id).await? else {
            return Ok(TransformOutcome::Skip);
        };
        if contract.spec.version.is_empty() {
            return Ok(TransformOutcome::Skip);
        }
        if input.spec.kubernetes_version.is_empty() {
            return Ok(TransformOutcome::Skip);
        }

        let Some(gen_options) = rt.get::<MachineConfigGenOptionsSpec>(input.id()).await? else {
            return Ok(TransformOutcome::Skip);
        };
        let Some(install_image) = &gen_options.spec.install_image else {
            return Ok(TransformOutcome::Skip);
        };
        if !install_image.schematic_initialized {
            return Ok(TransformOutcome::Skip);
        }
        if install_image.secure_boot.is_none() {
            return Ok(TransformOutcome::Skip);
        }

        let patches = rt
            .get::<ClusterMachineConfigPatchesSpec>(input.id())
            .await?
            .map(|res| res.spec.patches)
            .unwrap_or_default();
        let join_config = rt
            .get::<MachineJoinConfigSpec>(input.id())
            .await?
            .map(|res| res.spec.config);

        output.metadata.labels.set(label::CLUSTER, &cluster_id);
        output
            .metadata
            .labels
            .set(label::MACHINE_SET, machine_set_id);

        let generation_input = GenerationInput {
            cluster_id: &cluster_id,
            contract_version: &contract.spec.version,
            kubernetes_version: &input.spec.kubernetes_version,
            is_control_plane: input.metadata.labels.contains(label::ROLE_CONTROLPLANE),
            install_disk: &gen_options.spec.install_disk,
            install_image: format_install_image(install_image),
            endpoint: &lb_config.spec.endpoint,
            bundle: &secrets.spec.bundle,
            preserve_apid_check_ext_key_usage: input
                .metadata
                .annotations
                .contains(annotation::PRESERVE_APID_CHECK_EXT_KEY_USAGE),
            preserve_disk_quota_support: input
                .metadata
                .annotations
                .contains(annotation::PRESERVE_DISK_QUOTA_SUPPORT),
            user_patches: &patches,
            join_config: join_config.as_deref(),
            registry_mirrors: &self.registry_mirrors,
        };

        let encoded = match generate_config(&generation_input) {
            Ok(encoded) => encoded,
            Err(FleetError::Generation(message)) => {
                // Surface the failure on the output; the document keeps its
                // last good value.
                output.spec.generation_error = message;
                return Ok(TransformOutcome::Modified);
            }
            Err(err) => return Err(err),
        };

        if !output.spec.data.is_empty() {
            let previous = decompress_config(&output.spec.data)?;
            if previous == encoded && output.spec.generation_error.is_empty() {
                return Ok(TransformOutcome::Skip);
            }
        }

        output.spec.data = compress_config(&encoded)?;
        output.spec.cluster_machine_version = input.metadata.version;
        output.spec.generation_error.clear();
        Ok(TransformOutcome::Modified)
    }
}
