// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end lifecycle scenarios driven through the full controller graph
//! over the in-memory store, with mocked Talos / image-factory / discovery
//! / Kubernetes edges.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use talos_fleet_rs::clients::{
    DiscoveryClient, EtcdMember, ImageFactoryClient, KubernetesClient, KubernetesClientFactory,
    MachineClient, MachineClientFactory, MachineStatusSample, ServiceInfo, TalosClientSpec,
    WipeMode,
};
use talos_fleet_rs::config::FleetSettings;
use talos_fleet_rs::controllers::{self, ExternalClients};
use talos_fleet_rs::resource::{LabelQuery, Phase, Resource, ResourcePointer, ResourceSpec};
use talos_fleet_rs::resources::{
    annotation, control_plane_machine_set_id, label, BlockDevice, ClusterDestroyStatusSpec,
    ClusterIdentitySpec, ClusterMachineConfigPatchesSpec, ClusterMachineConfigStatusSpec,
    ClusterMachineIdentitySpec, ClusterMachineSpec, ClusterMachineTalosVersionSpec,
    ClusterSecretsSpec, ClusterSpec, ConfigPatchSpec, EtcdAuditResultSpec, HardwareStatus,
    LoadBalancerStatusSpec, MachineSetNodeSpec, MachineSetPhase, MachineSetSpec,
    MachineSetStatusSpec, MachineSpec, MachineStatusSpec, RedactedClusterMachineConfigSpec,
    SchematicInfo, SecurityState, TalosConfigSpec, TalosUpgradeStatusSpec, UpgradePhase,
};
use talos_fleet_rs::runtime::{ControllerRuntime, ExponentialBackoff, RunningRuntime};
use talos_fleet_rs::store::{MemoryStore, Store, StoreExt};

// ---------------------------------------------------------------------------
// Mock edges
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FleetState {
    // endpoint -> applied config documents
    applied: Mutex<HashMap<String, Vec<String>>>,
    resets: Mutex<Vec<String>>,
    etcd_members: Mutex<Vec<EtcdMember>>,
    removed_members: Mutex<Vec<u64>>,
    // affiliates present on the discovery service
    affiliates: Mutex<Vec<String>>,
    deleted_affiliates: Mutex<Vec<String>>,
    deleted_nodes: Mutex<Vec<String>>,
    ensured_schematics: Mutex<Vec<String>>,
}

struct MockMachineClient {
    endpoint: String,
    state: Arc<FleetState>,
}

#[async_trait]
impl MachineClient for MockMachineClient {
    async fn version(&self) -> talos_fleet_rs::Result<String> {
        Ok("1.7.5".to_string())
    }

    async fn apply_configuration(&self, data: Bytes) -> talos_fleet_rs::Result<()> {
        let text = String::from_utf8_lossy(&data).to_string();
        self.state
            .applied
            .lock()
            .unwrap()
            .entry(self.endpoint.clone())
            .or_default()
            .push(text);
        Ok(())
    }

    async fn bootstrap(&self) -> talos_fleet_rs::Result<()> {
        Ok(())
    }

    async fn reset(
        &self,
        _graceful: bool,
        _reboot: bool,
        _wipe: WipeMode,
    ) -> talos_fleet_rs::Result<()> {
        self.state.resets.lock().unwrap().push(self.endpoint.clone());
        Ok(())
    }

    async fn disks(&self) -> talos_fleet_rs::Result<Vec<BlockDevice>> {
        Ok(vec![system_disk()])
    }

    async fn service_list(&self) -> talos_fleet_rs::Result<Vec<ServiceInfo>> {
        Ok(Vec::new())
    }

    async fn etcd_member_list(&self) -> talos_fleet_rs::Result<Vec<EtcdMember>> {
        Ok(self.state.etcd_members.lock().unwrap().clone())
    }

    async fn etcd_remove_member_by_id(&self, member_id: u64) -> talos_fleet_rs::Result<()> {
        self.state.removed_members.lock().unwrap().push(member_id);
        self.state
            .etcd_members
            .lock()
            .unwrap()
            .retain(|member| member.id != member_id);
        Ok(())
    }

    async fn etcd_forfeit_leadership(&self) -> talos_fleet_rs::Result<()> {
        Ok(())
    }

    async fn etcd_leave_cluster(&self) -> talos_fleet_rs::Result<()> {
        Ok(())
    }

    async fn meta_write(&self, _key: u8, _value: Bytes) -> talos_fleet_rs::Result<()> {
        Ok(())
    }

    async fn meta_delete(&self, _key: u8) -> talos_fleet_rs::Result<()> {
        Ok(())
    }

    async fn list_files(&self, _path: &str) -> talos_fleet_rs::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn watch_status(
        &self,
        cancel: CancellationToken,
    ) -> talos_fleet_rs::Result<mpsc::Receiver<MachineStatusSample>> {
        let (tx, rx) = mpsc::channel(4);
        let sample = MachineStatusSample {
            talos_version: "1.7.5".to_string(),
            schematic: Some(SchematicInfo {
                id: "initial-schematic".to_string(),
                ..Default::default()
            }),
            hardware: Some(HardwareStatus {
                processors: 4,
                memory_bytes: 8 << 30,
                blockdevices: vec![system_disk()],
            }),
            security_state: Some(SecurityState { secure_boot: false }),
            reporting_events: true,
            ..Default::default()
        };
        tokio::spawn(async move {
            let _ = tx.send(sample).await;
            cancel.cancelled().await;
        });
        Ok(rx)
    }
}

struct MockFactory {
    state: Arc<FleetState>,
}

#[async_trait]
impl MachineClientFactory for MockFactory {
    async fn open(
        &self,
        spec: &TalosClientSpec,
    ) -> talos_fleet_rs::Result<Arc<dyn MachineClient>> {
        Ok(Arc::new(MockMachineClient {
            endpoint: spec.endpoint.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockImageFactory {
    state: Arc<FleetState>,
}

#[async_trait]
impl ImageFactoryClient for MockImageFactory {
    async fn ensure_schematic(&self, schematic_id: &str) -> talos_fleet_rs::Result<String> {
        self.state
            .ensured_schematics
            .lock()
            .unwrap()
            .push(schematic_id.to_string());
        Ok(schematic_id.to_string())
    }
}

struct MockDiscovery {
    state: Arc<FleetState>,
}

#[async_trait]
impl DiscoveryClient for MockDiscovery {
    async fn list_affiliates(&self, _cluster_id: &str) -> talos_fleet_rs::Result<Vec<String>> {
        Ok(self.state.affiliates.lock().unwrap().clone())
    }

    async fn delete_affiliate(
        &self,
        _cluster_id: &str,
        affiliate_id: &str,
    ) -> talos_fleet_rs::Result<()> {
        self.state
            .deleted_affiliates
            .lock()
            .unwrap()
            .push(affiliate_id.to_string());
        self.state
            .affiliates
            .lock()
            .unwrap()
            .retain(|affiliate| affiliate != affiliate_id);
        Ok(())
    }
}

struct MockKubernetes {
    state: Arc<FleetState>,
}

#[async_trait]
impl KubernetesClient for MockKubernetes {
    async fn delete_node(&self, name: &str) -> talos_fleet_rs::Result<()> {
        self.state.deleted_nodes.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

struct MockKubernetesFactory {
    state: Arc<FleetState>,
}

#[async_trait]
impl KubernetesClientFactory for MockKubernetesFactory {
    async fn client_for(
        &self,
        _cluster_id: &str,
    ) -> talos_fleet_rs::Result<Arc<dyn KubernetesClient>> {
        Ok(Arc::new(MockKubernetes {
            state: Arc::clone(&self.state),
        }))
    }
}

fn system_disk() -> BlockDevice {
    BlockDevice {
        linux_name: "/dev/sda".to_string(),
        size: 500 << 30,
        system_disk: true,
        transport: "sata".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    store: Arc<dyn Store>,
    state: Arc<FleetState>,
    running: RunningRuntime,
}

impl Fixture {
    async fn start(settings: FleetSettings) -> Self {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = Arc::new(FleetState::default());
        let clients = ExternalClients {
            machine_factory: Arc::new(MockFactory {
                state: Arc::clone(&state),
            }),
            image_factory: Arc::new(MockImageFactory {
                state: Arc::clone(&state),
            }),
            discovery: Arc::new(MockDiscovery {
                state: Arc::clone(&state),
            }),
            kubernetes: Arc::new(MockKubernetesFactory {
                state: Arc::clone(&state),
            }),
        };

        let mut runtime = ControllerRuntime::new(Arc::clone(&store)).with_backoff(
            ExponentialBackoff::new(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(200)),
        );
        controllers::register_all(&mut runtime, &clients, &settings);
        let running = runtime.start().expect("runtime starts");

        Self {
            store,
            state,
            running,
        }
    }

    async fn create<S: ResourceSpec>(&self, res: Resource<S>) {
        self.store.create(res.into_dyn()).await.expect("create");
    }

    async fn create_cluster(&self, cluster_id: &str, talos: &str, kubernetes: &str) {
        self.create(Resource::new(
            cluster_id,
            ClusterSpec {
                talos_version: talos.to_string(),
                kubernetes_version: kubernetes.to_string(),
            },
        ))
        .await;
        self.create(Resource::new(
            cluster_id,
            LoadBalancerStatusSpec { healthy: true },
        ))
        .await;
    }

    async fn create_machine_set(&self, cluster_id: &str, set_id: &str, control_plane: bool) {
        let mut set = Resource::new(set_id, MachineSetSpec::default());
        set.metadata.labels.set(label::CLUSTER, cluster_id);
        if control_plane {
            set.metadata.labels.set(label::ROLE_CONTROLPLANE, "");
        } else {
            set.metadata.labels.set(label::ROLE_WORKER, "");
        }
        self.create(set).await;
    }

    async fn create_member(&self, cluster_id: &str, set_id: &str, machine_id: &str) {
        self.create(Resource::new(
            machine_id,
            MachineSpec {
                management_address: format!("10.0.0.{}", machine_id.len()),
                connected: true,
            },
        ))
        .await;

        let mut node = Resource::new(machine_id, MachineSetNodeSpec::default());
        node.metadata.labels.set(label::CLUSTER, cluster_id);
        node.metadata.labels.set(label::MACHINE_SET, set_id);
        self.create(node).await;

        // Creation stamps order rolling updates; keep them distinct.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    async fn shutdown(self) {
        self.running.shutdown().await;
    }
}

async fn eventually<F, Fut>(timeout: Duration, check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn quiet_settings() -> FleetSettings {
    // Audits far in the future so they do not interfere with scenarios that
    // do not exercise them.
    FleetSettings::builder()
        .audit_interval(Duration::from_secs(3600))
        .diff_cleanup_interval(Duration::from_secs(3600))
        .build()
}

// ---------------------------------------------------------------------------
// S1: cluster identity projection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cluster_identity_sorted_node_ids() {
    let fixture = Fixture::start(quiet_settings()).await;
    fixture.create_cluster("c1", "1.7.5", "1.30.2").await;

    let store = &fixture.store;
    eventually(Duration::from_secs(5), || async move {
        store.get_typed::<ClusterSecretsSpec>("c1").await.unwrap().is_some()
    })
    .await;

    let bundle = store
        .get_typed::<ClusterSecretsSpec>("c1")
        .await
        .unwrap()
        .unwrap()
        .spec
        .bundle;

    let expected_cluster_id = bundle.cluster_id.clone();
    eventually(Duration::from_secs(5), || {
        let expected = expected_cluster_id.clone();
        async move {
            store
                .get_typed::<ClusterIdentitySpec>("c1")
                .await
                .unwrap()
                .is_some_and(|identity| identity.spec.cluster_id == expected)
        }
    })
    .await;

    // Node identities arrive out of order; the projection sorts them.
    for (machine, node_identity) in [("m-b", "bbb"), ("m-a", "aaa")] {
        let mut identity = Resource::new(
            machine,
            ClusterMachineIdentitySpec {
                node_identity: node_identity.to_string(),
                nodename: format!("node-{machine}"),
                etcd_member_id: 0,
            },
        );
        identity.metadata.labels.set(label::CLUSTER, "c1");
        fixture.create(identity).await;
    }

    eventually(Duration::from_secs(5), || async move {
        store
            .get_typed::<ClusterIdentitySpec>("c1")
            .await
            .unwrap()
            .is_some_and(|identity| identity.spec.node_ids == vec!["aaa", "bbb"])
    })
    .await;

    fixture.shutdown().await;
}

// ---------------------------------------------------------------------------
// S2: machine-set scale-down with held finalizers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_machine_set_scale_down_waits_for_finalizers() {
    let fixture = Fixture::start(quiet_settings()).await;
    fixture.create_cluster("c1", "1.7.5", "1.30.2").await;

    let set_id = "c1-scale-down";
    let mut set = Resource::new(
        set_id,
        MachineSetSpec {
            max_update_parallelism: 0,
            max_delete_parallelism: 3,
        },
    );
    set.metadata.labels.set(label::CLUSTER, "c1");
    set.metadata.labels.set(label::ROLE_WORKER, "");
    fixture.create(set).await;

    for machine in ["sd-1", "sd-2", "sd-3"] {
        fixture.create_member("c1", set_id, machine).await;
    }

    let store = &fixture.store;
    eventually(Duration::from_secs(5), || async move {
        store
            .list_typed::<ClusterMachineSpec>(&LabelQuery::all().eq(label::MACHINE_SET, set_id))
            .await
            .unwrap()
            .len()
            == 3
    })
    .await;

    // Hold every cluster machine with a test finalizer.
    for machine in ["sd-1", "sd-2", "sd-3"] {
        store
            .add_finalizer(
                &ResourcePointer::new::<ClusterMachineSpec>(machine),
                "test-holder",
            )
            .await
            .unwrap();
    }

    // Delete all three members at once.
    for machine in ["sd-1", "sd-2", "sd-3"] {
        store
            .teardown(&ResourcePointer::new::<MachineSetNodeSpec>(machine), "")
            .await
            .unwrap();
    }

    // All three enter TearingDown together (delete parallelism is 3)...
    eventually(Duration::from_secs(5), || async move {
        let machines = store
            .list_typed::<ClusterMachineSpec>(&LabelQuery::all().eq(label::MACHINE_SET, set_id))
            .await
            .unwrap();
        machines.len() == 3
            && machines
                .iter()
                .all(|machine| machine.metadata.phase == Phase::TearingDown)
    })
    .await;

    // ...but none is destroyed while the finalizer is held.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let machines = store
        .list_typed::<ClusterMachineSpec>(&LabelQuery::all().eq(label::MACHINE_SET, set_id))
        .await
        .unwrap();
    assert_eq!(machines.len(), 3);

    for machine in ["sd-1", "sd-2", "sd-3"] {
        store
            .remove_finalizer(
                &ResourcePointer::new::<ClusterMachineSpec>(machine),
                "test-holder",
            )
            .await
            .unwrap();
    }

    eventually(Duration::from_secs(10), || async move {
        store
            .list_typed::<ClusterMachineSpec>(&LabelQuery::all().eq(label::MACHINE_SET, set_id))
            .await
            .unwrap()
            .is_empty()
    })
    .await;

    eventually(Duration::from_secs(5), || async move {
        store
            .get_typed::<MachineSetStatusSpec>(set_id)
            .await
            .unwrap()
            .is_some_and(|status| status.spec.phase == MachineSetPhase::Running)
    })
    .await;

    fixture.shutdown().await;
}

// ---------------------------------------------------------------------------
// S3: rolling upgrade ordering, locks
// ---------------------------------------------------------------------------

async fn wait_for_upgrade_done(fixture: &Fixture, cluster: &str, version: &str) {
    let store = &fixture.store;
    let version = version.to_string();
    eventually(Duration::from_secs(30), || {
        let version = version.clone();
        async move {
            store
                .get_typed::<TalosUpgradeStatusSpec>(cluster)
                .await
                .unwrap()
                .is_some_and(|status| {
                    status.spec.phase == UpgradePhase::Done
                        && status.spec.last_upgrade_version == version
                })
        }
    })
    .await;
}

#[tokio::test]
async fn test_upgrade_control_plane_before_workers() {
    let fixture = Fixture::start(quiet_settings()).await;
    fixture.create_cluster("c1", "1.7.5", "1.30.2").await;

    let cp_set = control_plane_machine_set_id("c1");
    fixture.create_machine_set("c1", &cp_set, true).await;
    fixture.create_machine_set("c1", "c1-workers", false).await;

    let cp_machines = ["m-cp-1", "m-cp-2", "m-cp-3"];
    let workers = ["m-w-1", "m-w-2"];
    for machine in cp_machines {
        fixture.create_member("c1", &cp_set, machine).await;
    }
    for machine in workers {
        fixture.create_member("c1", "c1-workers", machine).await;
    }

    // Initial rollout converges at 1.7.5.
    wait_for_upgrade_done(&fixture, "c1", "1.7.5").await;

    let store = &fixture.store;
    store
        .modify::<ClusterSpec, _>("", "c1", |cluster| {
            cluster.spec.talos_version = "1.7.6".to_string();
            Ok(())
        })
        .await
        .unwrap();

    // While converging: no worker may be ahead of any control-plane
    // machine's applied config.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let worker_advanced = {
            let mut advanced = false;
            for machine in workers {
                if store
                    .get_typed::<ClusterMachineTalosVersionSpec>(machine)
                    .await
                    .unwrap()
                    .is_some_and(|v| v.spec.talos_version == "1.7.6")
                {
                    advanced = true;
                }
            }
            advanced
        };
        if worker_advanced {
            for machine in cp_machines {
                let status = store
                    .get_typed::<ClusterMachineConfigStatusSpec>(machine)
                    .await
                    .unwrap()
                    .expect("control plane status present");
                assert_eq!(
                    status.spec.talos_version, "1.7.6",
                    "worker advanced before control plane machine {machine}"
                );
            }
        }

        let done = store
            .get_typed::<TalosUpgradeStatusSpec>("c1")
            .await
            .unwrap()
            .is_some_and(|status| {
                status.spec.phase == UpgradePhase::Done
                    && status.spec.last_upgrade_version == "1.7.6"
            });
        if done {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "upgrade did not converge"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for machine in cp_machines.iter().chain(workers.iter()) {
        let version = store
            .get_typed::<ClusterMachineTalosVersionSpec>(machine)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version.spec.talos_version, "1.7.6");
    }

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_upgrade_pauses_on_locked_machine() {
    let fixture = Fixture::start(quiet_settings()).await;
    fixture.create_cluster("c1", "1.7.5", "1.30.2").await;

    let cp_set = control_plane_machine_set_id("c1");
    fixture.create_machine_set("c1", &cp_set, true).await;
    for machine in ["m-cp-1", "m-cp-2"] {
        fixture.create_member("c1", &cp_set, machine).await;
    }
    wait_for_upgrade_done(&fixture, "c1", "1.7.5").await;

    let store = &fixture.store;
    // Lock the oldest member, then ask for an upgrade.
    store
        .modify::<MachineSetNodeSpec, _>("", "m-cp-1", |node| {
            node.metadata.annotations.set(annotation::MACHINE_LOCKED, "");
            Ok(())
        })
        .await
        .unwrap();
    store
        .modify::<ClusterSpec, _>("", "c1", |cluster| {
            cluster.spec.talos_version = "1.7.6".to_string();
            Ok(())
        })
        .await
        .unwrap();

    eventually(Duration::from_secs(10), || async move {
        store
            .get_typed::<TalosUpgradeStatusSpec>("c1")
            .await
            .unwrap()
            .is_some_and(|status| {
                status.spec.step == "waiting for the machine m-cp-1 to be unlocked"
            })
    })
    .await;

    // Nothing advances while the lock is held.
    tokio::time::sleep(Duration::from_millis(300)).await;
    for machine in ["m-cp-1", "m-cp-2"] {
        let version = store
            .get_typed::<ClusterMachineTalosVersionSpec>(machine)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version.spec.talos_version, "1.7.5", "machine {machine} advanced");
    }

    // Unlock: the upgrade finishes.
    store
        .modify::<MachineSetNodeSpec, _>("", "m-cp-1", |node| {
            node.metadata.annotations.remove(annotation::MACHINE_LOCKED);
            Ok(())
        })
        .await
        .unwrap();
    wait_for_upgrade_done(&fixture, "c1", "1.7.6").await;

    fixture.shutdown().await;
}

// ---------------------------------------------------------------------------
// Rolling patch updates honor MaxParallelism
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_patch_rollout_respects_max_parallelism() {
    let fixture = Fixture::start(quiet_settings()).await;
    fixture.create_cluster("c1", "1.7.5", "1.30.2").await;

    let set_id = "c1-limited";
    let mut set = Resource::new(
        set_id,
        MachineSetSpec {
            max_update_parallelism: 1,
            max_delete_parallelism: 0,
        },
    );
    set.metadata.labels.set(label::CLUSTER, "c1");
    set.metadata.labels.set(label::ROLE_WORKER, "");
    fixture.create(set).await;

    let machines = ["mp-1", "mp-2", "mp-3"];
    for machine in machines {
        fixture.create_member("c1", set_id, machine).await;
    }

    let store = &fixture.store;
    eventually(Duration::from_secs(10), || async move {
        let mut synced = 0;
        for machine in machines {
            let patches_sha = store
                .get_typed::<ClusterMachineConfigPatchesSpec>(machine)
                .await
                .unwrap()
                .map(|p| p.spec.sha256());
            let status_sha = store
                .get_typed::<ClusterMachineConfigStatusSpec>(machine)
                .await
                .unwrap()
                .map(|s| s.spec.cluster_machine_config_sha256.clone());
            if patches_sha.is_some() && patches_sha == status_sha {
                synced += 1;
            }
        }
        synced == machines.len()
    })
    .await;

    // Cut the machines off so the in-flight window stays observable.
    for machine in machines {
        store
            .modify::<MachineSpec, _>("", machine, |res| {
                res.spec.connected = false;
                Ok(())
            })
            .await
            .unwrap();
    }

    // A new cluster-wide patch makes all three machines stale at once.
    let mut patch = Resource::new(
        "all-machines",
        ConfigPatchSpec {
            data: "machine:\n  network:\n    hostname: patched\n".to_string(),
        },
    );
    patch.metadata.labels.set(label::CLUSTER, "c1");
    fixture.create(patch).await;

    // Exactly one machine's patch snapshot may move ahead of its config
    // status while the others wait.
    eventually(Duration::from_secs(10), || async move {
        let mut advanced = 0;
        for machine in machines {
            let patches = store
                .get_typed::<ClusterMachineConfigPatchesSpec>(machine)
                .await
                .unwrap()
                .unwrap();
            if !patches.spec.patches.is_empty() {
                advanced += 1;
            }
        }
        advanced == 1
    })
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut advanced = 0;
    for machine in machines {
        let patches = store
            .get_typed::<ClusterMachineConfigPatchesSpec>(machine)
            .await
            .unwrap()
            .unwrap();
        if !patches.spec.patches.is_empty() {
            advanced += 1;
        }
    }
    assert_eq!(advanced, 1, "parallelism budget exceeded");

    // Reconnect: the rollout completes machine by machine.
    for machine in machines {
        store
            .modify::<MachineSpec, _>("", machine, |res| {
                res.spec.connected = true;
                Ok(())
            })
            .await
            .unwrap();
    }
    eventually(Duration::from_secs(15), || async move {
        let mut done = 0;
        for machine in machines {
            let patches = store
                .get_typed::<ClusterMachineConfigPatchesSpec>(machine)
                .await
                .unwrap()
                .unwrap();
            let status = store
                .get_typed::<ClusterMachineConfigStatusSpec>(machine)
                .await
                .unwrap()
                .unwrap();
            if !patches.spec.patches.is_empty()
                && status.spec.cluster_machine_config_sha256 == patches.spec.sha256()
            {
                done += 1;
            }
        }
        done == machines.len()
    })
    .await;

    fixture.shutdown().await;
}

// ---------------------------------------------------------------------------
// Cluster lock blocks deletions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cluster_lock_blocks_deletion() {
    let fixture = Fixture::start(quiet_settings()).await;
    fixture.create_cluster("c1", "1.7.5", "1.30.2").await;
    fixture.create_machine_set("c1", "c1-workers", false).await;
    fixture.create_member("c1", "c1-workers", "lk-1").await;

    let store = &fixture.store;
    eventually(Duration::from_secs(5), || async move {
        store
            .get_typed::<ClusterMachineSpec>("lk-1")
            .await
            .unwrap()
            .is_some()
    })
    .await;

    store
        .modify::<ClusterSpec, _>("", "c1", |cluster| {
            cluster
                .metadata
                .annotations
                .set(annotation::CLUSTER_LOCKED, "");
            Ok(())
        })
        .await
        .unwrap();
    store
        .teardown(&ResourcePointer::new::<MachineSetNodeSpec>("lk-1"), "")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let machine = store
        .get_typed::<ClusterMachineSpec>("lk-1")
        .await
        .unwrap()
        .expect("cluster machine survives while locked");
    assert_eq!(machine.metadata.phase, Phase::Running);

    store
        .modify::<ClusterSpec, _>("", "c1", |cluster| {
            cluster
                .metadata
                .annotations
                .remove(annotation::CLUSTER_LOCKED);
            Ok(())
        })
        .await
        .unwrap();

    eventually(Duration::from_secs(10), || async move {
        store
            .get_typed::<ClusterMachineSpec>("lk-1")
            .await
            .unwrap()
            .is_none()
    })
    .await;

    fixture.shutdown().await;
}

// ---------------------------------------------------------------------------
// S4: redaction and diffs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_config_redaction_hides_secrets_and_diffs_rotations() {
    let fixture = Fixture::start(quiet_settings()).await;
    fixture.create_cluster("c1", "1.7.5", "1.30.2").await;
    fixture.create_machine_set("c1", "c1-workers", false).await;
    fixture.create_member("c1", "c1-workers", "rd-1").await;

    let store = &fixture.store;
    eventually(Duration::from_secs(10), || async move {
        store
            .get_typed::<RedactedClusterMachineConfigSpec>("rd-1")
            .await
            .unwrap()
            .is_some_and(|redacted| !redacted.spec.data.is_empty())
    })
    .await;

    let bundle = store
        .get_typed::<ClusterSecretsSpec>("c1")
        .await
        .unwrap()
        .unwrap()
        .spec
        .bundle;
    let redacted = store
        .get_typed::<RedactedClusterMachineConfigSpec>("rd-1")
        .await
        .unwrap()
        .unwrap();

    assert!(!redacted.spec.data.contains(&bundle.cluster_secret));
    assert!(!redacted.spec.data.contains(&bundle.bootstrap_token));
    assert!(redacted.spec.data.contains("Redacted"));

    // A config change produces a diff with the redacted content only.
    let mut patch = Resource::new(
        "rd-patch",
        ConfigPatchSpec {
            data: "machine:\n  network:\n    hostname: rotated\n".to_string(),
        },
    );
    patch.metadata.labels.set(label::CLUSTER, "c1");
    patch.metadata.labels.set(label::MACHINE, "rd-1");
    fixture.create(patch).await;

    eventually(Duration::from_secs(10), || async move {
        !store
            .list_typed::<talos_fleet_rs::resources::MachineConfigDiffSpec>(
                &LabelQuery::all().eq(label::MACHINE, "rd-1"),
            )
            .await
            .unwrap()
            .is_empty()
    })
    .await;

    let diffs = store
        .list_typed::<talos_fleet_rs::resources::MachineConfigDiffSpec>(
            &LabelQuery::all().eq(label::MACHINE, "rd-1"),
        )
        .await
        .unwrap();
    for diff in &diffs {
        assert!(!diff.spec.diff.contains(&bundle.cluster_secret));
        assert!(diff
            .metadata
            .annotations
            .get(annotation::MODIFIED_AT)
            .is_some());
    }
    assert!(diffs
        .iter()
        .any(|diff| diff.spec.diff.contains("hostname: rotated")));

    fixture.shutdown().await;
}

// ---------------------------------------------------------------------------
// S5: cluster destroy drains everything
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cluster_destroy_walks_to_zero() {
    let fixture = Fixture::start(quiet_settings()).await;
    fixture.create_cluster("c1", "1.7.5", "1.30.2").await;

    let cp_set = control_plane_machine_set_id("c1");
    fixture.create_machine_set("c1", &cp_set, true).await;
    for machine in ["dz-1", "dz-2", "dz-3"] {
        fixture.create_member("c1", &cp_set, machine).await;
    }

    let store = &fixture.store;
    eventually(Duration::from_secs(10), || async move {
        store
            .list_typed::<ClusterMachineSpec>(&LabelQuery::all().eq(label::CLUSTER, "c1"))
            .await
            .unwrap()
            .len()
            == 3
    })
    .await;

    store
        .teardown(&ResourcePointer::new::<ClusterSpec>("c1"), "")
        .await
        .unwrap();

    eventually(Duration::from_secs(30), || async move {
        store
            .get_typed::<ClusterDestroyStatusSpec>("c1")
            .await
            .unwrap()
            .is_some_and(|status| status.spec.phase == "0 machine sets, 0 machines")
    })
    .await;

    // Every controller releases the cluster; it becomes destroyable.
    eventually(Duration::from_secs(30), || async move {
        let ptr = ResourcePointer::new::<ClusterSpec>("c1");
        match store.get(&ptr).await {
            Ok(cluster) => cluster.metadata.finalizers.is_empty(),
            Err(err) => err.is_not_found(),
        }
    })
    .await;
    let ptr = ResourcePointer::new::<ClusterSpec>("c1");
    if store.get(&ptr).await.is_ok() {
        store.destroy(&ptr, "").await.unwrap();
    }

    // Finalizer quiescence: nothing labeled with the cluster survives.
    eventually(Duration::from_secs(30), || async move {
        let machines = store
            .list_typed::<ClusterMachineSpec>(&LabelQuery::all().eq(label::CLUSTER, "c1"))
            .await
            .unwrap();
        let sets = store
            .list_typed::<MachineSetSpec>(&LabelQuery::all().eq(label::CLUSTER, "c1"))
            .await
            .unwrap();
        let secrets = store.get_typed::<ClusterSecretsSpec>("c1").await.unwrap();
        let versions = store
            .list_typed::<ClusterMachineTalosVersionSpec>(
                &LabelQuery::all().eq(label::CLUSTER, "c1"),
            )
            .await
            .unwrap();
        machines.is_empty() && sets.is_empty() && secrets.is_none() && versions.is_empty()
    })
    .await;

    // The wipe path reset the machines on their way out.
    assert!(!fixture.state.resets.lock().unwrap().is_empty());

    fixture.shutdown().await;
}

// ---------------------------------------------------------------------------
// S6: etcd audit is sticky
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_etcd_audit_removes_only_persistent_orphans() {
    let settings = FleetSettings::builder()
        .audit_interval(Duration::from_millis(100))
        .member_remove_timeout(Duration::from_millis(400))
        .diff_cleanup_interval(Duration::from_secs(3600))
        .build();
    let fixture = Fixture::start(settings).await;
    fixture.create_cluster("c1", "1.7.5", "1.30.2").await;

    let cp_set = control_plane_machine_set_id("c1");
    fixture.create_machine_set("c1", &cp_set, true).await;
    fixture.create_member("c1", &cp_set, "ea-1").await;

    // The audit only talks through secured sessions.
    fixture
        .create(Resource::new(
            "ea-1",
            TalosConfigSpec {
                ca: "ca".into(),
                crt: "crt".into(),
                key: "key".into(),
            },
        ))
        .await;

    let mut identity = Resource::new(
        "ea-1",
        ClusterMachineIdentitySpec {
            node_identity: "node-ea-1".to_string(),
            nodename: "ea-1".to_string(),
            etcd_member_id: 1,
        },
    );
    identity.metadata.labels.set(label::CLUSTER, "c1");
    fixture.create(identity).await;

    // Member 1 is ours; member 99 is an orphan.
    *fixture.state.etcd_members.lock().unwrap() = vec![
        EtcdMember {
            id: 1,
            hostname: "ea-1".to_string(),
        },
        EtcdMember {
            id: 99,
            hostname: "ghost".to_string(),
        },
    ];

    // Not removed immediately: the first audit only records it.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(fixture.state.removed_members.lock().unwrap().is_empty());

    // After the timeout and a confirming audit, the orphan goes.
    let state = Arc::clone(&fixture.state);
    eventually(Duration::from_secs(10), || {
        let state = Arc::clone(&state);
        async move { *state.removed_members.lock().unwrap() == vec![99] }
    })
    .await;

    let store = &fixture.store;
    eventually(Duration::from_secs(5), || async move {
        store
            .get_typed::<EtcdAuditResultSpec>("c1")
            .await
            .unwrap()
            .is_some_and(|result| result.spec.removed_members == vec![99])
    })
    .await;

    // Our own member was never touched.
    assert!(fixture
        .state
        .etcd_members
        .lock()
        .unwrap()
        .iter()
        .any(|member| member.id == 1));

    fixture.shutdown().await;
}

// ---------------------------------------------------------------------------
// Teardown ordering: affiliate delete only after the reset finalizer clears
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_machine_leave_orders_reset_before_cleanup() {
    let fixture = Fixture::start(quiet_settings()).await;
    fixture.create_cluster("c1", "1.7.5", "1.30.2").await;
    fixture.create_machine_set("c1", "c1-workers", false).await;
    fixture.create_member("c1", "c1-workers", "lv-1").await;

    let store = &fixture.store;
    eventually(Duration::from_secs(10), || async move {
        store
            .get_typed::<ClusterMachineConfigStatusSpec>("lv-1")
            .await
            .unwrap()
            .is_some()
    })
    .await;

    let mut identity = Resource::new(
        "lv-1",
        ClusterMachineIdentitySpec {
            node_identity: "affiliate-lv-1".to_string(),
            nodename: "node-lv-1".to_string(),
            etcd_member_id: 5,
        },
    );
    identity.metadata.labels.set(label::CLUSTER, "c1");
    fixture.create(identity).await;

    store
        .teardown(&ResourcePointer::new::<MachineSetNodeSpec>("lv-1"), "")
        .await
        .unwrap();

    eventually(Duration::from_secs(15), || async move {
        store
            .get_typed::<ClusterMachineSpec>("lv-1")
            .await
            .unwrap()
            .is_none()
    })
    .await;

    // The node reset happened, the affiliate delete went out, and the
    // kubernetes node was removed.
    assert!(!fixture.state.resets.lock().unwrap().is_empty());
    let state = Arc::clone(&fixture.state);
    eventually(Duration::from_secs(10), || {
        let state = Arc::clone(&state);
        async move {
            state
                .deleted_affiliates
                .lock()
                .unwrap()
                .contains(&"affiliate-lv-1".to_string())
        }
    })
    .await;
    assert!(fixture
        .state
        .deleted_nodes
        .lock()
        .unwrap()
        .contains(&"node-lv-1".to_string()));

    fixture.shutdown().await;
}

// ---------------------------------------------------------------------------
// Idempotence: a converged graph stops writing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_converged_graph_is_quiescent() {
    let fixture = Fixture::start(quiet_settings()).await;
    fixture.create_cluster("c1", "1.7.5", "1.30.2").await;
    fixture.create_machine_set("c1", "c1-workers", false).await;
    fixture.create_member("c1", "c1-workers", "qs-1").await;

    let store = &fixture.store;
    eventually(Duration::from_secs(10), || async move {
        store
            .get_typed::<ClusterMachineConfigStatusSpec>("qs-1")
            .await
            .unwrap()
            .is_some()
    })
    .await;
    // Let in-flight reconciles settle.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let snapshot = |res: Option<u64>| res.unwrap_or(0);
    let versions_before = (
        snapshot(
            store
                .get_typed::<ClusterMachineSpec>("qs-1")
                .await
                .unwrap()
                .map(|r| r.metadata.version),
        ),
        snapshot(
            store
                .get_typed::<MachineSetStatusSpec>("c1-workers")
                .await
                .unwrap()
                .map(|r| r.metadata.version),
        ),
        snapshot(
            store
                .get_typed::<MachineStatusSpec>("qs-1")
                .await
                .unwrap()
                .map(|r| r.metadata.version),
        ),
    );

    tokio::time::sleep(Duration::from_millis(500)).await;

    let versions_after = (
        snapshot(
            store
                .get_typed::<ClusterMachineSpec>("qs-1")
                .await
                .unwrap()
                .map(|r| r.metadata.version),
        ),
        snapshot(
            store
                .get_typed::<MachineSetStatusSpec>("c1-workers")
                .await
                .unwrap()
                .map(|r| r.metadata.version),
        ),
        snapshot(
            store
                .get_typed::<MachineStatusSpec>("qs-1")
                .await
                .unwrap()
                .map(|r| r.metadata.version),
        ),
    );

    assert_eq!(versions_before, versions_after, "writes on a converged graph");

    // The schematic the machine reported was ensured with the factory.
    assert!(fixture
        .state
        .ensured_schematics
        .lock()
        .unwrap()
        .contains(&"initial-schematic".to_string()));

    fixture.shutdown().await;
}
