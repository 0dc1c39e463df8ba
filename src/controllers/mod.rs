// SPDX-License-Identifier: MIT OR Apache-2.0

//! The concrete controller graph.
//!
//! Each controller is small and single-purpose; together they drive
//! machines and clusters through their whole lifecycle. [`register_all`]
//! wires the full graph into a runtime.

pub mod cluster_destroy;
pub mod cluster_secrets;
pub mod cluster_status;
pub mod config_redaction;
pub mod config_status;
pub mod control_plane_status;
pub mod discovery_audit;
pub mod etcd_audit;
pub mod extended_config;
pub mod gen_options;
pub mod load_balancer;
pub mod machine_cleanup;
pub mod machine_config;
pub mod machine_set;
pub mod machine_status;
pub mod machine_status_link;
pub mod machine_teardown;
pub mod ongoing_tasks;
pub mod schematic;
pub mod talos_upgrade;

pub use cluster_destroy::ClusterDestroyController;
pub use cluster_secrets::{
    ClusterConfigVersionController, ClusterIdentityController, ClusterSecretsController,
};
pub use cluster_status::ClusterStatusController;
pub use config_redaction::ConfigRedactionController;
pub use config_status::ConfigStatusController;
pub use control_plane_status::ControlPlaneStatusController;
pub use discovery_audit::DiscoveryAuditController;
pub use etcd_audit::EtcdAuditController;
pub use extended_config::ExtendedConfigController;
pub use gen_options::MachineConfigGenOptionsController;
pub use load_balancer::LoadBalancerConfigController;
pub use machine_cleanup::MachineCleanupController;
pub use machine_config::MachineConfigController;
pub use machine_set::MachineSetController;
pub use machine_status::MachineStatusController;
pub use machine_status_link::MachineStatusLinkController;
pub use machine_teardown::MachineTeardownController;
pub use ongoing_tasks::OngoingTaskController;
pub use schematic::SchematicEnsurerController;
pub use talos_upgrade::TalosUpgradeController;

use crate::clients::{
    DiscoveryClient, ImageFactoryClient, KubernetesClientFactory, MachineClientFactory,
};
use crate::config::FleetSettings;
use crate::patterns::{CleanupController, DestroyChildren, QTransformController};
use crate::resource::LabelQuery;
use crate::resources::{label, ClusterSpec, ConfigPatchSpec};
use crate::runtime::ControllerRuntime;
use std::sync::Arc;

/// Handles to the external collaborators the controller graph calls.
#[derive(Clone)]
pub struct ExternalClients {
    pub machine_factory: Arc<dyn MachineClientFactory>,
    pub image_factory: Arc<dyn ImageFactoryClient>,
    pub discovery: Arc<dyn DiscoveryClient>,
    pub kubernetes: Arc<dyn KubernetesClientFactory>,
}

/// Register the full controller graph.
pub fn register_all(
    runtime: &mut ControllerRuntime,
    clients: &ExternalClients,
    settings: &FleetSettings,
) {
    runtime
        .register(QTransformController::new(ClusterSecretsController))
        .register(QTransformController::new(ClusterConfigVersionController))
        .register(QTransformController::new(ClusterIdentityController))
        .register(QTransformController::new(LoadBalancerConfigController))
        .register(QTransformController::new(ClusterStatusController))
        .register(MachineStatusController::new(Arc::clone(
            &clients.machine_factory,
        )))
        .register(MachineTeardownController::new(
            Arc::clone(&clients.machine_factory),
            settings.clone(),
        ))
        .register(SchematicEnsurerController::new(Arc::clone(
            &clients.image_factory,
        )))
        .register(QTransformController::new(MachineConfigGenOptionsController))
        .register(QTransformController::new(MachineConfigController::default()))
        .register(QTransformController::new(ConfigRedactionController::new(
            settings.clone(),
        )))
        .register(QTransformController::new(ExtendedConfigController))
        .register(ConfigStatusController::new(
            Arc::clone(&clients.machine_factory),
            settings.clone(),
        ))
        .register(MachineSetController)
        .register(TalosUpgradeController)
        .register(MachineCleanupController::new(
            Arc::clone(&clients.kubernetes),
            settings.clone(),
        ))
        .register(ClusterDestroyController)
        .register(ControlPlaneStatusController::new(
            Arc::clone(&clients.machine_factory),
            settings.clone(),
        ))
        .register(EtcdAuditController::new(
            Arc::clone(&clients.machine_factory),
            settings.clone(),
        ))
        .register(DiscoveryAuditController::new(
            Arc::clone(&clients.discovery),
            settings.clone(),
        ))
        .register(OngoingTaskController)
        .register(QTransformController::new(MachineStatusLinkController))
        .register(CleanupController::new(
            "ConfigPatchCleanupController",
            DestroyChildren::<ClusterSpec, ConfigPatchSpec, _>::new(|cluster| {
                LabelQuery::all().eq(label::CLUSTER, cluster.id())
            }),
        ));
}
