// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the external collaborators the controllers call: the Talos
//! machine API, the image factory, the discovery service and Kubernetes.
//! The core ships no implementations; deployments plug their own in.

mod discovery;
mod factory;
mod kubernetes;
mod talos;

pub use discovery::DiscoveryClient;
pub use factory::ImageFactoryClient;
pub use kubernetes::{KubernetesClient, KubernetesClientFactory};
pub use talos::{
    EtcdMember, MachineClient, MachineClientFactory, MachineStatusSample, ServiceInfo,
    TalosClientCerts, TalosClientSpec, WipeMode,
};
