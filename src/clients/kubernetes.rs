// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Kubernetes client interface, keyed per cluster.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// The only Kubernetes operation the core performs.
#[async_trait]
pub trait KubernetesClient: Send + Sync {
    async fn delete_node(&self, name: &str) -> Result<()>;
}

/// Produces a Kubernetes client for a cluster.
#[async_trait]
pub trait KubernetesClientFactory: Send + Sync {
    async fn client_for(&self, cluster_id: &str) -> Result<Arc<dyn KubernetesClient>>;
}
