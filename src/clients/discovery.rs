// SPDX-License-Identifier: MIT OR Apache-2.0

//! The discovery-service client interface.

use crate::error::Result;
use async_trait::async_trait;

/// Manages cluster affiliates on the discovery service.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn list_affiliates(&self, cluster_id: &str) -> Result<Vec<String>>;

    async fn delete_affiliate(&self, cluster_id: &str, affiliate_id: &str) -> Result<()>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
