// SPDX-License-Identifier: MIT OR Apache-2.0

//! The image-factory client interface.

use crate::error::Result;
use async_trait::async_trait;

/// Registers schematics with the image factory.
#[async_trait]
pub trait ImageFactoryClient: Send + Sync {
    /// Idempotently ensure the factory knows the schematic; returns the
    /// factory's canonical schematic ID.
    async fn ensure_schematic(&self, schematic_id: &str) -> Result<String>;
}
