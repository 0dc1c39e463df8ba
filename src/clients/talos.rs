// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Talos machine API as consumed by the controllers.
//!
//! The concrete gRPC client lives outside the core; controllers talk to it
//! through [`MachineClient`] and open sessions via [`MachineClientFactory`].
//! A session is described by [`TalosClientSpec`]: client-certificate TLS
//! once the machine joined a cluster, maintenance mode (insecure TLS)
//! before that. Task-runner controllers compare specs for equality to
//! decide whether a collect task must be restarted.

use crate::error::Result;
use crate::resource::Labels;
use crate::resources::{
    BlockDevice, Diagnostic, HardwareStatus, NetworkStatus, PlatformMetadata, SchematicInfo,
    SecurityState,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Client certificates for a secured Talos API session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalosClientCerts {
    pub ca: String,
    pub crt: String,
    pub key: String,
}

/// Connection parameters for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalosClientSpec {
    /// The gRPC endpoint URL.
    pub endpoint: String,
    /// Client credentials; `None` selects maintenance mode with TLS
    /// verification disabled.
    pub certs: Option<TalosClientCerts>,
}

impl TalosClientSpec {
    /// Secure session using the cluster's client certificates.
    #[must_use]
    pub fn secure(endpoint: impl Into<String>, certs: TalosClientCerts) -> Self {
        Self {
            endpoint: endpoint.into(),
            certs: Some(certs),
        }
    }

    /// Maintenance-mode session (machine not yet configured).
    #[must_use]
    pub fn maintenance(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            certs: None,
        }
    }

    /// True when the session runs without client certificates.
    #[must_use]
    pub fn is_maintenance(&self) -> bool {
        self.certs.is_none()
    }
}

/// Mode for wiping disks during reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WipeMode {
    /// Wipe all disks (system and user).
    #[default]
    All,
    /// Wipe only the system disk.
    SystemDisk,
    /// Wipe only user disks.
    UserDisks,
}

impl std::fmt::Display for WipeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WipeMode::All => write!(f, "all"),
            WipeMode::SystemDisk => write!(f, "system-disk"),
            WipeMode::UserDisks => write!(f, "user-disks"),
        }
    }
}

/// A running Talos service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceInfo {
    pub id: String,
    pub state: String,
    pub healthy: bool,
}

/// An etcd member as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EtcdMember {
    pub id: u64,
    pub hostname: String,
}

/// One observation of a machine's state, streamed by the status collector.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MachineStatusSample {
    pub talos_version: String,
    pub schematic: Option<SchematicInfo>,
    pub platform_metadata: Option<PlatformMetadata>,
    pub hardware: Option<HardwareStatus>,
    pub network: Option<NetworkStatus>,
    pub security_state: Option<SecurityState>,
    pub diagnostics: Vec<Diagnostic>,
    pub cmdline: String,
    pub last_error: String,
    pub maintenance: bool,
    pub image_labels: Labels,
    pub reporting_events: bool,
}

/// The subset of the Talos machine API the core calls.
#[async_trait]
pub trait MachineClient: Send + Sync {
    async fn version(&self) -> Result<String>;

    /// Apply a full machine configuration document.
    async fn apply_configuration(&self, data: Bytes) -> Result<()>;

    async fn bootstrap(&self) -> Result<()>;

    /// Reset the node. `graceful` leaves etcd first; `reboot = false` halts.
    async fn reset(&self, graceful: bool, reboot: bool, wipe: WipeMode) -> Result<()>;

    async fn disks(&self) -> Result<Vec<BlockDevice>>;

    async fn service_list(&self) -> Result<Vec<ServiceInfo>>;

    async fn etcd_member_list(&self) -> Result<Vec<EtcdMember>>;

    async fn etcd_remove_member_by_id(&self, member_id: u64) -> Result<()>;

    async fn etcd_forfeit_leadership(&self) -> Result<()>;

    async fn etcd_leave_cluster(&self) -> Result<()>;

    async fn meta_write(&self, key: u8, value: Bytes) -> Result<()>;

    async fn meta_delete(&self, key: u8) -> Result<()>;

    /// List a directory on the node's filesystem.
    async fn list_files(&self, path: &str) -> Result<Vec<String>>;

    /// Stream status observations until cancelled. The implementation owns
    /// reconnects; the channel closing signals a permanently failed session.
    async fn watch_status(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<MachineStatusSample>>;
}

/// Opens machine clients for a connection spec.
#[async_trait]
pub trait MachineClientFactory: Send + Sync {
    async fn open(&self, spec: &TalosClientSpec) -> Result<Arc<dyn MachineClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_modes() {
        let maintenance = TalosClientSpec::maintenance("https://10.0.0.1:50000");
        assert!(maintenance.is_maintenance());

        let secure = TalosClientSpec::secure(
            "https://10.0.0.1:50000",
            TalosClientCerts {
                ca: "ca".into(),
                crt: "crt".into(),
                key: "key".into(),
            },
        );
        assert!(!secure.is_maintenance());
        assert_ne!(maintenance, secure);
    }

    #[test]
    fn test_wipe_mode_display() {
        assert_eq!(WipeMode::All.to_string(), "all");
        assert_eq!(WipeMode::SystemDisk.to_string(), "system-disk");
        assert_eq!(WipeMode::UserDisks.to_string(), "user-disks");
    }
}
