// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tunables for the reconciliation core.

use std::time::Duration;

/// Settings shared by the controllers.
///
/// # Example
///
/// ```
/// use talos_fleet_rs::config::FleetSettings;
/// use std::time::Duration;
///
/// let settings = FleetSettings::builder()
///     .diff_max_count(500)
///     .member_remove_timeout(Duration::from_secs(600))
///     .build();
/// assert_eq!(settings.diff_max_count, 500);
/// ```
#[derive(Debug, Clone)]
pub struct FleetSettings {
    /// How often the config-diff retention pass runs.
    pub diff_cleanup_interval: Duration,
    /// Diffs older than this are deleted.
    pub diff_max_age: Duration,
    /// Past this count, the oldest diffs are deleted.
    pub diff_max_count: usize,
    /// How long an etcd/discovery orphan must stay orphaned before removal.
    pub member_remove_timeout: Duration,
    /// Requeue interval of the audit controllers.
    pub audit_interval: Duration,
    /// Whole-reconcile bound for control-plane health checks.
    pub control_plane_check_timeout: Duration,
    /// Per-call bound for outbound Talos/Kubernetes/factory requests.
    pub external_call_timeout: Duration,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            diff_cleanup_interval: Duration::from_secs(24 * 60 * 60),
            diff_max_age: Duration::from_secs(30 * 24 * 60 * 60),
            diff_max_count: 1000,
            member_remove_timeout: Duration::from_secs(30 * 60),
            audit_interval: Duration::from_secs(5 * 60),
            control_plane_check_timeout: Duration::from_secs(5 * 60),
            external_call_timeout: Duration::from_secs(10),
        }
    }
}

impl FleetSettings {
    #[must_use]
    pub fn builder() -> FleetSettingsBuilder {
        FleetSettingsBuilder::default()
    }
}

/// Builder for [`FleetSettings`].
#[derive(Debug, Default)]
pub struct FleetSettingsBuilder {
    settings: FleetSettings,
}

impl FleetSettingsBuilder {
    #[must_use]
    pub fn diff_cleanup_interval(mut self, interval: Duration) -> Self {
        self.settings.diff_cleanup_interval = interval;
        self
    }

    #[must_use]
    pub fn diff_max_age(mut self, max_age: Duration) -> Self {
        self.settings.diff_max_age = max_age;
        self
    }

    #[must_use]
    pub fn diff_max_count(mut self, max_count: usize) -> Self {
        self.settings.diff_max_count = max_count;
        self
    }

    #[must_use]
    pub fn member_remove_timeout(mut self, timeout: Duration) -> Self {
        self.settings.member_remove_timeout = timeout;
        self
    }

    #[must_use]
    pub fn audit_interval(mut self, interval: Duration) -> Self {
        self.settings.audit_interval = interval;
        self
    }

    #[must_use]
    pub fn control_plane_check_timeout(mut self, timeout: Duration) -> Self {
        self.settings.control_plane_check_timeout = timeout;
        self
    }

    #[must_use]
    pub fn external_call_timeout(mut self, timeout: Duration) -> Self {
        self.settings.external_call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn build(self) -> FleetSettings {
        self.settings
    }
}
