// SPDX-License-Identifier: MIT OR Apache-2.0

//! Etcd membership audit.
//!
//! Lists etcd members through the first reachable control-plane machine and
//! cross-references them with the cluster's `ClusterMachineIdentity` set.
//! Members present on etcd but unknown locally are *orphans*. Removal is
//! sticky: an orphan is only removed when two consecutive audits at least
//! `member_remove_timeout` apart both flag it; a single flake never costs a
//! member.

use crate::clients::{MachineClient, MachineClientFactory, TalosClientCerts, TalosClientSpec};
use crate::config::FleetSettings;
use crate::error::Result;
use crate::patterns::mappers;
use crate::resource::{KindRef, LabelQuery, ResourcePointer};
use crate::resources::label;
use crate::resources::{
    ClusterMachineIdentitySpec, ClusterSpec, EtcdAuditResultSpec, MachineSetNodeSpec, MachineSpec,
    TalosConfigSpec,
};
use crate::runtime::{
    ControllerSettings, InputBinding, InputMapping, QController, QRuntime, ReconcileOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const CONTROLLER_NAME: &str = "EtcdAuditController";

/// Sticky orphan bookkeeping shared by the etcd and discovery audits.
///
/// An entry is removed from the cache as soon as the orphan disappears from
/// an observation, so removal requires the *same* orphan in consecutive
/// audits spanning the timeout.
pub(crate) struct OrphanTracker<T: Eq + Hash + Clone> {
    first_seen: HashMap<T, DateTime<Utc>>,
}

impl<T: Eq + Hash + Clone> OrphanTracker<T> {
    pub(crate) fn new() -> Self {
        Self {
            first_seen: HashMap::new(),
        }
    }

    /// Record one audit's orphan set; returns the orphans now due for
    /// removal.
    pub(crate) fn observe(&mut self, orphans: &[T], now: DateTime<Utc>, timeout: Duration) -> Vec<T> {
        self.first_seen.retain(|id, _| orphans.contains(id));

        let mut due = Vec::new();
        for orphan in orphans {
            match self.first_seen.get(orphan) {
                Some(first_seen) if now - *first_seen >= timeout => due.push(orphan.clone()),
                Some(_) => {}
                None => {
                    self.first_seen.insert(orphan.clone(), now);
                }
            }
        }
        due
    }

    /// Forget an orphan after it was acted upon.
    pub(crate) fn clear(&mut self, orphan: &T) {
        self.first_seen.remove(orphan);
    }
}

pub struct EtcdAuditController {
    factory: Arc<dyn MachineClientFactory>,
    settings: FleetSettings,
    trackers: Mutex<HashMap<String, OrphanTracker<u64>>>,
}

impl EtcdAuditController {
    #[must_use]
    pub fn new(factory: Arc<dyn MachineClientFactory>, settings: FleetSettings) -> Self {
        Self {
            factory,
            settings,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// First reachable control-plane member's client.
    async fn control_plane_client(
        &self,
        rt: &QRuntime,
        cluster_id: &str,
    ) -> Result<Option<Arc<dyn MachineClient>>> {
        let nodes = rt
            .list::<MachineSetNodeSpec>(
                &LabelQuery::all()
                    .eq(label::CLUSTER, cluster_id)
                    .eq(
                        label::MACHINE_SET,
                        &crate::resources::control_plane_machine_set_id(cluster_id),
                    ),
            )
            .await?;
        for node in &nodes {
            let Some(machine) = rt.get::<MachineSpec>(&node.metadata.id).await? else {
                continue;
            };
            if !machine.spec.connected {
                continue;
            }
            let endpoint = format!("https://{}:50000", machine.spec.management_address);
            let spec = match rt.get::<TalosConfigSpec>(&node.metadata.id).await? {
                Some(config) => TalosClientSpec::secure(
                    endpoint,
                    TalosClientCerts {
                        ca: config.spec.ca.clone(),
                        crt: config.spec.crt.clone(),
                        key: config.spec.key.clone(),
                    },
                ),
                None => continue,
            };
            match self.factory.open(&spec).await {
                Ok(client) => return Ok(Some(client)),
                Err(err) => {
                    warn!(machine = %node.metadata.id, %err, "control plane client unavailable");
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl QController for EtcdAuditController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::builder()
            .primary::<ClusterSpec>()
            .exclusive_output::<EtcdAuditResultSpec>()
            .build();
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<ClusterMachineIdentitySpec>(),
            mapping: InputMapping::Mapped(mappers::by_cluster_label::<ClusterSpec>()),
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<MachineSetNodeSpec>(),
            mapping: InputMapping::Weak,
        });
        settings
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome> {
        let cluster = rt.get::<ClusterSpec>(&ptr.id).await?;
        let Some(cluster) = cluster.filter(|c| !c.metadata.is_tearing_down()) else {
            self.trackers.lock().unwrap().remove(&ptr.id);
            rt.teardown_and_destroy::<EtcdAuditResultSpec>(&ptr.id).await?;
            return Ok(ReconcileOutcome::Done);
        };
        drop(cluster);

        let Some(client) = self.control_plane_client(rt, &ptr.id).await? else {
            return Ok(ReconcileOutcome::Requeue(self.settings.audit_interval));
        };

        let members = match client.etcd_member_list().await {
            Ok(members) => members,
            Err(err) => {
                warn!(cluster = %ptr.id, %err, "etcd member list failed");
                return Ok(ReconcileOutcome::Requeue(self.settings.audit_interval));
            }
        };

        let known: HashSet<u64> = rt
            .list::<ClusterMachineIdentitySpec>(&LabelQuery::all().eq(label::CLUSTER, &ptr.id))
            .await?
            .into_iter()
            .map(|identity| identity.spec.etcd_member_id)
            .filter(|id| *id != 0)
            .collect();

        let orphans: Vec<u64> = members
            .iter()
            .map(|member| member.id)
            .filter(|id| !known.contains(id))
            .collect();

        let timeout = Duration::from_std(self.settings.member_remove_timeout)
            .unwrap_or_else(|_| Duration::zero());
        let due = {
            let mut trackers = self.trackers.lock().unwrap();
            trackers
                .entry(ptr.id.clone())
                .or_insert_with(OrphanTracker::new)
                .observe(&orphans, Utc::now(), timeout)
        };

        let mut removed = Vec::new();
        for member_id in due {
            match client.etcd_remove_member_by_id(member_id).await {
                Ok(()) => {
                    info!(cluster = %ptr.id, member = member_id, "removed orphaned etcd member");
                    removed.push(member_id);
                    self.trackers
                        .lock()
                        .unwrap()
                        .get_mut(&ptr.id)
                        .expect("tracker present")
                        .clear(&member_id);
                }
                Err(err) => {
                    warn!(cluster = %ptr.id, member = member_id, %err, "etcd member removal failed");
                }
            }
        }

        if !removed.is_empty() {
            removed.sort_unstable();
            let removed_members = removed.clone();
            rt.create_or_modify::<EtcdAuditResultSpec, _, _>(
                &ptr.id,
                EtcdAuditResultSpec::default,
                |res| {
                    res.metadata.labels.set(label::CLUSTER, &ptr.id);
                    res.spec.removed_members = removed_members.clone();
                    Ok(())
                },
            )
            .await?;
        }

        Ok(ReconcileOutcome::Requeue(self.settings.audit_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(m: i64) -> Duration {
        Duration::minutes(m)
    }

    #[test]
    fn test_orphan_removed_after_two_consistent_audits() {
        let mut tracker = OrphanTracker::new();
        let start = Utc::now();

        assert!(tracker.observe(&[7u64], start, minutes(10)).is_empty());
        // Too early.
        assert!(tracker.observe(&[7u64], start + minutes(5), minutes(10)).is_empty());
        // Past the timeout and still orphaned.
        assert_eq!(tracker.observe(&[7u64], start + minutes(10), minutes(10)), vec![7]);
    }

    #[test]
    fn test_flake_resets_the_clock() {
        let mut tracker = OrphanTracker::new();
        let start = Utc::now();

        assert!(tracker.observe(&[7u64], start, minutes(10)).is_empty());
        // The orphan vanished in the next audit: cache entry dropped.
        assert!(tracker.observe(&[], start + minutes(5), minutes(10)).is_empty());
        // Reappearing starts over, even though the wall-clock gap from the
        // first sighting exceeds the timeout.
        assert!(tracker
            .observe(&[7u64], start + minutes(15), minutes(10))
            .is_empty());
        assert_eq!(
            tracker.observe(&[7u64], start + minutes(25), minutes(10)),
            vec![7]
        );
    }

    #[test]
    fn test_clear_after_removal() {
        let mut tracker = OrphanTracker::new();
        let start = Utc::now();

        tracker.observe(&[7u64], start, minutes(10));
        assert_eq!(tracker.observe(&[7u64], start + minutes(10), minutes(10)), vec![7]);
        tracker.clear(&7);

        // After clearing, the member must be seen twice again.
        assert!(tracker
            .observe(&[7u64], start + minutes(30), minutes(10))
            .is_empty());
    }
}
