// SPDX-License-Identifier: MIT OR Apache-2.0

//! Discovery-service affiliate cleanup.
//!
//! Two duties per cluster: executing `DiscoveryAffiliateDeleteTask`s
//! written by the teardown cascade, and the periodic orphan audit (same
//! sticky two-audit rule as the etcd audit). Deletes are batched; a partial
//! failure leaves the remaining work for the next requeue.

use crate::clients::DiscoveryClient;
use crate::config::FleetSettings;
use crate::error::Result;
use crate::patterns::mappers;
use crate::resource::{KindRef, LabelQuery, ResourcePointer};
use crate::resources::label;
use crate::resources::{
    ClusterMachineIdentitySpec, ClusterSpec, DiscoveryAffiliateDeleteTaskSpec,
};
use crate::runtime::{
    ControllerSettings, InputBinding, InputMapping, QController, QRuntime, ReconcileOutcome,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use super::etcd_audit::OrphanTracker;

const CONTROLLER_NAME: &str = "DiscoveryAuditController";

pub struct DiscoveryAuditController {
    discovery: Arc<dyn DiscoveryClient>,
    settings: FleetSettings,
    trackers: Mutex<HashMap<String, OrphanTracker<String>>>,
}

impl DiscoveryAuditController {
    #[must_use]
    pub fn new(discovery: Arc<dyn DiscoveryClient>, settings: FleetSettings) -> Self {
        Self {
            discovery,
            settings,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Execute pending delete tasks for the cluster. Returns `true` when
    /// everything submitted went through.
    async fn drain_delete_tasks(&self, rt: &QRuntime, cluster_id: &str) -> Result<bool> {
        let tasks = rt
            .list::<DiscoveryAffiliateDeleteTaskSpec>(
                &LabelQuery::all().eq(label::CLUSTER, cluster_id),
            )
            .await?;

        let mut all_ok = true;
        for task in &tasks {
            if task.spec.affiliate_id.is_empty() {
                rt.teardown_and_destroy::<DiscoveryAffiliateDeleteTaskSpec>(&task.metadata.id)
                    .await?;
                continue;
            }
            match self
                .discovery
                .delete_affiliate(&task.spec.cluster_id, &task.spec.affiliate_id)
                .await
            {
                Ok(()) => {
                    info!(
                        cluster = %task.spec.cluster_id,
                        affiliate = %task.spec.affiliate_id,
                        "affiliate deleted"
                    );
                    rt.teardown_and_destroy::<DiscoveryAffiliateDeleteTaskSpec>(&task.metadata.id)
                        .await?;
                }
                Err(err) => {
                    warn!(
                        affiliate = %task.spec.affiliate_id,
                        %err,
                        "affiliate deletion failed"
                    );
                    all_ok = false;
                }
            }
        }
        Ok(all_ok)
    }

    async fn audit_orphans(&self, rt: &QRuntime, cluster_id: &str) -> Result<bool> {
        let affiliates = match self.discovery.list_affiliates(cluster_id).await {
            Ok(affiliates) => affiliates,
            Err(err) => {
                warn!(cluster = %cluster_id, %err, "affiliate list failed");
                return Ok(false);
            }
        };

        let known: HashSet<String> = rt
            .list::<ClusterMachineIdentitySpec>(&LabelQuery::all().eq(label::CLUSTER, cluster_id))
            .await?
            .into_iter()
            .map(|identity| identity.spec.node_identity)
            .filter(|id| !id.is_empty())
            .collect();

        let orphans: Vec<String> = affiliates
            .into_iter()
            .filter(|affiliate| !known.contains(affiliate))
            .collect();

        let timeout = Duration::from_std(self.settings.member_remove_timeout)
            .unwrap_or_else(|_| Duration::zero());
        let due = {
            let mut trackers = self.trackers.lock().unwrap();
            trackers
                .entry(cluster_id.to_string())
                .or_insert_with(OrphanTracker::new)
                .observe(&orphans, Utc::now(), timeout)
        };

        let mut all_ok = true;
        for affiliate in due {
            match self.discovery.delete_affiliate(cluster_id, &affiliate).await {
                Ok(()) => {
                    info!(cluster = %cluster_id, %affiliate, "orphaned affiliate deleted");
                    self.trackers
                        .lock()
                        .unwrap()
                        .get_mut(cluster_id)
                        .expect("tracker present")
                        .clear(&affiliate);
                }
                Err(err) => {
                    warn!(%affiliate, %err, "orphaned affiliate deletion failed");
                    all_ok = false;
                }
            }
        }
        Ok(all_ok)
    }
}

#[async_trait]
impl QController for DiscoveryAuditController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::builder()
            .primary::<ClusterSpec>()
            .shared_output::<DiscoveryAffiliateDeleteTaskSpec>()
            .build();
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<DiscoveryAffiliateDeleteTaskSpec>(),
            mapping: InputMapping::Mapped(mappers::by_cluster_label::<ClusterSpec>()),
        });
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<ClusterMachineIdentitySpec>(),
            mapping: InputMapping::Weak,
        });
        settings
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome> {
        let cluster = rt.get::<ClusterSpec>(&ptr.id).await?;
        if cluster.is_none() {
            self.trackers.lock().unwrap().remove(&ptr.id);
            // Tasks written during the final teardown still need draining.
            self.drain_delete_tasks(rt, &ptr.id).await?;
            return Ok(ReconcileOutcome::Done);
        }

        let drained = self.drain_delete_tasks(rt, &ptr.id).await?;
        let audited = self.audit_orphans(rt, &ptr.id).await?;

        if drained && audited {
            Ok(ReconcileOutcome::Requeue(self.settings.audit_interval))
        } else {
            // Partial failure: retry sooner than the audit cadence.
            Ok(ReconcileOutcome::Requeue(self.settings.audit_interval / 4))
        }
    }
}
