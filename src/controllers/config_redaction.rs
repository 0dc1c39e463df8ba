// SPDX-License-Identifier: MIT OR Apache-2.0

//! Redacted config mirror and diff history.
//!
//! Every `ClusterMachineConfig` is re-encoded with secret material replaced
//! by the `Redacted` marker and stored as `RedactedClusterMachineConfig`.
//! When a previous redacted document exists, a Myers unified diff between
//! the two is written as a `MachineConfigDiff` whose ID and `modified-at`
//! annotation carry a fixed-width timestamp, so lexicographic order equals
//! time order. A periodic pass prunes diffs past the retention window:
//! first by age, then oldest-first down to the count cap.

use crate::config::FleetSettings;
use crate::error::{FleetError, Result};
use crate::patterns::{QTransform, TransformOutcome};
use crate::resource::{KindRef, LabelQuery, Resource};
use crate::resources::{annotation, label, MODIFIED_AT_FORMAT};
use crate::resources::{
    ClusterMachineConfigSpec, MachineConfigDiffSpec, RedactedClusterMachineConfigSpec,
};
use crate::runtime::{OutputBinding, OutputSharing, QRuntime};
use async_trait::async_trait;
use chrono::Utc;
use serde_yaml::Value;
use similar::TextDiff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::machine_config::decompress_config;

/// The replacement marker, matching what Talos uses in its own redaction.
pub const REDACTED: &str = "Redacted";

const SECRET_KEYS: &[&str] = &[
    "secret",
    "token",
    "key",
    "secretboxEncryptionSecret",
    "aescbcEncryptionSecret",
];

fn redact_value(value: &mut Value) {
    if let Value::Mapping(map) = value {
        for (key, entry) in map.iter_mut() {
            let is_secret = key
                .as_str()
                .is_some_and(|k| SECRET_KEYS.contains(&k));
            if is_secret && entry.is_string() {
                *entry = Value::String(REDACTED.to_string());
            } else {
                redact_value(entry);
            }
        }
    } else if let Value::Sequence(seq) = value {
        for entry in seq.iter_mut() {
            redact_value(entry);
        }
    }
}

/// Redact a (possibly multi-document) YAML stream.
pub fn redact_document(text: &str) -> Result<String> {
    use serde::Deserialize;

    let mut documents = Vec::new();
    for deserializer in serde_yaml::Deserializer::from_str(text) {
        let mut value = Value::deserialize(deserializer)
            .map_err(|err| FleetError::Generation(format!("redact parse: {err}")))?;
        redact_value(&mut value);
        documents.push(
            serde_yaml::to_string(&value)
                .map_err(|err| FleetError::Generation(format!("redact encode: {err}")))?,
        );
    }
    Ok(documents.join("---\n"))
}

/// Unified diff between two redacted documents.
#[must_use]
pub fn unified_diff(previous: &str, current: &str) -> String {
    TextDiff::from_lines(previous, current)
        .unified_diff()
        .context_radius(3)
        .to_string()
}

/// Which diff resources a retention pass must delete.
///
/// `entries` are `(id, modified_at)` pairs; `cutoff` is the oldest
/// `modified-at` value still allowed. Timestamps compare as strings thanks
/// to the fixed-width format.
pub(crate) fn expired_diffs(
    mut entries: Vec<(String, String)>,
    cutoff: &str,
    max_count: usize,
) -> Vec<String> {
    let mut doomed: Vec<String> = Vec::new();

    entries.retain(|(id, modified_at)| {
        if modified_at.as_str() < cutoff {
            doomed.push(id.clone());
            false
        } else {
            true
        }
    });

    if entries.len() > max_count {
        entries.sort_by(|a, b| a.1.cmp(&b.1));
        let excess = entries.len() - max_count;
        doomed.extend(entries.drain(..excess).map(|(id, _)| id));
    }

    doomed
}

/// `ClusterMachineConfig` → `RedactedClusterMachineConfig` + diff history.
pub struct ConfigRedactionController {
    settings: FleetSettings,
}

impl ConfigRedactionController {
    #[must_use]
    pub fn new(settings: FleetSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl QTransform for ConfigRedactionController {
    type Input = ClusterMachineConfigSpec;
    type Output = RedactedClusterMachineConfigSpec;

    fn name(&self) -> &'static str {
        "ConfigRedactionController"
    }

    fn extra_outputs(&self) -> Vec<OutputBinding> {
        vec![OutputBinding {
            kind: KindRef::of::<MachineConfigDiffSpec>(),
            sharing: OutputSharing::Exclusive,
        }]
    }

    async fn transform(
        &self,
        rt: &QRuntime,
        input: &Resource<ClusterMachineConfigSpec>,
        output: &mut Resource<RedactedClusterMachineConfigSpec>,
    ) -> Result<TransformOutcome> {
        if input.spec.data.is_empty() {
            return Ok(TransformOutcome::Skip);
        }

        let plain = decompress_config(&input.spec.data)?;
        let redacted = redact_document(&plain)?;
        if output.spec.data == redacted {
            return Ok(TransformOutcome::Skip);
        }

        if !output.spec.data.is_empty() {
            let modified_at = Utc::now().format(MODIFIED_AT_FORMAT).to_string();
            let diff_id = format!("{}-{}", input.id(), modified_at);
            let diff = unified_diff(&output.spec.data, &redacted);
            let machine_id = input.id().to_string();
            let cluster = input.metadata.labels.get(label::CLUSTER).map(String::from);

            rt.create_or_modify::<MachineConfigDiffSpec, _, _>(
                &diff_id,
                MachineConfigDiffSpec::default,
                |res| {
                    res.spec.diff = diff.clone();
                    res.metadata.labels.set(label::MACHINE, &machine_id);
                    if let Some(cluster) = &cluster {
                        res.metadata.labels.set(label::CLUSTER, cluster);
                    }
                    res.metadata
                        .annotations
                        .set(annotation::MODIFIED_AT, &modified_at);
                    Ok(())
                },
            )
            .await?;
        }

        for (key, value) in input.metadata.labels.iter() {
            output.metadata.labels.set(key, value);
        }
        output.spec.data = redacted;
        Ok(TransformOutcome::Modified)
    }

    async fn finalizer_removal(
        &self,
        rt: &QRuntime,
        input: &Resource<ClusterMachineConfigSpec>,
    ) -> Result<()> {
        // The machine is leaving; its diff history goes with it.
        let diffs = rt
            .list::<MachineConfigDiffSpec>(&LabelQuery::all().eq(label::MACHINE, input.id()))
            .await?;
        for diff in diffs {
            rt.teardown_and_destroy::<MachineConfigDiffSpec>(diff.id())
                .await?;
        }
        Ok(())
    }

    async fn run_hook(&self, rt: QRuntime, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.settings.diff_cleanup_interval) => {}
                () = cancel.cancelled() => return Ok(()),
            }

            let diffs = match rt.list::<MachineConfigDiffSpec>(&LabelQuery::all()).await {
                Ok(diffs) => diffs,
                Err(err) => {
                    warn!(%err, "diff retention list failed");
                    continue;
                }
            };

            let cutoff = (Utc::now()
                - chrono::Duration::from_std(self.settings.diff_max_age)
                    .unwrap_or(chrono::Duration::zero()))
            .format(MODIFIED_AT_FORMAT)
            .to_string();

            let entries = diffs
                .iter()
                .map(|diff| {
                    (
                        diff.id().to_string(),
                        diff.metadata
                            .annotations
                            .get(annotation::MODIFIED_AT)
                            .unwrap_or_default()
                            .to_string(),
                    )
                })
                .collect();

            let doomed = expired_diffs(entries, &cutoff, self.settings.diff_max_count);
            if !doomed.is_empty() {
                debug!(count = doomed.len(), "pruning machine config diffs");
            }
            for id in doomed {
                if let Err(err) = rt.teardown_and_destroy::<MachineConfigDiffSpec>(&id).await {
                    warn!(%id, %err, "failed to prune config diff");
                }
            }
        }
    }
}
