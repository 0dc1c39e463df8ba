// SPDX-License-Identifier: MIT OR Apache-2.0

//! Live machine-status collection.
//!
//! For every connected `Machine` a collect task holds a Talos API session —
//! client-certificate TLS once a `TalosConfig` exists, maintenance mode
//! before that — and streams status samples. Samples are folded into
//! `MachineStatus`, preserving the one-shot fields (`initial_talos_version`,
//! `initial_schematic`, `image_labels`). The `MachineStatus` outlives the
//! `Machine` during teardown so the wipe step still sees disks and
//! credentials; it is destroyed once every other finalizer on the machine
//! is gone.

use crate::clients::{MachineClientFactory, MachineStatusSample, TalosClientCerts, TalosClientSpec};
use crate::error::Result;
use crate::patterns::mappers;
use crate::patterns::{FleetTask, TaskRunner};
use crate::resource::{KindRef, Resource, ResourcePointer};
use crate::resources::label;
use crate::resources::{MachineSpec, MachineStatusSpec, TalosConfigSpec};
use crate::runtime::{
    ControllerSettings, InputBinding, InputMapping, QController, QRuntime, ReconcileOutcome,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CONTROLLER_NAME: &str = "MachineStatusController";
const EVENT_BUFFER: usize = 256;

/// A folded status update emitted by a collect task.
pub struct StatusEvent {
    pub machine_id: String,
    pub sample: MachineStatusSample,
}

#[derive(Clone)]
struct CollectTask {
    machine_id: String,
    spec: TalosClientSpec,
    factory: Arc<dyn MachineClientFactory>,
}

impl PartialEq for CollectTask {
    fn eq(&self, other: &Self) -> bool {
        // The factory is process-wide; only the connection spec decides
        // whether a running task must be restarted.
        self.machine_id == other.machine_id && self.spec == other.spec
    }
}

#[async_trait]
impl FleetTask for CollectTask {
    type Event = StatusEvent;

    async fn run(
        &self,
        events: mpsc::Sender<StatusEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let client = self.factory.open(&self.spec).await?;
        let mut samples = client.watch_status(cancel.clone()).await?;
        while let Some(sample) = samples.recv().await {
            if events
                .send(StatusEvent {
                    machine_id: self.machine_id.clone(),
                    sample,
                })
                .await
                .is_err()
            {
                // Runtime shutting down.
                break;
            }
        }
        Ok(())
    }
}

/// Fold one sample into the status spec, honoring the one-shot fields.
pub(crate) fn fold_sample(status: &mut Resource<MachineStatusSpec>, sample: &MachineStatusSample) {
    let spec = &mut status.spec;

    if !sample.talos_version.is_empty() {
        spec.talos_version = sample.talos_version.clone();
        if spec.initial_talos_version.is_empty() {
            spec.initial_talos_version = sample.talos_version.clone();
        }
    }

    if let Some(schematic) = &sample.schematic {
        let initial = if let Some(previous) = &spec.schematic {
            if previous.initial_schematic.is_empty() {
                schematic.id.clone()
            } else {
                previous.initial_schematic.clone()
            }
        } else {
            schematic.id.clone()
        };
        let mut schematic = schematic.clone();
        schematic.initial_schematic = initial;
        spec.schematic = Some(schematic);
    }

    if sample.platform_metadata.is_some() {
        spec.platform_metadata = sample.platform_metadata.clone();
    }
    if sample.hardware.is_some() {
        spec.hardware = sample.hardware.clone();
    }
    if sample.network.is_some() {
        spec.network = sample.network.clone();
    }
    if sample.security_state.is_some() {
        spec.security_state = sample.security_state;
    }
    spec.diagnostics = sample.diagnostics.clone();
    spec.cmdline = sample.cmdline.clone();
    spec.last_error = sample.last_error.clone();
    spec.maintenance = sample.maintenance;

    if spec.image_labels.is_empty() && !sample.image_labels.is_empty() {
        spec.image_labels = sample.image_labels.clone();
        for (key, value) in sample.image_labels.iter() {
            status
                .metadata
                .labels
                .set(format!("{}{key}", label::IMAGE_LABEL_PREFIX), value);
        }
    }

    set_bool_label(status, label::REPORTING_EVENTS, sample.reporting_events);
    let invalid = sample.schematic.as_ref().is_some_and(|s| s.invalid);
    set_bool_label(status, label::INVALID_STATE, invalid);
}

fn set_bool_label(status: &mut Resource<MachineStatusSpec>, key: &str, value: bool) {
    if value {
        status.metadata.labels.set(key, "");
    } else {
        status.metadata.labels.remove(key);
    }
}

/// Task-runner controller projecting live machine state into
/// `MachineStatus`.
pub struct MachineStatusController {
    factory: Arc<dyn MachineClientFactory>,
    runner: TaskRunner<CollectTask>,
    events_rx: Mutex<Option<mpsc::Receiver<StatusEvent>>>,
}

impl MachineStatusController {
    #[must_use]
    pub fn new(factory: Arc<dyn MachineClientFactory>) -> Self {
        let (runner, events_rx) = TaskRunner::new(EVENT_BUFFER);
        Self {
            factory,
            runner,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    async fn client_spec(&self, rt: &QRuntime, machine: &Resource<MachineSpec>) -> Result<TalosClientSpec> {
        let endpoint = format!("https://{}:50000", machine.spec.management_address);
        Ok(match rt.get::<TalosConfigSpec>(machine.id()).await? {
            Some(config) => TalosClientSpec::secure(
                endpoint,
                TalosClientCerts {
                    ca: config.spec.ca.clone(),
                    crt: config.spec.crt.clone(),
                    key: config.spec.key.clone(),
                },
            ),
            None => TalosClientSpec::maintenance(endpoint),
        })
    }

    async fn update_presence_labels(
        &self,
        rt: &QRuntime,
        machine: &Resource<MachineSpec>,
    ) -> Result<()> {
        let connected = machine.spec.connected;
        rt.create_or_modify::<MachineStatusSpec, _, _>(
            machine.id(),
            MachineStatusSpec::default,
            |status| {
                if connected {
                    status.metadata.labels.set(label::CONNECTED, "");
                    status.metadata.labels.remove(label::DISCONNECTED);
                } else {
                    status.metadata.labels.remove(label::CONNECTED);
                    status.metadata.labels.set(label::DISCONNECTED, "");
                }
                let ready = connected && !status.metadata.labels.contains(label::INVALID_STATE);
                if ready {
                    status.metadata.labels.set(label::READY_TO_USE, "");
                } else {
                    status.metadata.labels.remove(label::READY_TO_USE);
                }
                if ready && status.spec.maintenance {
                    status.metadata.labels.set(label::AVAILABLE, "");
                } else {
                    status.metadata.labels.remove(label::AVAILABLE);
                }
                Ok(())
            },
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QController for MachineStatusController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::builder()
            .primary::<MachineSpec>()
            .exclusive_output::<MachineStatusSpec>()
            .concurrency(4)
            .build();
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<TalosConfigSpec>(),
            mapping: InputMapping::Mapped(mappers::same_id::<MachineSpec>()),
        });
        // The status outlives the machine while other teardown steps hold
        // finalizers on it; resume once it becomes destroyable.
        settings.inputs.push(InputBinding {
            kind: KindRef::of::<MachineStatusSpec>(),
            mapping: InputMapping::MappedDestroyReady(mappers::same_id::<MachineSpec>()),
        });
        settings
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome> {
        let Some(machine) = rt.get::<MachineSpec>(&ptr.id).await? else {
            self.runner.stop(&ptr.id).await;
            rt.teardown_and_destroy::<MachineStatusSpec>(&ptr.id).await?;
            return Ok(ReconcileOutcome::Done);
        };

        if machine.metadata.is_tearing_down() {
            self.runner.stop(&ptr.id).await;

            if !machine.metadata.has_finalizer(CONTROLLER_NAME) {
                return Ok(ReconcileOutcome::Done);
            }
            // Other teardown steps (wipe, cluster disassociation) keep their
            // own finalizers on the machine; the status must stay alive for
            // them.
            if machine.metadata.finalizers.len() > 1 {
                debug!(machine = %ptr.id, "waiting for remaining machine finalizers");
                return Ok(ReconcileOutcome::Skip);
            }
            if !rt.teardown_and_destroy::<MachineStatusSpec>(&ptr.id).await? {
                return Ok(ReconcileOutcome::Skip);
            }
            rt.remove_finalizer(&machine.pointer()).await?;
            return Ok(ReconcileOutcome::Done);
        }

        rt.add_finalizer(&machine.pointer()).await?;

        if machine.spec.connected {
            let spec = self.client_spec(rt, &machine).await?;
            self.runner
                .ensure(
                    machine.id(),
                    CollectTask {
                        machine_id: machine.id().to_string(),
                        spec,
                        factory: Arc::clone(&self.factory),
                    },
                )
                .await;
        } else {
            self.runner.stop(machine.id()).await;
        }

        self.update_presence_labels(rt, &machine).await?;
        Ok(ReconcileOutcome::Done)
    }

    async fn run_hook(&self, rt: QRuntime, cancel: CancellationToken) -> Result<()> {
        let Some(mut events) = self.events_rx.lock().await.take() else {
            return Ok(());
        };
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                () = cancel.cancelled() => return Ok(()),
            };
            let Some(event) = event else {
                return Ok(());
            };
            let result = rt
                .create_or_modify::<MachineStatusSpec, _, _>(
                    &event.machine_id,
                    MachineStatusSpec::default,
                    |status| {
                        fold_sample(status, &event.sample);
                        Ok(())
                    },
                )
                .await;
            if let Err(err) = result {
                warn!(machine = %event.machine_id, %err, "failed to write machine status");
            }
        }
    }

    async fn shutdown_hook(&self) {
        self.runner.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::SchematicInfo;

    fn sample_with_schematic(id: &str, version: &str) -> MachineStatusSample {
        MachineStatusSample {
            talos_version: version.to_string(),
            schematic: Some(SchematicInfo {
                id: id.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_fold_preserves_one_shot_fields() {
        let mut status = Resource::new("m-1", MachineStatusSpec::default());

        fold_sample(&mut status, &sample_with_schematic("schematic-a", "1.7.5"));
        assert_eq!(status.spec.initial_talos_version, "1.7.5");
        assert_eq!(
            status.spec.schematic.as_ref().unwrap().initial_schematic,
            "schematic-a"
        );

        fold_sample(&mut status, &sample_with_schematic("schematic-b", "1.7.6"));
        assert_eq!(status.spec.talos_version, "1.7.6");
        assert_eq!(status.spec.initial_talos_version, "1.7.5");
        assert_eq!(status.spec.schematic.as_ref().unwrap().id, "schematic-b");
        assert_eq!(
            status.spec.schematic.as_ref().unwrap().initial_schematic,
            "schematic-a"
        );
    }

    #[test]
    fn test_fold_mirrors_image_labels_once() {
        let mut status = Resource::new("m-1", MachineStatusSpec::default());
        let mut sample = MachineStatusSample::default();
        sample.image_labels = [("env", "prod")].into_iter().collect();

        fold_sample(&mut status, &sample);
        let key = format!("{}env", label::IMAGE_LABEL_PREFIX);
        assert_eq!(status.metadata.labels.get(&key), Some("prod"));

        // A second sample with different image labels does not overwrite.
        let mut sample2 = MachineStatusSample::default();
        sample2.image_labels = [("env", "dev")].into_iter().collect();
        fold_sample(&mut status, &sample2);
        assert_eq!(status.metadata.labels.get(&key), Some("prod"));
        assert_eq!(status.spec.image_labels.get("env"), Some("prod"));
    }

    #[test]
    fn test_fold_toggles_state_labels() {
        let mut status = Resource::new("m-1", MachineStatusSpec::default());

        let mut sample = MachineStatusSample::default();
        sample.reporting_events = true;
        fold_sample(&mut status, &sample);
        assert!(status.metadata.labels.contains(label::REPORTING_EVENTS));

        sample.reporting_events = false;
        sample.schematic = Some(SchematicInfo {
            invalid: true,
            ..Default::default()
        });
        fold_sample(&mut status, &sample);
        assert!(!status.metadata.labels.contains(label::REPORTING_EVENTS));
        assert!(status.metadata.labels.contains(label::INVALID_STATE));
    }
}
