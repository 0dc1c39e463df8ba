// SPDX-License-Identifier: MIT OR Apache-2.0

//! Schematic ensurance.
//!
//! Whenever a machine reports a non-empty schematic ID, the image factory
//! must know it. The call is made once per observed change; the factory
//! side is idempotent.

use crate::clients::ImageFactoryClient;
use crate::error::Result;
use crate::resource::ResourcePointer;
use crate::resources::MachineStatusSpec;
use crate::runtime::{ControllerSettings, QController, QRuntime, ReconcileOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

const CONTROLLER_NAME: &str = "SchematicEnsurerController";

pub struct SchematicEnsurerController {
    factory: Arc<dyn ImageFactoryClient>,
    // machine id -> last schematic pushed to the factory
    ensured: Mutex<HashMap<String, String>>,
}

impl SchematicEnsurerController {
    #[must_use]
    pub fn new(factory: Arc<dyn ImageFactoryClient>) -> Self {
        Self {
            factory,
            ensured: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl QController for SchematicEnsurerController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn settings(&self) -> ControllerSettings {
        ControllerSettings::builder()
            .primary::<MachineStatusSpec>()
            .build()
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &ResourcePointer) -> Result<ReconcileOutcome> {
        let Some(status) = rt.get::<MachineStatusSpec>(&ptr.id).await? else {
            self.ensured.lock().unwrap().remove(&ptr.id);
            return Ok(ReconcileOutcome::Done);
        };

        let Some(schematic_id) = status
            .spec
            .schematic
            .as_ref()
            .map(|s| s.id.clone())
            .filter(|id| !id.is_empty())
        else {
            return Ok(ReconcileOutcome::Done);
        };

        let already_ensured = self
            .ensured
            .lock()
            .unwrap()
            .get(&ptr.id)
            .is_some_and(|last| *last == schematic_id);
        if already_ensured {
            return Ok(ReconcileOutcome::Done);
        }

        let canonical = self.factory.ensure_schematic(&schematic_id).await?;
        debug!(machine = %ptr.id, schematic = %schematic_id, %canonical, "schematic ensured");
        self.ensured
            .lock()
            .unwrap()
            .insert(ptr.id.clone(), schematic_id);
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use crate::resources::SchematicInfo;
    use crate::store::{MemoryStore, Store};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageFactoryClient for CountingFactory {
        async fn ensure_schematic(&self, schematic_id: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(schematic_id.to_string())
        }
    }

    async fn write_status(store: &Arc<dyn Store>, id: &str, schematic: &str) {
        use crate::store::StoreExt;
        store
            .create_or_modify::<MachineStatusSpec, _, _>(
                CONTROLLER_NAME,
                id,
                MachineStatusSpec::default,
                |status| {
                    status.spec.schematic = Some(SchematicInfo {
                        id: schematic.to_string(),
                        ..Default::default()
                    });
                    Ok(())
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_once_per_observed_change() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let factory = Arc::new(CountingFactory {
            calls: AtomicUsize::new(0),
        });
        let controller = SchematicEnsurerController::new(Arc::clone(&factory) as Arc<dyn ImageFactoryClient>);
        let rt = QRuntime::new(Arc::clone(&store), CONTROLLER_NAME);
        let ptr = ResourcePointer::new::<MachineStatusSpec>("m-1");

        write_status(&store, "m-1", "schematic-a").await;
        controller.reconcile(&rt, &ptr).await.unwrap();
        controller.reconcile(&rt, &ptr).await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);

        write_status(&store, "m-1", "schematic-b").await;
        controller.reconcile(&rt, &ptr).await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_schematic_is_ignored() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let factory = Arc::new(CountingFactory {
            calls: AtomicUsize::new(0),
        });
        let controller = SchematicEnsurerController::new(Arc::clone(&factory) as Arc<dyn ImageFactoryClient>);
        let rt = QRuntime::new(Arc::clone(&store), CONTROLLER_NAME);
        let ptr = ResourcePointer::new::<MachineStatusSpec>("m-1");

        store
            .create(Resource::new("m-1", MachineStatusSpec::default()).into_dyn())
            .await
            .unwrap();
        controller.reconcile(&rt, &ptr).await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
    }
}
