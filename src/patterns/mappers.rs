// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common input mappers.
//!
//! A mapper turns an event on a mapped input into the primary IDs a
//! controller must re-reconcile. The combinators here cover the shapes the
//! concrete controllers need: same-ID, follow-a-label, label-query fan-out
//! and the control-plane projection.

use crate::error::Result;
use crate::resource::{LabelQuery, Metadata, ResourcePointer, ResourceSpec};
use crate::resources::{label, MachineSetSpec};
use crate::runtime::Mapper;
use crate::store::{Store, StoreExt};
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;

struct SameId<P> {
    _primary: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P: ResourceSpec> Mapper for SameId<P> {
    async fn map(
        &self,
        _store: &Arc<dyn Store>,
        md: &Metadata,
    ) -> Result<Vec<ResourcePointer>> {
        Ok(vec![ResourcePointer::new::<P>(&md.id)])
    }
}

/// The input shares the primary's ID (different kind, same identity).
#[must_use]
pub fn same_id<P: ResourceSpec>() -> Arc<dyn Mapper> {
    Arc::new(SameId::<P> {
        _primary: PhantomData,
    })
}

struct ToLabelValue<P> {
    key: &'static str,
    _primary: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P: ResourceSpec> Mapper for ToLabelValue<P> {
    async fn map(
        &self,
        _store: &Arc<dyn Store>,
        md: &Metadata,
    ) -> Result<Vec<ResourcePointer>> {
        Ok(md
            .labels
            .get(self.key)
            .map(|id| vec![ResourcePointer::new::<P>(id)])
            .unwrap_or_default())
    }
}

/// The primary ID is the value of a label on the input. Inputs without the
/// label map to nothing.
#[must_use]
pub fn to_label_value<P: ResourceSpec>(key: &'static str) -> Arc<dyn Mapper> {
    Arc::new(ToLabelValue::<P> {
        key,
        _primary: PhantomData,
    })
}

/// Cluster-labeled input → the owning cluster.
#[must_use]
pub fn by_cluster_label<P: ResourceSpec>() -> Arc<dyn Mapper> {
    to_label_value::<P>(label::CLUSTER)
}

/// Machine-set-labeled input → the owning machine set.
#[must_use]
pub fn by_machine_set_label<P: ResourceSpec>() -> Arc<dyn Mapper> {
    to_label_value::<P>(label::MACHINE_SET)
}

type QueryFn = dyn Fn(&Metadata) -> Option<LabelQuery> + Send + Sync;

struct SelectByQuery<P> {
    query: Box<QueryFn>,
    _primary: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P: ResourceSpec> Mapper for SelectByQuery<P> {
    async fn map(
        &self,
        store: &Arc<dyn Store>,
        md: &Metadata,
    ) -> Result<Vec<ResourcePointer>> {
        let Some(query) = (self.query)(md) else {
            return Ok(Vec::new());
        };
        Ok(store
            .list_typed::<P>(&query)
            .await?
            .into_iter()
            .map(|res| res.pointer())
            .collect())
    }
}

/// Fan out to every primary matching a label query derived from the input.
#[must_use]
pub fn select<P: ResourceSpec>(
    query: impl Fn(&Metadata) -> Option<LabelQuery> + Send + Sync + 'static,
) -> Arc<dyn Mapper> {
    Arc::new(SelectByQuery::<P> {
        query: Box::new(query),
        _primary: PhantomData,
    })
}

/// Cluster-keyed input → every primary labeled with that cluster.
/// Used by per-machine controllers whose cluster-wide inputs (secrets, LB
/// config) change.
#[must_use]
pub fn cluster_to_members<P: ResourceSpec>() -> Arc<dyn Mapper> {
    select::<P>(|md| Some(LabelQuery::all().eq(label::CLUSTER, &md.id)))
}

/// Cluster-labeled input → the cluster's control-plane machine set.
#[must_use]
pub fn to_control_plane_machine_set() -> Arc<dyn Mapper> {
    select::<MachineSetSpec>(|md| {
        let cluster = md.labels.get(label::CLUSTER)?;
        Some(
            LabelQuery::all()
                .eq(label::CLUSTER, cluster)
                .has(label::ROLE_CONTROLPLANE),
        )
    })
}

struct NoneMapper;

#[async_trait]
impl Mapper for NoneMapper {
    async fn map(
        &self,
        _store: &Arc<dyn Store>,
        _md: &Metadata,
    ) -> Result<Vec<ResourcePointer>> {
        Ok(Vec::new())
    }
}

/// Maps nothing. Used when a type must only trigger reconciles through its
/// enclosing cluster.
#[must_use]
pub fn none() -> Arc<dyn Mapper> {
    Arc::new(NoneMapper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use crate::store::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct ParentSpec;

    impl ResourceSpec for ParentSpec {
        const KIND: &'static str = "Parents";
    }

    fn md_with(labels: &[(&str, &str)]) -> Metadata {
        let mut md = Metadata::new::<ParentSpec>("child-1");
        for (k, v) in labels {
            md.labels.set(*k, *v);
        }
        md
    }

    fn store() -> Arc<dyn Store> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_same_id() {
        let store = store();
        let pointers = same_id::<ParentSpec>()
            .map(&store, &md_with(&[]))
            .await
            .unwrap();
        assert_eq!(pointers, vec![ResourcePointer::new::<ParentSpec>("child-1")]);
    }

    #[tokio::test]
    async fn test_to_label_value() {
        let store = store();
        let mapper = by_cluster_label::<ParentSpec>();

        let pointers = mapper
            .map(&store, &md_with(&[(label::CLUSTER, "c1")]))
            .await
            .unwrap();
        assert_eq!(pointers, vec![ResourcePointer::new::<ParentSpec>("c1")]);

        let pointers = mapper.map(&store, &md_with(&[])).await.unwrap();
        assert!(pointers.is_empty());
    }

    #[tokio::test]
    async fn test_cluster_to_members() {
        let store = store();
        for id in ["m-1", "m-2"] {
            let mut res = Resource::new(id, ParentSpec);
            res.metadata.labels.set(label::CLUSTER, "c1");
            store.create(res.into_dyn()).await.unwrap();
        }
        let mut other = Resource::new("m-3", ParentSpec);
        other.metadata.labels.set(label::CLUSTER, "c2");
        store.create(other.into_dyn()).await.unwrap();

        let mut cluster_md = Metadata::new::<ParentSpec>("c1");
        cluster_md.id = "c1".to_string();
        let pointers = cluster_to_members::<ParentSpec>()
            .map(&store, &cluster_md)
            .await
            .unwrap();
        assert_eq!(pointers.len(), 2);
    }

    #[tokio::test]
    async fn test_none() {
        let store = store();
        assert!(none().map(&store, &md_with(&[])).await.unwrap().is_empty());
    }
}
