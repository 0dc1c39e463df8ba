// SPDX-License-Identifier: MIT OR Apache-2.0

//! The universal resource model.
//!
//! Every piece of state the controllers operate on is a [`Resource`]: typed
//! spec plus [`Metadata`] (identity, version, phase, labels, annotations,
//! finalizers, owner). The store and the runtime move resources around in
//! type-erased form as [`DynResource`]; controllers work with the typed view.

mod labels;

pub use labels::{LabelQuery, LabelTerm, Labels};

use chrono::{DateTime, Utc};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Resource namespaces used by the core.
pub mod ns {
    /// The vast majority of resources.
    pub const DEFAULT: &str = "default";
    /// Resources owned by external infrastructure-provider adapters.
    pub const INFRA_PROVIDER: &str = "infra-provider";
    /// Resources recomputed on every run; never survive a restart.
    pub const EPHEMERAL: &str = "ephemeral";
    /// Per-resource rollups consumed by the metrics pipeline.
    pub const METRICS: &str = "metrics";
}

/// Lifecycle phase of a resource.
///
/// The only transition is Running → TearingDown; a resource never comes
/// back. A TearingDown resource is destroyable once its finalizers are gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Running,
    TearingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running => write!(f, "running"),
            Phase::TearingDown => write!(f, "tearingDown"),
        }
    }
}

/// A typed resource spec.
///
/// `KIND` names the resource type; `NAMESPACE` is the namespace the type
/// lives in (most types live in [`ns::DEFAULT`]).
pub trait ResourceSpec: Clone + PartialEq + Send + Sync + 'static {
    const KIND: &'static str;
    const NAMESPACE: &'static str = ns::DEFAULT;
}

/// Reference to a resource type within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KindRef {
    pub namespace: String,
    pub kind: String,
}

impl KindRef {
    /// Kind reference for a spec type in its declared namespace.
    #[must_use]
    pub fn of<S: ResourceSpec>() -> Self {
        Self {
            namespace: S::NAMESPACE.to_string(),
            kind: S::KIND.to_string(),
        }
    }
}

impl fmt::Display for KindRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.kind)
    }
}

/// Full identity of a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePointer {
    pub namespace: String,
    pub kind: String,
    pub id: String,
}

impl ResourcePointer {
    /// Pointer to a resource of a spec type in its declared namespace.
    #[must_use]
    pub fn new<S: ResourceSpec>(id: impl Into<String>) -> Self {
        Self {
            namespace: S::NAMESPACE.to_string(),
            kind: S::KIND.to_string(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn kind_ref(&self) -> KindRef {
        KindRef {
            namespace: self.namespace.clone(),
            kind: self.kind.clone(),
        }
    }

    /// True when the pointer refers to the given spec type.
    #[must_use]
    pub fn is<S: ResourceSpec>(&self) -> bool {
        self.kind == S::KIND && self.namespace == S::NAMESPACE
    }
}

impl fmt::Display for ResourcePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.id)
    }
}

/// Metadata shared by every resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub namespace: String,
    pub kind: String,
    pub id: String,
    /// Monotonic per-ID version. Compared, never interpreted.
    pub version: u64,
    pub phase: Phase,
    /// Controller that exclusively writes this resource, or empty for shared.
    pub owner: String,
    pub labels: Labels,
    pub annotations: Labels,
    /// Ordered set of controller names blocking destruction.
    pub finalizers: Vec<String>,
    pub created: DateTime<Utc>,
}

impl Metadata {
    /// Fresh metadata for a spec type. Version 0 until the store accepts it.
    #[must_use]
    pub fn new<S: ResourceSpec>(id: impl Into<String>) -> Self {
        Self {
            namespace: S::NAMESPACE.to_string(),
            kind: S::KIND.to_string(),
            id: id.into(),
            version: 0,
            phase: Phase::Running,
            owner: String::new(),
            labels: Labels::new(),
            annotations: Labels::new(),
            finalizers: Vec::new(),
            created: Utc::now(),
        }
    }

    #[must_use]
    pub fn pointer(&self) -> ResourcePointer {
        ResourcePointer {
            namespace: self.namespace.clone(),
            kind: self.kind.clone(),
            id: self.id.clone(),
        }
    }

    #[must_use]
    pub fn is_tearing_down(&self) -> bool {
        self.phase == Phase::TearingDown
    }

    #[must_use]
    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers.iter().any(|f| f == name)
    }
}

/// A typed resource: metadata plus spec.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource<S> {
    pub metadata: Metadata,
    pub spec: S,
}

impl<S: ResourceSpec> Resource<S> {
    /// Create a new Running resource with fresh metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, spec: S) -> Self {
        Self {
            metadata: Metadata::new::<S>(id),
            spec,
        }
    }

    #[must_use]
    pub fn pointer(&self) -> ResourcePointer {
        self.metadata.pointer()
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Erase the spec type for storage.
    #[must_use]
    pub fn into_dyn(self) -> DynResource {
        DynResource {
            metadata: self.metadata,
            spec: Arc::new(self.spec),
        }
    }
}

trait AnySpec: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn eq_spec(&self, other: &dyn AnySpec) -> bool;
}

impl<S: ResourceSpec> AnySpec for S {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_spec(&self, other: &dyn AnySpec) -> bool {
        other.as_any().downcast_ref::<S>() == Some(self)
    }
}

/// A type-erased resource as held by the store.
#[derive(Clone)]
pub struct DynResource {
    pub metadata: Metadata,
    spec: Arc<dyn AnySpec>,
}

impl DynResource {
    /// Recover the typed view. Returns `None` when the kind does not match.
    #[must_use]
    pub fn typed<S: ResourceSpec>(&self) -> Option<Resource<S>> {
        if self.metadata.kind != S::KIND || self.metadata.namespace != S::NAMESPACE {
            return None;
        }
        let spec = self.spec.as_any().downcast_ref::<S>()?.clone();
        Some(Resource {
            metadata: self.metadata.clone(),
            spec,
        })
    }

    /// Spec equality across the type-erasure boundary.
    #[must_use]
    pub fn spec_eq(&self, other: &DynResource) -> bool {
        self.spec.eq_spec(other.spec.as_ref())
    }

    #[must_use]
    pub fn pointer(&self) -> ResourcePointer {
        self.metadata.pointer()
    }
}

impl fmt::Debug for DynResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynResource")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
