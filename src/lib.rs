// SPDX-License-Identifier: MIT OR Apache-2.0

//! # talos-fleet-rs
//!
//! A typed, async reconciliation core for orchestrating fleets of
//! [Talos Linux](https://www.talos.dev/) machines into Kubernetes clusters.
//!
//! The crate is a resource-graph reconciler: many small, single-purpose
//! controllers react to declarative resource changes and converge observed
//! state to desired state — machine status collection, config generation
//! and rollout, rolling Talos upgrades, machine-set scaling, teardown
//! cascades and health aggregation.
//!
//! ## Features
//!
//! - **Queue-driven runtime** — per-controller concurrency, same-ID
//!   serialization, event coalescing, mapped inputs, exponential backoff
//! - **Reconcile patterns** — `qtransform` (1:1 with lifecycle), `cleanup`
//!   (teardown cascades), task-runner (one worker per resource)
//! - **Async-first** — built on `tokio`
//! - **Pluggable edges** — the resource store and the Talos / image-factory
//!   / discovery / Kubernetes clients are trait interfaces
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use talos_fleet_rs::config::FleetSettings;
//! use talos_fleet_rs::controllers::{self, ExternalClients};
//! use talos_fleet_rs::runtime::ControllerRuntime;
//! use talos_fleet_rs::store::MemoryStore;
//!
//! # async fn example(clients: ExternalClients) -> anyhow::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let mut runtime = ControllerRuntime::new(store);
//! controllers::register_all(&mut runtime, &clients, &FleetSettings::default());
//!
//! let running = runtime.start()?;
//! // ... feed resources, watch the graph converge ...
//! running.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`resource`] — the universal resource model (metadata, phases, labels)
//! - [`store`] — the consumed store contract and an in-memory implementation
//! - [`runtime`] — controller registration, dispatch and scheduling
//! - [`patterns`] — qtransform, cleanup, task-runner, mapper combinators
//! - [`resources`] — the typed specs of the orchestration graph
//! - [`controllers`] — the concrete controller graph
//! - [`clients`] — interfaces to Talos, the image factory, discovery, K8s
//! - [`config`] — tunables
//! - [`error`] — error types

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod clients;
pub mod config;
pub mod controllers;
pub mod error;
pub mod patterns;
pub mod resource;
pub mod resources;
pub mod runtime;
pub mod store;

pub use config::FleetSettings;
pub use error::{FleetError, Result};
pub use resource::{
    DynResource, KindRef, LabelQuery, Labels, Metadata, Phase, Resource, ResourcePointer,
    ResourceSpec,
};
pub use runtime::{
    ControllerRuntime, ControllerSettings, QController, QRuntime, ReconcileOutcome,
    RunningRuntime,
};
pub use store::{MemoryStore, Store, StoreExt};
