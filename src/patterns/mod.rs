// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reconcile patterns layered on the controller runtime.
//!
//! - [`qtransform`] — 1:1 input→output controllers with lifecycle handling
//! - [`cleanup`] — teardown cascades over dependent resources
//! - [`task`] — one long-running worker per primary, restarted on spec change
//! - [`mappers`] — common input→primary mapping combinators

pub mod cleanup;
pub mod mappers;
pub mod qtransform;
pub mod task;

pub use cleanup::{CleanupController, CleanupHandler, CleanupOutcome, DestroyChildren};
pub use qtransform::{QTransform, QTransformController, TransformOutcome};
pub use task::{FleetTask, TaskRunner};
