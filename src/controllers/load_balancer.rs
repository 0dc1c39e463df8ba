// SPDX-License-Identifier: MIT OR Apache-2.0

//! `Cluster` → `LoadBalancerConfig`: the endpoints machines are pointed at.

use crate::error::Result;
use crate::patterns::{QTransform, TransformOutcome};
use crate::resource::Resource;
use crate::resources::label;
use crate::resources::{ClusterSpec, LoadBalancerConfigSpec};
use crate::runtime::QRuntime;
use async_trait::async_trait;

/// Base domain the per-cluster load balancers are published under.
const LB_DOMAIN: &str = "fleet.local";

pub struct LoadBalancerConfigController;

#[async_trait]
impl QTransform for LoadBalancerConfigController {
    type Input = ClusterSpec;
    type Output = LoadBalancerConfigSpec;

    fn name(&self) -> &'static str {
        "LoadBalancerConfigController"
    }

    async fn transform(
        &self,
        _rt: &QRuntime,
        input: &Resource<ClusterSpec>,
        output: &mut Resource<LoadBalancerConfigSpec>,
    ) -> Result<TransformOutcome> {
        output.metadata.labels.set(label::CLUSTER, input.id());
        output.spec.endpoint = format!("https://lb.{}.{LB_DOMAIN}:6443", input.id());
        output.spec.siderolink_endpoint = format!("https://siderolink.{LB_DOMAIN}:8090");
        Ok(TransformOutcome::Modified)
    }
}
