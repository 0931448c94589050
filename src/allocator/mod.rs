//! Allocation of compute jobs on the remote cluster.
//!
//! The scheduler only sees the [`JobAllocator`] capability; which cluster is
//! behind it (ECS task launch, UNICORE job submission, or the in-process fake)
//! is decided once at startup.

mod ecs;
mod fake;
mod unicore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use ecs::EcsAllocator;
pub use fake::FakeAllocator;
pub use unicore::UnicoreAllocator;

use crate::config::AllocatorConfig;
use crate::error::{AllocatorError, ConfigError};

/// Transient read-model describing a job on the cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDetails {
    /// Planned expiry reported by the cluster, when it knows one.
    pub end_time: Option<DateTime<Utc>>,
    /// Backend address, once the job is reachable.
    pub host: Option<String>,
}

impl JobDetails {
    pub fn ready(&self) -> bool {
        self.host.is_some()
    }
}

/// Job lifecycle on the compute cluster.
#[async_trait]
pub trait JobAllocator: Send + Sync {
    /// Launch a job and return its cluster-issued id.
    ///
    /// `payload` is the request body the client sent to `/start`; each
    /// variant documents the fields it needs.
    async fn create_job(
        &self,
        token: &str,
        payload: &serde_json::Value,
    ) -> Result<String, AllocatorError>;

    /// Tear the job down on the cluster.
    async fn destroy_job(&self, job_id: &str) -> Result<(), AllocatorError>;

    /// Introspect a job's readiness and planned expiry.
    async fn get_job_details(
        &self,
        token: &str,
        job_id: &str,
    ) -> Result<JobDetails, AllocatorError>;

    /// Release any resources held by the allocator.
    async fn close(&self);
}

/// Build the allocator selected by config, sharing the process-wide HTTP
/// client for probes and REST calls.
pub async fn create_allocator(
    config: &AllocatorConfig,
    client: reqwest::Client,
) -> Result<Arc<dyn JobAllocator>, ConfigError> {
    match config {
        AllocatorConfig::Unicore(unicore) => Ok(Arc::new(UnicoreAllocator::new(
            client,
            unicore.clone(),
        )?)),
        AllocatorConfig::Ecs(ecs) => Ok(Arc::new(EcsAllocator::new(client, ecs.clone()).await)),
        AllocatorConfig::Test => Ok(Arc::new(FakeAllocator::new())),
    }
}
