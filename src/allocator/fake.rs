//! In-process allocator for the `TEST` configuration.
//!
//! Hands out fresh ids, pretends everything runs on localhost, and never
//! fails. Useful for local development without any cluster access.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AllocatorError;

use super::{JobAllocator, JobDetails};

#[derive(Default)]
pub struct FakeAllocator;

impl FakeAllocator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobAllocator for FakeAllocator {
    async fn create_job(
        &self,
        _token: &str,
        payload: &serde_json::Value,
    ) -> Result<String, AllocatorError> {
        // Same 32-character shape as a real cluster task id.
        let job_id = Uuid::new_v4().simple().to_string();
        tracing::info!("fake allocator created job {job_id} for payload {payload}");
        Ok(job_id)
    }

    async fn destroy_job(&self, job_id: &str) -> Result<(), AllocatorError> {
        tracing::info!("fake allocator destroyed job {job_id}");
        Ok(())
    }

    async fn get_job_details(
        &self,
        _token: &str,
        job_id: &str,
    ) -> Result<JobDetails, AllocatorError> {
        tracing::info!("fake allocator reporting job {job_id} ready");
        Ok(JobDetails {
            end_time: None,
            host: Some("localhost".to_string()),
        })
    }

    async fn close(&self) {
        tracing::info!("fake allocator closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_ids_look_like_task_ids() {
        let allocator = FakeAllocator::new();
        let id = allocator
            .create_job("Bearer t", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(id.len(), 32);

        let details = allocator.get_job_details("Bearer t", &id).await.unwrap();
        assert!(details.ready());
        assert_eq!(details.host.as_deref(), Some("localhost"));
    }
}
