//! Cluster-task allocator backed by AWS ECS.
//!
//! A job is one ECS task. Readiness means the task's first container has a
//! private IP and answers the health probe on it; until then `status` keeps
//! reporting not-ready.

use async_trait::async_trait;
use aws_sdk_ecs::Client;
use aws_sdk_ecs::types::{
    AwsVpcConfiguration, CapacityProviderStrategyItem, ContainerOverride, KeyValuePair,
    NetworkConfiguration, TaskOverride,
};
use serde_json::Value;

use crate::config::EcsConfig;
use crate::error::AllocatorError;

use super::{JobAllocator, JobDetails};

/// Length of the id segment in a task ARN.
const TASK_ID_LEN: usize = 32;

pub struct EcsAllocator {
    ecs: Client,
    http: reqwest::Client,
    config: EcsConfig,
}

impl EcsAllocator {
    /// Credentials and region come from the default AWS provider chain.
    pub async fn new(http: reqwest::Client, config: EcsConfig) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self {
            ecs: Client::new(&sdk_config),
            http,
            config,
        }
    }

    async fn probe_health(&self, ip: &str) -> bool {
        let url = format!("http://{}:{}/healthz", ip, self.config.health_port);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("health probe {url} failed: {e}");
                false
            }
        }
    }
}

/// The task id is the last ARN segment and is always 32 characters; anything
/// else means we are talking to something unexpected.
fn task_id_from_arn(arn: &str) -> Result<String, AllocatorError> {
    let id = arn.rsplit('/').next().unwrap_or_default();
    if id.len() != TASK_ID_LEN {
        return Err(AllocatorError::Internal(format!(
            "unexpected task arn {arn}"
        )));
    }
    Ok(id.to_string())
}

#[async_trait]
impl JobAllocator for EcsAllocator {
    /// Requires `payload.project`: it selects the data the task mounts.
    async fn create_job(&self, _token: &str, payload: &Value) -> Result<String, AllocatorError> {
        let project = payload
            .get("project")
            .and_then(Value::as_str)
            .filter(|project| !project.is_empty())
            .ok_or_else(|| AllocatorError::InvalidPayload("missing project".to_string()))?;

        let environment = [
            (
                "S3_BUCKET_PATH",
                format!("{}:/{}", self.config.bucket, project),
            ),
            (
                "FUSE_MOUNT_POINT",
                format!("{}/{}", self.config.mount_point, project),
            ),
        ];
        let container = ContainerOverride::builder()
            .name(&self.config.container)
            .set_environment(Some(
                environment
                    .into_iter()
                    .map(|(name, value)| KeyValuePair::builder().name(name).value(value).build())
                    .collect(),
            ))
            .build();

        let vpc = AwsVpcConfiguration::builder()
            .set_subnets(Some(self.config.subnets.clone()))
            .set_security_groups(Some(self.config.security_groups.clone()))
            .build()
            .map_err(|e| AllocatorError::Internal(e.to_string()))?;

        let strategy = CapacityProviderStrategyItem::builder()
            .capacity_provider(&self.config.capacity_provider)
            .build()
            .map_err(|e| AllocatorError::Internal(e.to_string()))?;

        let response = self
            .ecs
            .run_task()
            .cluster(&self.config.cluster)
            .task_definition(&self.config.task_definition)
            .capacity_provider_strategy(strategy)
            .network_configuration(
                NetworkConfiguration::builder()
                    .awsvpc_configuration(vpc)
                    .build(),
            )
            .overrides(TaskOverride::builder().container_overrides(container).build())
            .send()
            .await
            .map_err(|e| AllocatorError::AllocationFailed {
                reason: e.to_string(),
            })?;

        let task = response
            .tasks()
            .first()
            .ok_or_else(|| AllocatorError::AllocationFailed {
                reason: "run-task response contains no task".to_string(),
            })?;
        let arn = task
            .task_arn()
            .ok_or_else(|| AllocatorError::Internal("task without an ARN".to_string()))?;

        let job_id = task_id_from_arn(arn)?;
        tracing::info!("launched cluster task {job_id} for project {project}");
        Ok(job_id)
    }

    async fn destroy_job(&self, job_id: &str) -> Result<(), AllocatorError> {
        self.ecs
            .stop_task()
            .cluster(&self.config.cluster)
            .task(job_id)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("stop task {job_id} failed: {e}");
                AllocatorError::InvalidJob {
                    id: job_id.to_string(),
                }
            })?;
        tracing::info!("stopped cluster task {job_id}");
        Ok(())
    }

    async fn get_job_details(
        &self,
        _token: &str,
        job_id: &str,
    ) -> Result<JobDetails, AllocatorError> {
        let response = self
            .ecs
            .describe_tasks()
            .cluster(&self.config.cluster)
            .tasks(job_id)
            .send()
            .await
            .map_err(|e| AllocatorError::Internal(e.to_string()))?;

        let Some(task) = response.tasks().first() else {
            return Ok(JobDetails::default());
        };

        let ip = task
            .containers()
            .first()
            .and_then(|container| container.network_interfaces().first())
            .and_then(|interface| interface.private_ipv4_address());
        let Some(ip) = ip else {
            return Ok(JobDetails::default());
        };

        if !self.probe_health(ip).await {
            return Ok(JobDetails::default());
        }

        Ok(JobDetails {
            end_time: None,
            host: Some(ip.to_string()),
        })
    }

    async fn close(&self) {
        tracing::debug!("ECS allocator closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_is_last_arn_segment() {
        let arn = "arn:aws:ecs:eu-west-1:123456789012:task/viz_ecs_cluster/0123456789abcdef0123456789abcdef";
        assert_eq!(
            task_id_from_arn(arn).unwrap(),
            "0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn short_task_ids_are_rejected() {
        assert!(task_id_from_arn("arn:aws:ecs:task/cluster/deadbeef").is_err());
        assert!(task_id_from_arn("").is_err());
    }
}
