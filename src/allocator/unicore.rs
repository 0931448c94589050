//! Job-submission allocator speaking the UNICORE REST API.
//!
//! Jobs are submitted from named use-case templates; the backend host is
//! discovered by reading the job's stdout, which the startup script ends with
//! a `HOSTNAME=...` line. This variant cannot destroy jobs: the batch system
//! enforces its own wall-clock limit.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header;
use serde_json::Value;

use crate::config::UnicoreConfig;
use crate::error::{AllocatorError, ConfigError};

use super::{JobAllocator, JobDetails};

pub struct UnicoreAllocator {
    http: reqwest::Client,
    config: UnicoreConfig,
    use_cases: HashMap<String, Value>,
    hostname_pattern: Regex,
}

impl UnicoreAllocator {
    pub fn new(http: reqwest::Client, config: UnicoreConfig) -> Result<Self, ConfigError> {
        let use_cases = match &config.use_cases_file {
            Some(path) => load_use_cases(path)?,
            None => builtin_use_cases(),
        };
        tracing::info!(
            "unicore allocator with {} use case(s): {:?}",
            use_cases.len(),
            use_cases.keys().collect::<Vec<_>>()
        );

        let pattern = format!(r"[A-Za-z0-9_]*\.{}", regex::escape(&config.dns_suffix));
        let hostname_pattern = Regex::new(&pattern).map_err(|e| ConfigError::Invalid {
            key: "VIZGATE_UNICORE_DNS_SUFFIX",
            reason: e.to_string(),
        })?;

        Ok(Self {
            http,
            config,
            use_cases,
            hostname_pattern,
        })
    }

    async fn fetch_stdout(&self, token: &str, job_id: &str) -> Result<String, AllocatorError> {
        let url = format!(
            "{}/storages/{}-uspace/files/stdout",
            self.config.endpoint, job_id
        );
        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, token)
            .header(header::ACCEPT, "application/octet-stream")
            .send()
            .await
            .map_err(|e| AllocatorError::Internal(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(AllocatorError::JobNotFound {
                id: job_id.to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AllocatorError::Internal(e.to_string()))?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    fn extract_hostname(&self, stdout: &str) -> Option<String> {
        if !stdout.contains("HOSTNAME") {
            return None;
        }
        self.hostname_pattern
            .find(stdout)
            .map(|found| found.as_str().to_string())
    }
}

#[async_trait]
impl JobAllocator for UnicoreAllocator {
    /// Requires `payload.usecase`: the name of the template to submit.
    async fn create_job(&self, token: &str, payload: &Value) -> Result<String, AllocatorError> {
        let name = payload
            .get("usecase")
            .and_then(Value::as_str)
            .ok_or_else(|| AllocatorError::InvalidPayload("missing usecase".to_string()))?;
        let template = self
            .use_cases
            .get(name)
            .ok_or_else(|| AllocatorError::InvalidPayload(format!("unknown use case {name}")))?;

        let url = format!("{}/jobs", self.config.endpoint);
        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, token)
            .header(header::ACCEPT, "application/json")
            .json(template)
            .send()
            .await
            .map_err(|e| AllocatorError::AllocationFailed {
                reason: e.to_string(),
            })?;

        if response.status().is_client_error() || response.status().is_server_error() {
            tracing::error!("job submission returned {}", response.status());
            return Err(AllocatorError::AllocationFailed {
                reason: format!("job endpoint returned {}", response.status()),
            });
        }

        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                tracing::error!("job submission response is missing the Location header");
                AllocatorError::AllocationFailed {
                    reason: "missing Location header".to_string(),
                }
            })?;

        job_id_from_location(location).ok_or_else(|| AllocatorError::AllocationFailed {
            reason: format!("unparseable Location {location}"),
        })
    }

    async fn destroy_job(&self, _job_id: &str) -> Result<(), AllocatorError> {
        Err(AllocatorError::Unsupported {
            operation: "destroy_job",
        })
    }

    async fn get_job_details(
        &self,
        token: &str,
        job_id: &str,
    ) -> Result<JobDetails, AllocatorError> {
        let url = format!("{}/jobs/{}/details", self.config.endpoint, job_id);
        let request = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, token)
            .header(header::ACCEPT, "application/json");

        let data: Value = match request.send().await {
            Ok(response) => match response.json().await {
                Ok(data) => data,
                Err(e) => {
                    tracing::error!("job status check for {job_id} returned garbage: {e}");
                    return Err(AllocatorError::JobNotFound {
                        id: job_id.to_string(),
                    });
                }
            },
            Err(e) => {
                tracing::error!("job status check for {job_id} failed: {e}");
                return Err(AllocatorError::JobNotFound {
                    id: job_id.to_string(),
                });
            }
        };

        let Some(state) = data.get("JobState").and_then(Value::as_str) else {
            return Ok(JobDetails::default());
        };
        if state != "RUNNING" {
            return Ok(JobDetails::default());
        }

        let end_time = data
            .get("EndTime")
            .and_then(Value::as_str)
            .and_then(parse_end_time);

        let stdout = match self.fetch_stdout(token, job_id).await {
            Ok(stdout) => stdout,
            Err(AllocatorError::JobNotFound { id }) => {
                return Err(AllocatorError::JobNotFound { id });
            }
            Err(e) => {
                // Running, but stdout is not readable yet.
                tracing::debug!("stdout for job {job_id} not readable yet: {e}");
                return Ok(JobDetails {
                    end_time,
                    host: None,
                });
            }
        };

        Ok(JobDetails {
            end_time,
            host: self.extract_hostname(&stdout),
        })
    }

    async fn close(&self) {
        tracing::debug!("unicore allocator closed");
    }
}

fn job_id_from_location(location: &str) -> Option<String> {
    let id = location.trim_end_matches('/').rsplit('/').next()?;
    if id.is_empty() {
        return None;
    }
    Some(id.to_string())
}

/// UNICORE reports timestamps with and without a colon in the offset.
fn parse_end_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| tracing::debug!("unparseable EndTime {raw:?}: {e}"))
        .ok()
}

fn load_use_cases(path: &Path) -> Result<HashMap<String, Value>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
        key: "VIZGATE_USE_CASES_FILE",
        reason: e.to_string(),
    })?;
    let entries: Vec<Value> = serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid {
        key: "VIZGATE_USE_CASES_FILE",
        reason: e.to_string(),
    })?;
    index_use_cases(entries).ok_or(ConfigError::Invalid {
        key: "VIZGATE_USE_CASES_FILE",
        reason: "every use case needs a string Name".to_string(),
    })
}

fn index_use_cases(entries: Vec<Value>) -> Option<HashMap<String, Value>> {
    entries
        .into_iter()
        .map(|entry| {
            let name = entry.get("Name")?.as_str()?.to_string();
            Some((name, entry))
        })
        .collect()
}

/// Default template table: one standard session starting the renderer and the
/// backend, then echoing the node hostname for the readiness check.
fn builtin_use_cases() -> HashMap<String, Value> {
    let entries = vec![serde_json::json!({
        "Name": "default",
        "Resources": {
            "Nodes": 1,
            "Runtime": "14400s",
            "Exclusive": "true",
        },
        "Executable": "#!/bin/bash\n\
            export RENDERER_PORT=5000\n\
            export BACKEND_PORT=8000\n\
            \n\
            renderer-service --uri 0.0.0.0:${RENDERER_PORT} &\n\
            \n\
            while ! nc -z localhost ${RENDERER_PORT}; do sleep 1; done\n\
            \n\
            backend-service --host 0.0.0.0 --port ${BACKEND_PORT} &\n\
            BACKEND_PID=$!\n\
            \n\
            while ! nc -z localhost ${BACKEND_PORT}; do sleep 1; done\n\
            \n\
            echo \"HOSTNAME=$(hostname -f)\"\n\
            \n\
            wait ${BACKEND_PID}\n",
    })];
    // The builtin table always has names; unreachable fallback keeps this
    // infallible.
    index_use_cases(entries).unwrap_or_default()
}
