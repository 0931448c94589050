//! Durable job registry shared by the scheduler and the proxy.
//!
//! One logical table maps a job id to its owner, its lifetime, and the
//! backend host it runs on. A row exists exactly as long as the control
//! plane considers the job live: `start` inserts it, the first successful
//! `status` records the host, `stop` or the reaper deletes it.

mod dynamo;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use dynamo::DynamoRegistry;
pub use postgres::PostgresRegistry;

use crate::config::RegistryConfig;
use crate::error::RegistryError;

/// One row of the jobs table.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: String,
    /// Owner identifier (email, or the sandbox sentinel when auth is off).
    pub user: String,
    pub start_time: DateTime<Utc>,
    /// Planned expiry enforced by the reaper.
    pub end_time: DateTime<Utc>,
    /// Backend address; empty until the allocator reports readiness.
    pub host: String,
}

impl JobRecord {
    /// A record starting now and expiring after `duration`.
    pub fn new(id: impl Into<String>, user: impl Into<String>, duration: chrono::Duration) -> Self {
        let start_time = Utc::now();
        Self {
            id: id.into(),
            user: user.into(),
            start_time,
            end_time: start_time + duration,
            host: String::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.host.is_empty()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_time <= now
    }
}

/// Storage contract for the jobs table.
///
/// Implementations take a fresh connection (or equivalent) per call; nothing
/// is held across awaits in the caller.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Insert a new row. Fails with [`RegistryError::Duplicate`] when the id
    /// is already registered.
    async fn insert(&self, job: &JobRecord) -> Result<(), RegistryError>;

    /// Fetch a row by id. Fails with [`RegistryError::NotFound`] on a miss.
    async fn get(&self, id: &str) -> Result<JobRecord, RegistryError>;

    /// All rows, in no particular order.
    async fn list(&self) -> Result<Vec<JobRecord>, RegistryError>;

    /// Record the backend host for a job. Idempotent.
    async fn update_host(&self, id: &str, host: &str) -> Result<(), RegistryError>;

    /// Delete a row. Deleting an absent row is not an error.
    async fn delete(&self, id: &str) -> Result<(), RegistryError>;

    /// Create the schema when it does not exist yet.
    async fn ensure_schema(&self) -> Result<(), RegistryError>;

    /// Drop and recreate the schema.
    async fn recreate_schema(&self) -> Result<(), RegistryError>;
}

/// Open the registry backend selected by config.
pub async fn open(config: &RegistryConfig) -> Result<Arc<dyn Registry>, RegistryError> {
    match config {
        RegistryConfig::Postgres(postgres) => {
            Ok(Arc::new(PostgresRegistry::connect(postgres).await?))
        }
        RegistryConfig::DynamoDb(dynamo) => Ok(Arc::new(DynamoRegistry::connect(dynamo).await)),
    }
}

/// Parse a stored RFC 3339 timestamp back into UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RegistryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RegistryError::Backend(format!("bad timestamp {raw:?}: {e}")))
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory registry used by the test suites of other modules.

    use std::collections::HashMap;

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryRegistry {
        jobs: Mutex<HashMap<String, JobRecord>>,
    }

    impl MemoryRegistry {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Registry for MemoryRegistry {
        async fn insert(&self, job: &JobRecord) -> Result<(), RegistryError> {
            let mut jobs = self.jobs.lock().await;
            if jobs.contains_key(&job.id) {
                return Err(RegistryError::Duplicate { id: job.id.clone() });
            }
            jobs.insert(job.id.clone(), job.clone());
            Ok(())
        }

        async fn get(&self, id: &str) -> Result<JobRecord, RegistryError> {
            self.jobs
                .lock()
                .await
                .get(id)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })
        }

        async fn list(&self) -> Result<Vec<JobRecord>, RegistryError> {
            Ok(self.jobs.lock().await.values().cloned().collect())
        }

        async fn update_host(&self, id: &str, host: &str) -> Result<(), RegistryError> {
            if let Some(job) = self.jobs.lock().await.get_mut(id) {
                job.host = host.to_string();
            }
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<(), RegistryError> {
            self.jobs.lock().await.remove(id);
            Ok(())
        }

        async fn ensure_schema(&self) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn recreate_schema(&self) -> Result<(), RegistryError> {
            self.jobs.lock().await.clear();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryRegistry;
    use super::*;

    #[test]
    fn record_expiry_is_start_plus_duration() {
        let record = JobRecord::new("j1", "alice@example.com", chrono::Duration::seconds(600));
        assert_eq!(record.end_time - record.start_time, chrono::Duration::seconds(600));
        assert!(!record.is_ready());
        assert!(!record.is_expired(record.start_time));
        assert!(record.is_expired(record.end_time));
    }

    #[test]
    fn timestamps_round_trip_through_rfc3339() {
        let record = JobRecord::new("j1", "alice@example.com", chrono::Duration::hours(4));
        let stored = record.end_time.to_rfc3339();
        assert_eq!(parse_timestamp(&stored).unwrap(), record.end_time);
    }

    #[test]
    fn garbage_timestamps_are_backend_errors() {
        assert!(matches!(
            parse_timestamp("yesterday-ish"),
            Err(RegistryError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_insert_fails() {
        let registry = MemoryRegistry::new();
        let record = JobRecord::new("j1", "alice@example.com", chrono::Duration::hours(1));
        registry.insert(&record).await.unwrap();
        assert!(matches!(
            registry.insert(&record).await,
            Err(RegistryError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let registry = MemoryRegistry::new();
        let record = JobRecord::new("j1", "alice@example.com", chrono::Duration::hours(1));
        registry.insert(&record).await.unwrap();
        registry.delete("j1").await.unwrap();
        assert!(matches!(
            registry.get("j1").await,
            Err(RegistryError::NotFound { .. })
        ));
        // A second delete is a no-op, not an error.
        registry.delete("j1").await.unwrap();
    }
}
