//! Background reaper enforcing the maximum session duration.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;

use crate::allocator::JobAllocator;
use crate::error::AllocatorError;
use crate::registry::Registry;

/// Periodically destroys jobs whose planned expiry has passed.
///
/// Failures never stop the loop: a row that cannot be destroyed or deleted is
/// logged and picked up again on the next sweep, so a destroy-then-delete
/// that half-failed is retried until the row is gone.
pub struct Reaper {
    registry: Arc<dyn Registry>,
    allocator: Arc<dyn JobAllocator>,
    period: Duration,
}

impl Reaper {
    pub fn new(
        registry: Arc<dyn Registry>,
        allocator: Arc<dyn JobAllocator>,
        period: Duration,
    ) -> Self {
        Self {
            registry,
            allocator,
            period,
        }
    }

    /// Run the reap loop until `shutdown` fires.
    ///
    /// Shutdown is honored during the sleep and between rows; an in-flight
    /// destroy call is awaited, never torn down.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        tracing::info!("reaper sweeping every {:?}", self.period);

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh process does
        // not sweep before it finished starting up.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }
            if self.sweep(&mut shutdown).await.is_break() {
                break;
            }
        }

        tracing::info!("reaper stopped");
    }

    /// One pass over the registry. Returns `Break` when shutdown fired.
    pub(crate) async fn sweep(&self, shutdown: &mut oneshot::Receiver<()>) -> ControlFlow<()> {
        let jobs = match self.registry.list().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("reaper cannot list jobs: {e}");
                return ControlFlow::Continue(());
            }
        };

        let now = Utc::now();
        for job in jobs.iter().filter(|job| job.is_expired(now)) {
            if !matches!(
                shutdown.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            ) {
                return ControlFlow::Break(());
            }
            self.reap_one(&job.id).await;
        }

        ControlFlow::Continue(())
    }

    async fn reap_one(&self, id: &str) {
        match self.allocator.destroy_job(id).await {
            Ok(()) => {}
            // Nothing left to destroy: the task is already gone, or this
            // allocator variant cannot destroy at all and the cluster
            // enforces its own wall-clock limit. The row still has to go.
            Err(AllocatorError::JobNotFound { .. } | AllocatorError::Unsupported { .. }) => {}
            Err(e) => {
                tracing::error!("failed to destroy expired job {id}: {e}");
                return;
            }
        }

        if let Err(e) = self.registry.delete(id).await {
            tracing::error!("failed to delete reaped job {id}: {e}");
            return;
        }

        tracing::info!("reaped expired job {id}");
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Mutex;

    use crate::allocator::JobDetails;
    use crate::error::{AllocatorError, RegistryError};
    use crate::registry::memory::MemoryRegistry;
    use crate::registry::JobRecord;

    use super::*;

    /// Allocator recording destroy calls, optionally failing them.
    #[derive(Default)]
    struct StubAllocator {
        destroyed: Mutex<Vec<String>>,
        fail_destroy: Option<fn(&str) -> AllocatorError>,
    }

    #[async_trait::async_trait]
    impl JobAllocator for StubAllocator {
        async fn create_job(
            &self,
            _token: &str,
            _payload: &serde_json::Value,
        ) -> Result<String, AllocatorError> {
            unreachable!("the reaper never creates jobs")
        }

        async fn destroy_job(&self, job_id: &str) -> Result<(), AllocatorError> {
            self.destroyed.lock().await.push(job_id.to_string());
            match self.fail_destroy {
                Some(fail) => Err(fail(job_id)),
                None => Ok(()),
            }
        }

        async fn get_job_details(
            &self,
            _token: &str,
            _job_id: &str,
        ) -> Result<JobDetails, AllocatorError> {
            unreachable!("the reaper never asks for details")
        }

        async fn close(&self) {}
    }

    fn expired(id: &str) -> JobRecord {
        let mut record = JobRecord::new(id, "alice@example.com", chrono::Duration::hours(4));
        record.start_time -= chrono::Duration::hours(5);
        record.end_time -= chrono::Duration::hours(5);
        record
    }

    async fn rig(allocator: StubAllocator) -> (Reaper, Arc<MemoryRegistry>, Arc<StubAllocator>) {
        let registry = Arc::new(MemoryRegistry::new());
        let allocator = Arc::new(allocator);
        let reaper = Reaper::new(
            registry.clone(),
            allocator.clone(),
            Duration::from_secs(10),
        );
        (reaper, registry, allocator)
    }

    #[tokio::test]
    async fn expired_jobs_are_destroyed_once_and_deleted() {
        let (reaper, registry, allocator) = rig(StubAllocator::default()).await;
        registry.insert(&expired("old")).await.unwrap();
        registry
            .insert(&JobRecord::new(
                "fresh",
                "alice@example.com",
                chrono::Duration::hours(4),
            ))
            .await
            .unwrap();

        let (_stop, mut signal) = oneshot::channel::<()>();
        assert!(reaper.sweep(&mut signal).await.is_continue());

        assert_eq!(*allocator.destroyed.lock().await, vec!["old"]);
        assert!(matches!(
            registry.get("old").await,
            Err(RegistryError::NotFound { .. })
        ));
        // The fresh job survives untouched.
        assert!(registry.get("fresh").await.is_ok());
    }

    #[tokio::test]
    async fn unsupported_destroy_still_deletes_the_row() {
        let (reaper, registry, _allocator) = rig(StubAllocator {
            fail_destroy: Some(|_| AllocatorError::Unsupported {
                operation: "destroy_job",
            }),
            ..Default::default()
        })
        .await;
        registry.insert(&expired("old")).await.unwrap();

        let (_stop, mut signal) = oneshot::channel::<()>();
        reaper.sweep(&mut signal).await;

        assert!(registry.get("old").await.is_err());
    }

    #[tokio::test]
    async fn destroy_failures_keep_the_row_for_the_next_sweep() {
        let (reaper, registry, allocator) = rig(StubAllocator {
            fail_destroy: Some(|id| AllocatorError::Internal(format!("cluster hiccup on {id}"))),
            ..Default::default()
        })
        .await;
        registry.insert(&expired("old")).await.unwrap();

        let (_stop, mut signal) = oneshot::channel::<()>();
        reaper.sweep(&mut signal).await;

        assert_eq!(*allocator.destroyed.lock().await, vec!["old"]);
        assert!(registry.get("old").await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_breaks_the_sweep_before_the_next_row() {
        let (reaper, registry, allocator) = rig(StubAllocator::default()).await;
        registry.insert(&expired("old")).await.unwrap();

        let (stop, mut signal) = oneshot::channel::<()>();
        stop.send(()).unwrap();

        assert!(reaper.sweep(&mut signal).await.is_break());
        assert!(allocator.destroyed.lock().await.is_empty());
        assert!(registry.get("old").await.is_ok());
    }

    #[tokio::test]
    async fn run_exits_promptly_on_shutdown() {
        let (reaper, _registry, _allocator) = rig(StubAllocator::default()).await;
        let (stop, signal) = oneshot::channel::<()>();

        let handle = tokio::spawn(reaper.run(signal));
        stop.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper ignored shutdown")
            .unwrap();
    }
}
