//! Job Manager - turns upstream notifications into versioned pool jobs
//!
//! Decides new-job vs new-block, hands out increasing job ids and keeps the set of
//! jobs that may still receive submissions.

use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::job::Job;
use crate::metrics::prometheus as metrics;
use crate::upstream::{UpstreamClient, UpstreamJob};

/// Emitted for every accepted upstream notification.
#[derive(Debug, Clone)]
pub struct NextJob {
    pub job: Arc<Job>,
    pub is_new_block: bool,
}

#[derive(Default)]
struct Registry {
    counter: u64,
    current: Option<Arc<Job>>,
    valid: HashMap<String, Arc<Job>>,
}

pub struct JobManager {
    multiplier: f64,
    registry: RwLock<Registry>,
    next_job_tx: broadcast::Sender<NextJob>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(multiplier: f64) -> Self {
        let (next_job_tx, _) = broadcast::channel(64);
        Self {
            multiplier,
            registry: RwLock::new(Registry::default()),
            next_job_tx,
            listener: Mutex::new(None),
        }
    }

    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.registry.read().current.clone()
    }

    pub fn job_by_id(&self, id: &str) -> Option<Arc<Job>> {
        self.registry.read().valid.get(id).cloned()
    }

    pub fn valid_job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.read().valid.keys().cloned().collect();
        ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
        ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NextJob> {
        self.next_job_tx.subscribe()
    }

    /// Apply one upstream notification. Returns `None` when it is older than the current job.
    pub fn process_upstream_job(&self, upstream: &UpstreamJob) -> Option<NextJob> {
        let next = {
            let mut registry = self.registry.write();

            let is_new_block = match registry.current.as_ref() {
                Some(current) if upstream.height < current.height() => {
                    tracing::debug!(
                        "Discarding out-of-order upstream job {} (height {} < {})",
                        upstream.id,
                        upstream.height,
                        current.height()
                    );
                    return None;
                }
                Some(current) => current.height() != upstream.height,
                None => true,
            };

            registry.counter += 1;
            let job = Arc::new(Job::new(registry.counter.to_string(), upstream, self.multiplier));

            if is_new_block {
                registry.valid.clear();
            }
            registry.valid.insert(job.id().to_string(), job.clone());
            registry.current = Some(job.clone());

            NextJob { job, is_new_block }
        };

        metrics::set_job_height(next.job.height());
        tracing::info!(
            "New job {}: height={}, difficulty={}, new_block={}",
            next.job.id(),
            next.job.height(),
            next.job.network_difficulty(),
            next.is_new_block
        );

        // No subscribers yet is fine during startup
        let _ = self.next_job_tx.send(next.clone());
        Some(next)
    }

    /// Seed from the upstream's current job and follow its notifications.
    ///
    /// Fails if no job shows up within `first_job_timeout`.
    pub async fn start(
        self: &Arc<Self>,
        upstream: Arc<dyn UpstreamClient>,
        first_job_timeout: Duration,
    ) -> Result<()> {
        let mut jobs = upstream.subscribe_jobs();

        if let Some(job) = upstream.current_job() {
            self.process_upstream_job(&job);
        }

        if self.current_job().is_none() {
            let first = tokio::time::timeout(first_job_timeout, jobs.recv())
                .await
                .map_err(|_| anyhow!("no job received from upstream within {:?}", first_job_timeout))?
                .map_err(|e| anyhow!("upstream job stream closed: {}", e))?;
            self.process_upstream_job(&first);
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match jobs.recv().await {
                    Ok(job) => {
                        manager.process_upstream_job(&job);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Job listener lagged, skipped {} upstream notifications", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("Upstream job stream closed");
                        break;
                    }
                }
            }
        });

        if let Some(old) = self.listener.lock().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(id: &str, height: u64) -> UpstreamJob {
        UpstreamJob {
            id: id.to_string(),
            height,
            difficulty: 100.0,
            input: "00".repeat(32),
        }
    }

    #[test]
    fn test_first_job_is_new_block() {
        let manager = JobManager::new(1.0);
        assert!(manager.current_job().is_none());

        let next = manager.process_upstream_job(&upstream("a", 10)).unwrap();
        assert!(next.is_new_block);
        assert_eq!(next.job.id(), "1");
        assert_eq!(manager.current_job().unwrap().id(), "1");
    }

    #[test]
    fn test_same_height_extends_valid_jobs() {
        let manager = JobManager::new(1.0);
        manager.process_upstream_job(&upstream("a", 10));
        let next = manager.process_upstream_job(&upstream("b", 10)).unwrap();

        assert!(!next.is_new_block);
        assert_eq!(manager.valid_job_ids(), vec!["1", "2"]);
        assert!(manager.job_by_id("1").is_some());
    }

    #[test]
    fn test_new_height_replaces_valid_jobs() {
        let manager = JobManager::new(1.0);
        manager.process_upstream_job(&upstream("a", 10));
        manager.process_upstream_job(&upstream("b", 10));
        let next = manager.process_upstream_job(&upstream("c", 11)).unwrap();

        assert!(next.is_new_block);
        assert_eq!(manager.valid_job_ids(), vec!["3"]);
        assert!(manager.job_by_id("1").is_none());
        assert!(manager.job_by_id("2").is_none());
    }

    #[test]
    fn test_lower_height_is_discarded() {
        let manager = JobManager::new(1.0);
        manager.process_upstream_job(&upstream("a", 10));
        assert!(manager.process_upstream_job(&upstream("old", 9)).is_none());

        let current = manager.current_job().unwrap();
        assert_eq!(current.id(), "1");
        assert_eq!(current.upstream_job_id(), "a");
    }

    #[test]
    fn test_ids_strictly_increase() {
        let manager = JobManager::new(1.0);
        let mut last = 0u64;
        for (i, height) in [5, 5, 5, 6, 6, 4, 7, 7].iter().enumerate() {
            if let Some(next) = manager.process_upstream_job(&upstream(&i.to_string(), *height)) {
                let id: u64 = next.job.id().parse().unwrap();
                assert!(id > last);
                last = id;
            }
        }
        assert_eq!(last, 7);
    }

    #[tokio::test]
    async fn test_next_job_is_broadcast() {
        let manager = JobManager::new(1.0);
        let mut rx = manager.subscribe();
        manager.process_upstream_job(&upstream("a", 1));

        let next = rx.recv().await.unwrap();
        assert_eq!(next.job.id(), "1");
        assert!(next.is_new_block);
    }
}
