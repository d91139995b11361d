use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;

use crate::upstream::UpstreamJob;

/// One unit of mineable work handed to miners.
///
/// Everything is fixed at creation except the set of seen submissions, which only grows.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    id: String,
    upstream_job_id: String,
    created_at: DateTime<Utc>,
    height: u64,
    network_difficulty: f64,
    pool_difficulty: f64,
    input_hex: String,
    #[serde(skip)]
    input: Vec<u8>,
    #[serde(skip)]
    submissions: Mutex<HashSet<(String, String)>>,
}

impl Job {
    pub fn new(id: String, upstream: &UpstreamJob, multiplier: f64) -> Self {
        let input_hex = upstream.input.trim_start_matches("0x").to_lowercase();
        let input = match hex::decode(&input_hex) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Job {} has undecodable input ({}), verifying against empty input", id, e);
                Vec::new()
            }
        };

        Self {
            id,
            upstream_job_id: upstream.id.clone(),
            created_at: Utc::now(),
            height: upstream.height,
            network_difficulty: upstream.difficulty,
            pool_difficulty: upstream.difficulty * multiplier,
            input_hex,
            input,
            submissions: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn upstream_job_id(&self) -> &str {
        &self.upstream_job_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn network_difficulty(&self) -> f64 {
        self.network_difficulty
    }

    pub fn pool_difficulty(&self) -> f64 {
        self.pool_difficulty
    }

    pub fn input_hex(&self) -> &str {
        &self.input_hex
    }

    pub fn input(&self) -> &[u8] {
        &self.input
    }

    /// Record a (nonce, output) pair. Returns false if this job has already seen it.
    ///
    /// Check and insert happen under one lock so racing miners cannot both get through.
    pub fn register_submission(&self, nonce_hex: &str, output_hex: &str) -> bool {
        let key = (nonce_hex.to_string(), output_hex.to_string());
        self.submissions.lock().insert(key)
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn upstream(height: u64) -> UpstreamJob {
        UpstreamJob {
            id: "node-7".to_string(),
            height,
            difficulty: 250.0,
            input: "0xAABB".to_string(),
        }
    }

    #[test]
    fn test_job_fields() {
        let job = Job::new("3".to_string(), &upstream(100), 2.0);
        assert_eq!(job.id(), "3");
        assert_eq!(job.upstream_job_id(), "node-7");
        assert_eq!(job.height(), 100);
        assert_eq!(job.network_difficulty(), 250.0);
        assert_eq!(job.pool_difficulty(), 500.0);
        assert_eq!(job.input_hex(), "aabb");
        assert_eq!(job.input(), &[0xaa, 0xbb]);
    }

    #[test]
    fn test_duplicate_submission() {
        let job = Job::new("1".to_string(), &upstream(1), 1.0);
        assert!(job.register_submission("00ff", "abcd"));
        assert!(!job.register_submission("00ff", "abcd"));
        assert!(job.register_submission("00ff", "abce"));
        assert_eq!(job.submission_count(), 2);
    }

    #[test]
    fn test_concurrent_registration_admits_one() {
        let job = Arc::new(Job::new("1".to_string(), &upstream(1), 1.0));
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let job = job.clone();
                let admitted = admitted.clone();
                std::thread::spawn(move || {
                    if job.register_submission("0102030405060708", "ff") {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }
}
