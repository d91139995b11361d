/// Share validation pipeline
///
/// One `Share` per submission. `validate()` resolves the job and runs the ordered
/// checks: stale job, nonce size, solution size, duplicate, proof of work, block
/// threshold, low difficulty. The first failing stage decides the error.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::algorithm::Algorithm;
use crate::jobs::{Job, JobManager};
use crate::metrics::prometheus as metrics;
use crate::stratum::client::Client;
use crate::stratum::error::{StratumError, StratumErrorKind};

/// Shares below this fraction of the assigned difficulty are rejected.
pub const LOW_DIFFICULTY_TOLERANCE: f64 = 0.999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareState {
    Unvalidated,
    Valid,
    Invalid(StratumErrorKind),
}

/// Dialect-specific fields carried along for consumers. Not validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareExtras {
    pub extra_nonce2: Option<String>,
    pub n_time: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Share {
    job_id: String,
    nonce_hex: String,
    output_hex: String,
    subscription_id: String,
    worker_name: Option<String>,
    stratum_diff: f64,
    extras: ShareExtras,
    submit_time: DateTime<Utc>,

    job: Option<Arc<Job>>,
    share_diff: f64,
    expected_blocks: f64,
    state: ShareState,
    is_valid_block: bool,
    block_id: Option<String>,
}

/// Serializable view of a finished share.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareSummary {
    pub job_id: String,
    pub job_height: u64,
    pub upstream_job_id: String,
    pub submit_time: DateTime<Utc>,
    pub subscription_id: String,
    pub worker_name: Option<String>,
    pub share_diff: f64,
    pub stratum_diff: f64,
    pub expected_blocks: f64,
    pub is_valid_block: bool,
    pub is_valid_share: Option<bool>,
    pub is_block_accepted: bool,
    pub error: Option<StratumError>,
    pub block_id: Option<String>,
    #[serde(flatten)]
    pub extras: ShareExtras,
}

/// True when `share_diff` falls short of `stratum_diff` beyond the tolerance band.
pub fn is_low_difficulty(share_diff: f64, stratum_diff: f64) -> bool {
    share_diff / stratum_diff < LOW_DIFFICULTY_TOLERANCE
}

impl Share {
    pub fn new(
        job_id: impl Into<String>,
        nonce_hex: impl Into<String>,
        output_hex: impl Into<String>,
        stratum_diff: f64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            nonce_hex: nonce_hex.into(),
            output_hex: output_hex.into(),
            subscription_id: String::new(),
            worker_name: None,
            stratum_diff,
            extras: ShareExtras::default(),
            submit_time: Utc::now(),
            job: None,
            share_diff: 0.0,
            expected_blocks: 0.0,
            state: ShareState::Unvalidated,
            is_valid_block: false,
            block_id: None,
        }
    }

    /// Share bound to the submitting client's identity and assigned difficulty.
    pub fn from_client(
        client: &Client,
        job_id: impl Into<String>,
        nonce_hex: impl Into<String>,
        output_hex: impl Into<String>,
    ) -> Self {
        let mut share = Self::new(job_id, nonce_hex, output_hex, client.difficulty());
        share.subscription_id = client.subscription_id().to_string();
        share.worker_name = client.worker_name();
        share
    }

    pub fn with_extras(mut self, extras: ShareExtras) -> Self {
        self.extras = extras;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn nonce_hex(&self) -> &str {
        &self.nonce_hex
    }

    pub fn output_hex(&self) -> &str {
        &self.output_hex
    }

    pub fn worker_name(&self) -> Option<&str> {
        self.worker_name.as_deref()
    }

    pub fn job(&self) -> Option<&Arc<Job>> {
        self.job.as_ref()
    }

    pub fn upstream_job_id(&self) -> &str {
        self.job.as_ref().map(|j| j.upstream_job_id()).unwrap_or_default()
    }

    pub fn job_height(&self) -> u64 {
        self.job.as_ref().map(|j| j.height()).unwrap_or_default()
    }

    pub fn share_diff(&self) -> f64 {
        self.share_diff
    }

    pub fn stratum_diff(&self) -> f64 {
        self.stratum_diff
    }

    pub fn expected_blocks(&self) -> f64 {
        self.expected_blocks
    }

    pub fn state(&self) -> ShareState {
        self.state
    }

    /// `None` until validated.
    pub fn is_valid_share(&self) -> Option<bool> {
        match self.state {
            ShareState::Unvalidated => None,
            ShareState::Valid => Some(true),
            ShareState::Invalid(_) => Some(false),
        }
    }

    pub fn is_valid_block(&self) -> bool {
        self.is_valid_block
    }

    pub fn error(&self) -> Option<StratumErrorKind> {
        match self.state {
            ShareState::Invalid(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn block_id(&self) -> Option<&str> {
        self.block_id.as_deref()
    }

    pub fn is_block_accepted(&self) -> bool {
        self.block_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// Record the upstream verdict. A missing or empty id means the block was not accepted.
    pub fn set_block_id(&mut self, block_id: Option<String>) {
        self.block_id = block_id.filter(|id| !id.is_empty());
    }

    /// Upstream refused the candidate: no longer a block.
    pub fn demote_block(&mut self) {
        self.is_valid_block = false;
        self.block_id = None;
    }

    /// Run the pipeline once. Later calls return the cached verdict.
    pub fn validate(&mut self, jobs: &JobManager, algorithm: &Algorithm) -> bool {
        if let Some(cached) = self.is_valid_share() {
            return cached;
        }

        let verdict = self.run_pipeline(jobs, algorithm);
        self.state = match verdict {
            Ok(()) => ShareState::Valid,
            Err(kind) => {
                tracing::debug!(
                    "Share rejected for job {} ({}): {}",
                    self.job_id,
                    self.worker_name.as_deref().unwrap_or("-"),
                    kind.message()
                );
                ShareState::Invalid(kind)
            }
        };

        let valid = self.state == ShareState::Valid;
        metrics::inc_share(valid);
        valid
    }

    fn run_pipeline(&mut self, jobs: &JobManager, algorithm: &Algorithm) -> Result<(), StratumErrorKind> {
        let job = jobs.job_by_id(&self.job_id).ok_or(StratumErrorKind::StaleShare)?;
        self.job = Some(job.clone());

        if self.nonce_hex.len() != algorithm.nonce_hex_len {
            return Err(StratumErrorKind::IncorrectNonceSize);
        }

        if self.output_hex.len() != algorithm.solution_hex_len {
            return Err(StratumErrorKind::IncorrectSolutionSize);
        }

        if !job.register_submission(&self.nonce_hex, &self.output_hex) {
            return Err(StratumErrorKind::DuplicateShare);
        }

        let (nonce, output) = match (hex::decode(&self.nonce_hex), hex::decode(&self.output_hex)) {
            (Ok(n), Ok(o)) => (n, o),
            _ => return Err(StratumErrorKind::InvalidSolution),
        };

        if !algorithm.verify(job.input(), &nonce, &output) {
            return Err(StratumErrorKind::InvalidSolution);
        }

        self.share_diff = algorithm.share_difficulty(&output);
        self.is_valid_block = self.share_diff >= job.pool_difficulty();
        if self.is_valid_block {
            tracing::info!("Winning nonce submitted: {} (job {})", self.nonce_hex, self.job_id);
        }

        if is_low_difficulty(self.share_diff, self.stratum_diff) {
            return Err(StratumErrorKind::LowDifficulty);
        }

        self.expected_blocks = self.stratum_diff / job.pool_difficulty();
        Ok(())
    }

    pub fn summary(&self) -> ShareSummary {
        ShareSummary {
            job_id: self.job_id.clone(),
            job_height: self.job_height(),
            upstream_job_id: self.upstream_job_id().to_string(),
            submit_time: self.submit_time,
            subscription_id: self.subscription_id.clone(),
            worker_name: self.worker_name.clone(),
            share_diff: self.share_diff,
            stratum_diff: self.stratum_diff,
            expected_blocks: self.expected_blocks,
            is_valid_block: self.is_valid_block,
            is_valid_share: self.is_valid_share(),
            is_block_accepted: self.is_block_accepted(),
            error: self.error().map(StratumError::from),
            block_id: self.block_id.clone(),
            extras: self.extras.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::NoopVerifier;
    use crate::upstream::UpstreamJob;

    const NONCE: &str = "0011223344556677";

    fn output(seed: u8) -> String {
        hex::encode([seed; 104])
    }

    fn manager_with_job(network_difficulty: f64) -> JobManager {
        let manager = JobManager::new(1.0);
        manager.process_upstream_job(&UpstreamJob {
            id: "up-1".to_string(),
            height: 100,
            difficulty: network_difficulty,
            input: "ab".repeat(32),
        });
        manager
    }

    fn algorithm() -> Algorithm {
        Algorithm::beam_hash_iii(Arc::new(NoopVerifier))
    }

    #[test]
    fn test_stale_job() {
        let manager = manager_with_job(1e30);
        let mut share = Share::new("99", NONCE, output(1), 1e-9);
        assert!(!share.validate(&manager, &algorithm()));
        assert_eq!(share.error(), Some(StratumErrorKind::StaleShare));
        assert!(share.job().is_none());
    }

    #[test]
    fn test_nonce_size_checked_before_solution_size() {
        let manager = manager_with_job(1e30);
        for nonce in ["", "00", "001122334455667", "00112233445566778"] {
            let mut share = Share::new("1", nonce, "00", 1e-9);
            assert!(!share.validate(&manager, &algorithm()));
            assert_eq!(share.error(), Some(StratumErrorKind::IncorrectNonceSize));
        }
        assert_eq!(manager.current_job().unwrap().submission_count(), 0);
    }

    #[test]
    fn test_solution_size() {
        let manager = manager_with_job(1e30);
        for out in [String::new(), "00".repeat(103), "00".repeat(105), format!("{}0", output(1))] {
            let mut share = Share::new("1", NONCE, out, 1e-9);
            assert!(!share.validate(&manager, &algorithm()));
            assert_eq!(share.error(), Some(StratumErrorKind::IncorrectSolutionSize));
        }
    }

    #[test]
    fn test_duplicate_is_job_scoped() {
        let manager = manager_with_job(1e30);
        let mut first = Share::new("1", NONCE, output(7), 1e-9);
        let mut second = Share::new("1", NONCE, output(7), 1e-9);
        assert!(first.validate(&manager, &algorithm()));
        assert!(!second.validate(&manager, &algorithm()));
        assert_eq!(second.error(), Some(StratumErrorKind::DuplicateShare));

        // same pair against a second job at the same height
        manager.process_upstream_job(&UpstreamJob {
            id: "up-2".to_string(),
            height: 100,
            difficulty: 1e30,
            input: "cd".repeat(32),
        });
        let mut other_job = Share::new("2", NONCE, output(7), 1e-9);
        assert!(other_job.validate(&manager, &algorithm()));
    }

    #[test]
    fn test_invalid_solution() {
        let manager = manager_with_job(1e30);
        let reject = Algorithm::beam_hash_iii(Arc::new(|_: &[u8], _: &[u8], _: &[u8]| false));
        let mut share = Share::new("1", NONCE, output(2), 1e-9);
        assert!(!share.validate(&manager, &reject));
        assert_eq!(share.error(), Some(StratumErrorKind::InvalidSolution));
        assert!(!share.is_valid_block());
    }

    #[test]
    fn test_non_hex_solution_is_invalid() {
        let manager = manager_with_job(1e30);
        let mut share = Share::new("1", "zz11223344556677", output(2), 1e-9);
        assert!(!share.validate(&manager, &algorithm()));
        assert_eq!(share.error(), Some(StratumErrorKind::InvalidSolution));
    }

    #[test]
    fn test_verifier_receives_decoded_bytes() {
        let manager = manager_with_job(1e30);
        let input = manager.current_job().unwrap().input().to_vec();
        let check = Algorithm::beam_hash_iii(Arc::new(move |i: &[u8], n: &[u8], o: &[u8]| {
            i == input.as_slice() && n.len() == 8 && o.len() == 104
        }));
        let mut share = Share::new("1", NONCE, output(3), 1e-9);
        assert!(share.validate(&manager, &check));
    }

    #[test]
    fn test_low_difficulty() {
        let manager = manager_with_job(1e30);
        let mut share = Share::new("1", NONCE, output(4), 1e30);
        assert!(!share.validate(&manager, &algorithm()));
        assert_eq!(share.error(), Some(StratumErrorKind::LowDifficulty));
        assert!(share.share_diff() > 0.0);
    }

    #[test]
    fn test_low_difficulty_tolerance_band() {
        assert!(!is_low_difficulty(999.0, 1000.0));
        assert!(!is_low_difficulty(1000.0, 1000.0));
        assert!(is_low_difficulty(998.9, 1000.0));
    }

    #[test]
    fn test_valid_share_below_block_threshold() {
        let manager = manager_with_job(1e30);
        let mut share = Share::new("1", NONCE, output(5), 1e-6);
        assert!(share.validate(&manager, &algorithm()));
        assert_eq!(share.state(), ShareState::Valid);
        assert!(!share.is_valid_block());
        assert_eq!(share.expected_blocks(), 1e-6 / 1e30);
        assert_eq!(share.job_height(), 100);
        assert_eq!(share.upstream_job_id(), "up-1");
    }

    #[test]
    fn test_valid_block() {
        let manager = manager_with_job(1e-9);
        let mut share = Share::new("1", NONCE, output(6), 1e-9);
        assert!(share.validate(&manager, &algorithm()));
        assert!(share.is_valid_block());
        assert!(!share.is_block_accepted());

        share.set_block_id(Some("beef".to_string()));
        assert!(share.is_block_accepted());

        share.demote_block();
        assert!(!share.is_valid_block());
        assert!(share.block_id().is_none());
    }

    #[test]
    fn test_validate_is_idempotent() {
        let manager = manager_with_job(1e30);
        let mut share = Share::new("1", NONCE, output(8), 1e-6);
        assert!(share.validate(&manager, &algorithm()));
        let diff = share.share_diff();

        // a second run through the pipeline would hit the duplicate check
        assert!(share.validate(&manager, &algorithm()));
        assert_eq!(share.share_diff(), diff);
        assert_eq!(manager.current_job().unwrap().submission_count(), 1);
    }

    #[test]
    fn test_stale_after_new_block() {
        let manager = manager_with_job(1e30);
        manager.process_upstream_job(&UpstreamJob {
            id: "up-2".to_string(),
            height: 101,
            difficulty: 1e30,
            input: "cd".repeat(32),
        });
        let mut share = Share::new("1", NONCE, output(9), 1e-6);
        assert!(!share.validate(&manager, &algorithm()));
        assert_eq!(share.error(), Some(StratumErrorKind::StaleShare));
    }

    #[test]
    fn test_summary_json() {
        let manager = manager_with_job(1e30);
        let mut share = Share::new("1", NONCE, output(10), 1e30).with_extras(ShareExtras {
            extra_nonce2: Some("00000001".to_string()),
            n_time: None,
        });
        share.validate(&manager, &algorithm());

        let json = serde_json::to_value(share.summary()).unwrap();
        assert_eq!(json["jobId"], "1");
        assert_eq!(json["jobHeight"], 100);
        assert_eq!(json["upstreamJobId"], "up-1");
        assert_eq!(json["isValidShare"], false);
        assert_eq!(json["isBlockAccepted"], false);
        assert_eq!(json["error"]["code"], -32009);
        assert_eq!(json["extraNonce2"], "00000001");
        assert!(json["blockId"].is_null());
    }
}
