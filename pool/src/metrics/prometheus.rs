use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use std::sync::OnceLock;

static SHARES: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCK_SUBMIT_ATTEMPTS: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();
static MALFORMED_MESSAGES: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static JOB_HEIGHT: OnceLock<IntGauge> = OnceLock::new();

fn shares() -> &'static IntCounterVec {
    SHARES.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_total", "Validated shares by outcome"),
            &["status"],
        )
        .unwrap()
    })
}

fn block_submit_attempts() -> &'static IntCounter {
    BLOCK_SUBMIT_ATTEMPTS.get_or_init(|| {
        IntCounter::new("block_submit_attempts_total", "Candidate blocks forwarded upstream").unwrap()
    })
}

fn blocks_accepted() -> &'static IntCounter {
    BLOCKS_ACCEPTED.get_or_init(|| {
        IntCounter::new("blocks_accepted_total", "Blocks accepted by the upstream node").unwrap()
    })
}

fn block_submit_rejected() -> &'static IntCounter {
    BLOCK_SUBMIT_REJECTED.get_or_init(|| {
        IntCounter::new(
            "block_submit_rejected_total",
            "Candidate blocks rejected upstream or failed to submit",
        )
        .unwrap()
    })
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| IntCounter::new("job_broadcasts_total", "Jobs pushed to clients").unwrap())
}

fn malformed_messages() -> &'static IntCounter {
    MALFORMED_MESSAGES.get_or_init(|| {
        IntCounter::new("malformed_messages_total", "Client messages that could not be interpreted").unwrap()
    })
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS.get_or_init(|| IntGauge::new("active_connections", "Connected clients").unwrap())
}

fn job_height() -> &'static IntGauge {
    JOB_HEIGHT.get_or_init(|| IntGauge::new("job_height", "Height of the current job").unwrap())
}

pub fn inc_share(valid: bool) {
    let status = if valid { "valid" } else { "invalid" };
    shares().with_label_values(&[status]).inc();
}

pub fn inc_block_submit_attempts() {
    block_submit_attempts().inc();
}

pub fn inc_blocks_accepted() {
    blocks_accepted().inc();
}

pub fn inc_block_submit_rejected() {
    block_submit_rejected().inc();
}

pub fn inc_job_broadcasts_by(n: u64) {
    job_broadcasts().inc_by(n);
}

pub fn inc_malformed_messages() {
    malformed_messages().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn set_job_height(height: u64) {
    job_height().set(height as i64);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(shares().collect());
    mfs.extend(block_submit_attempts().collect());
    mfs.extend(blocks_accepted().collect());
    mfs.extend(block_submit_rejected().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(malformed_messages().collect());
    mfs.extend(active_connections().collect());
    mfs.extend(job_height().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        inc_share(true);
        inc_share(false);
        set_job_height(42);

        let text = render();
        assert!(text.contains("shares_total"));
        assert!(text.contains("job_height"));
        assert!(text.contains("block_submit_attempts_total"));
    }
}
