use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static JOBS_ENQUEUED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("jobs_enqueued_total", "Total jobs enqueued").unwrap());

pub static JOBS_CLAIMED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("jobs_claimed_total", "Total job claims").unwrap());

pub static JOBS_COMPLETED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("jobs_completed_total", "Total jobs completed").unwrap());

pub static JOBS_RETRIED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("jobs_retried_total", "Failed attempts scheduled for retry").unwrap()
});

pub static JOBS_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("jobs_failed_total", "Jobs moved to the terminal failed state").unwrap()
});

pub static JOBS_RECOVERED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("jobs_recovered_total", "Jobs reclaimed after their lease expired").unwrap()
});

pub static JOBS_CLEANED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("jobs_cleaned_total", "Terminal jobs deleted by retention cleanup").unwrap()
});

pub fn init_metrics() {
    // Ignore errors if called multiple times (common in tests)
    let _ = REGISTRY.register(Box::new(JOBS_ENQUEUED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_CLAIMED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_COMPLETED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RETRIED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FAILED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RECOVERED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_CLEANED.clone()));
}

/// Prometheus text exposition of every registered counter.
pub fn gather() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buf) {
        tracing::warn!(error=%e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_includes_registered_counters() {
        init_metrics();
        JOBS_ENQUEUED.inc();

        let text = gather();
        assert!(text.contains("jobs_enqueued_total"));
        assert!(text.contains("jobs_recovered_total"));
    }
}
