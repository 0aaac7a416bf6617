#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use queue_core::{Job, JobHandler};

/// Fails the first `failures` calls with "attempt N failed", then succeeds.
pub struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

impl Flaky {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always() -> Self {
        Self::new(usize::MAX)
    }
}

#[async_trait]
impl JobHandler for Flaky {
    async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            anyhow::bail!("attempt {n} failed");
        }
        Ok(())
    }
}
