//! Batch dispatch over a fallback chain.

use futures::stream::{self, StreamExt};
use std::time::Duration;
use switchyard_core::CompletionRequest;
use tokio::time::Instant;

use super::fallback::{FallbackChain, FallbackResult};
use crate::GatewayError;

/// Outcome of one request in a batch.
#[derive(Debug)]
pub struct BatchItemResult {
    /// Position of the request in the submitted batch
    pub index: usize,
    pub result: Result<FallbackResult, GatewayError>,
    pub duration: Duration,
}

impl BatchItemResult {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-item results in submission order, plus totals.
#[derive(Debug)]
pub struct BatchReport {
    pub results: Vec<BatchItemResult>,
    pub succeeded: usize,
    pub failed: usize,
    /// Wall time for the whole batch
    pub elapsed: Duration,
    /// Mean per-item duration, zero for an empty batch
    pub avg_duration: Duration,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.results.len()
    }
}

impl FallbackChain {
    /// Run every request through the chain with at most `concurrency`
    /// in flight. One failed request never aborts the others.
    pub async fn execute_batch(
        &self,
        requests: &[CompletionRequest],
        concurrency: usize,
    ) -> BatchReport {
        let start = Instant::now();
        let mut results: Vec<BatchItemResult> = stream::iter(requests.iter().enumerate())
            .map(|(index, request)| async move {
                let started = Instant::now();
                let result = self.execute(request).await;
                BatchItemResult {
                    index,
                    result,
                    duration: started.elapsed(),
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|r| r.index);

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - succeeded;
        let avg_duration = u32::try_from(results.len())
            .ok()
            .filter(|n| *n > 0)
            .map(|n| results.iter().map(|r| r.duration).sum::<Duration>() / n)
            .unwrap_or_default();

        tracing::debug!(total = results.len(), succeeded, failed, "batch finished");
        BatchReport {
            results,
            succeeded,
            failed,
            elapsed: start.elapsed(),
            avg_duration,
        }
    }
}
