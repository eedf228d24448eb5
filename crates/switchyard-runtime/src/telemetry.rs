//! Cost and latency telemetry.
//!
//! Every completed backend attempt, successful or not, is appended to an
//! append-only log of [`CallRecord`]s. Statistics are a fold over that log
//! at read time: nothing is aggregated incrementally, so concurrent readers
//! always see a consistent picture of whatever has been appended.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use switchyard_core::CompletionResponse;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{duration_secs, option_duration_secs, ConfigError};

/// Daily projection multiplier used when there is no usable time span.
pub const FLAT_DAILY_MULTIPLIER: f64 = 100.0;

/// Error rate at or above which [`TelemetryCollector::health`] reports unhealthy.
pub const UNHEALTHY_ERROR_RATE: f64 = 0.5;

const SECONDS_PER_DAY: f64 = 86_400.0;
const DAYS_PER_MONTH: f64 = 30.0;

/// Telemetry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Rolling window used by [`TelemetryCollector::stats`]
    #[serde(with = "duration_secs")]
    pub window: Duration,

    /// Records older than this are dropped; `None` keeps everything
    #[serde(
        default,
        with = "option_duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub retention: Option<Duration>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            retention: None,
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::invalid("window", "must be greater than zero"));
        }
        if self.retention.is_some_and(|r| r.is_zero()) {
            return Err(ConfigError::invalid("retention", "must be greater than zero"));
        }
        Ok(())
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure { kind: String },
}

/// One completed backend attempt. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub backend: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
    pub latency: Duration,
    pub recorded_at: DateTime<Utc>,
    pub outcome: Outcome,
}

impl CallRecord {
    pub fn success(response: &CompletionResponse) -> Self {
        Self {
            backend: response.backend.clone(),
            model: response.model.clone(),
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            cost: response.cost,
            latency: response.latency,
            recorded_at: Utc::now(),
            outcome: Outcome::Success,
        }
    }

    pub fn failure(
        backend: impl Into<String>,
        model: impl Into<String>,
        latency: Duration,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            latency,
            recorded_at: Utc::now(),
            outcome: Outcome::Failure { kind: kind.into() },
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Which records a statistics query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// Records no older than the given duration
    Last(Duration),
    All,
}

/// Latency summary in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// Extrapolated spend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostProjection {
    pub daily: f64,
    pub monthly: f64,
}

/// Statistics over a window of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetryStats {
    pub count: usize,
    pub successes: usize,
    pub failures: usize,
    /// Fraction of attempts that failed, 0 when there were none
    pub error_rate: f64,
    pub latency: LatencyStats,
    pub total_cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub avg_cost_per_request: f64,
    pub cost_by_model: BTreeMap<String, f64>,
    pub cost_by_backend: BTreeMap<String, f64>,
    pub projection: CostProjection,
}

/// Health summary over every retained record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Time since the collector was created
    #[serde(serialize_with = "duration_secs::serialize")]
    pub uptime: Duration,
    pub total_requests: usize,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
}

/// Linear-interpolation percentile over ascending `sorted` values.
///
/// Returns 0 for an empty slice and the only value for a single one.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted {
        [] => 0.0,
        [only] => *only,
        _ => {
            let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

#[derive(Debug)]
struct Entry {
    record: CallRecord,
    at: Instant,
}

/// Append-only collector of call records.
#[derive(Debug)]
pub struct TelemetryCollector {
    config: TelemetryConfig,
    records: RwLock<Vec<Entry>>,
    started: Instant,
}

impl TelemetryCollector {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            config,
            records: RwLock::new(Vec::new()),
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn record(&self, record: CallRecord) {
        self.records.write().push(Entry {
            record,
            at: Instant::now(),
        });
    }

    /// Statistics over the configured rolling window.
    pub fn stats(&self) -> TelemetryStats {
        self.stats_over(Window::Last(self.config.window))
    }

    pub fn stats_over(&self, window: Window) -> TelemetryStats {
        self.prune();
        let now = Instant::now();
        let records = self.records.read();
        let in_window: Vec<&Entry> = records
            .iter()
            .filter(|e| match window {
                Window::Last(d) => now.saturating_duration_since(e.at) <= d,
                Window::All => true,
            })
            .collect();
        summarize(&in_window)
    }

    /// Up to `n` most recent records, newest first.
    pub fn recent(&self, n: usize) -> Vec<CallRecord> {
        self.prune();
        self.records
            .read()
            .iter()
            .rev()
            .take(n)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Up to `n` most recent records for one backend, newest first.
    pub fn recent_for(&self, backend: &str, n: usize) -> Vec<CallRecord> {
        self.prune();
        self.records
            .read()
            .iter()
            .rev()
            .filter(|e| e.record.backend == backend)
            .take(n)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Healthy while fewer than half of the retained attempts failed.
    pub fn health(&self) -> HealthStatus {
        let stats = self.stats_over(Window::All);
        HealthStatus {
            healthy: stats.error_rate < UNHEALTHY_ERROR_RATE,
            uptime: self.started.elapsed(),
            total_requests: stats.count,
            error_rate: stats.error_rate,
            avg_latency_ms: stats.latency.mean,
            p95_latency_ms: stats.latency.p95,
        }
    }

    pub fn len(&self) -> usize {
        self.prune();
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }

    fn prune(&self) {
        let Some(retention) = self.config.retention else {
            return;
        };
        let now = Instant::now();
        let expired = |e: &Entry| now.saturating_duration_since(e.at) > retention;

        // Cheap check under the read lock first; appends are in time order.
        if !self.records.read().first().is_some_and(expired) {
            return;
        }
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|e| !expired(e));
        debug!(dropped = before - records.len(), "pruned telemetry records");
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(TelemetryConfig::default())
    }
}

fn summarize(entries: &[&Entry]) -> TelemetryStats {
    if entries.is_empty() {
        return TelemetryStats::default();
    }

    let count = entries.len();
    let successes = entries.iter().filter(|e| e.record.is_success()).count();

    let mut latencies: Vec<f64> = entries
        .iter()
        .map(|e| e.record.latency.as_nanos() as f64 / 1e6)
        .collect();
    latencies.sort_by(f64::total_cmp);

    let (total_cost, input_tokens, output_tokens, cost_by_model, cost_by_backend) =
        entries.iter().fold(
            (0.0, 0u64, 0u64, BTreeMap::new(), BTreeMap::new()),
            |(cost, input, output, mut by_model, mut by_backend), e| {
                let r = &e.record;
                *by_model.entry(r.model.clone()).or_insert(0.0) += r.cost;
                *by_backend.entry(r.backend.clone()).or_insert(0.0) += r.cost;
                (
                    cost + r.cost,
                    input + u64::from(r.input_tokens),
                    output + u64::from(r.output_tokens),
                    by_model,
                    by_backend,
                )
            },
        );

    let span = entries
        .iter()
        .map(|e| e.at)
        .max()
        .zip(entries.iter().map(|e| e.at).min())
        .map(|(newest, oldest)| newest.saturating_duration_since(oldest))
        .unwrap_or_default();

    TelemetryStats {
        count,
        successes,
        failures: count - successes,
        error_rate: (count - successes) as f64 / count as f64,
        latency: LatencyStats {
            p50: percentile(&latencies, 50.0),
            p95: percentile(&latencies, 95.0),
            p99: percentile(&latencies, 99.0),
            mean: latencies.iter().sum::<f64>() / count as f64,
            min: latencies[0],
            max: latencies[count - 1],
        },
        total_cost,
        input_tokens,
        output_tokens,
        avg_cost_per_request: total_cost / count as f64,
        cost_by_model,
        cost_by_backend,
        projection: project(total_cost, count, span),
    }
}

fn project(total_cost: f64, count: usize, span: Duration) -> CostProjection {
    let daily = if count >= 2 && !span.is_zero() {
        total_cost / span.as_secs_f64() * SECONDS_PER_DAY
    } else {
        total_cost * FLAT_DAILY_MULTIPLIER
    };
    CostProjection {
        daily,
        monthly: daily * DAYS_PER_MONTH,
    }
}
