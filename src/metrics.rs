//! Outcome counters and timing statistics for the classification pipeline.

use crate::types::classification::ReviewOutcome;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Review outcome counters and per-person latency samples
pub struct PipelineMetrics {
    /// Total people classified or routed
    pub people_processed: AtomicU64,
    pub anomalies: AtomicU64,
    pub normals: AtomicU64,
    pub insufficient_data: AtomicU64,
    pub manual_reviews: AtomicU64,
    /// Transactions ingested into baselines
    pub transactions_ingested: AtomicU64,
    /// Late transactions that forced a baseline rebuild
    pub baseline_recomputes: AtomicU64,
    /// Per-person classification latency, microseconds
    processing_times: RwLock<Vec<u64>>,
    /// Histogram of classified probabilities in tenths
    probability_buckets: RwLock<[u64; 10]>,
    start_time: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            people_processed: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            normals: AtomicU64::new(0),
            insufficient_data: AtomicU64::new(0),
            manual_reviews: AtomicU64::new(0),
            transactions_ingested: AtomicU64::new(0),
            baseline_recomputes: AtomicU64::new(0),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            probability_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
        }
    }

    /// Record one review outcome and how long it took
    pub fn record_outcome(&self, outcome: &ReviewOutcome, processing_time: Duration) {
        self.people_processed.fetch_add(1, Ordering::Relaxed);

        let counter = match outcome {
            ReviewOutcome::Classified(result) if result.is_anomaly() => &self.anomalies,
            ReviewOutcome::Classified(_) => &self.normals,
            ReviewOutcome::InsufficientData { .. } => &self.insufficient_data,
            ReviewOutcome::ManualReview { .. } => &self.manual_reviews,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        {
            let mut times = self.processing_times.write().unwrap_or_else(PoisonError::into_inner);
            times.push(processing_time.as_micros() as u64);
            // Keep only the most recent samples
            if times.len() > 10000 {
                times.drain(0..5000);
            }
        }

        if let ReviewOutcome::Classified(result) = outcome {
            let bucket = ((result.probability * 10.0) as usize).min(9);
            let mut buckets = self.probability_buckets.write().unwrap_or_else(PoisonError::into_inner);
            buckets[bucket] += 1;
        }
    }

    pub fn record_ingest(&self, recomputed: bool) {
        self.transactions_ingested.fetch_add(1, Ordering::Relaxed);
        if recomputed {
            self.baseline_recomputes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Latency percentiles over the retained samples
    pub fn get_processing_stats(&self) -> ProcessingStats {
        let times = self.processing_times.read().unwrap_or_else(PoisonError::into_inner);
        if times.is_empty() {
            return ProcessingStats::default();
        }

        let mut sorted: Vec<u64> = times.clone();
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len();
        let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];

        ProcessingStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: at(0.5),
            p95_us: at(0.95),
            p99_us: at(0.99),
            max_us: sorted[count - 1],
        }
    }

    /// People processed per second since start
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.people_processed.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn get_probability_distribution(&self) -> [u64; 10] {
        *self.probability_buckets.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log summary statistics
    pub fn print_summary(&self) {
        let processed = self.people_processed.load(Ordering::Relaxed);
        let anomalies = self.anomalies.load(Ordering::Relaxed);
        let anomaly_rate = if processed > 0 {
            (anomalies as f64 / processed as f64) * 100.0
        } else {
            0.0
        };
        let processing = self.get_processing_stats();

        info!(
            processed,
            anomalies,
            normals = self.normals.load(Ordering::Relaxed),
            insufficient_data = self.insufficient_data.load(Ordering::Relaxed),
            manual_reviews = self.manual_reviews.load(Ordering::Relaxed),
            anomaly_rate = %format!("{:.1}%", anomaly_rate),
            throughput = %format!("{:.1}/s", self.get_throughput()),
            "Classification summary"
        );
        info!(
            ingested = self.transactions_ingested.load(Ordering::Relaxed),
            recomputes = self.baseline_recomputes.load(Ordering::Relaxed),
            mean_us = processing.mean_us,
            p50_us = processing.p50_us,
            p95_us = processing.p95_us,
            p99_us = processing.p99_us,
            max_us = processing.max_us,
            "Processing summary"
        );

        let distribution = self.get_probability_distribution();
        let total: u64 = distribution.iter().sum();
        if total > 0 {
            for (i, &count) in distribution.iter().enumerate() {
                let pct = (count as f64 / total as f64) * 100.0;
                let bar = "█".repeat(((pct / 5.0) as usize).min(20));
                info!(
                    "  p {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                    i as f64 / 10.0,
                    (i + 1) as f64 / 10.0,
                    count,
                    pct,
                    bar
                );
            }
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency summary in microseconds
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Periodically logs a metrics summary
pub struct MetricsReporter {
    metrics: Arc<PipelineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // First tick fires immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::classification::{ClassificationResult, Label, RiskLevel};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn classified(probability: f64, label: Label) -> ReviewOutcome {
        ReviewOutcome::Classified(ClassificationResult {
            result_id: Uuid::nil(),
            person_id: "p1".to_string(),
            window_end: Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
            probability,
            label,
            confidence: probability,
            threshold: 0.5,
            flags: vec![],
            risk_score: probability * 100.0,
            risk_level: RiskLevel::Low,
            model_version: "v1".to_string(),
            observation_count: 6,
        })
    }

    #[test]
    fn test_outcome_counters() {
        let metrics = PipelineMetrics::new();
        metrics.record_outcome(&classified(0.9, Label::Anomaly), Duration::from_micros(100));
        metrics.record_outcome(&classified(0.1, Label::Normal), Duration::from_micros(200));
        metrics.record_outcome(
            &ReviewOutcome::ManualReview {
                person_id: "p2".to_string(),
                window_end: Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
                reason: "scoring failed".to_string(),
            },
            Duration::from_micros(300),
        );

        assert_eq!(metrics.people_processed.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.anomalies.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.manual_reviews.load(Ordering::Relaxed), 1);

        let distribution = metrics.get_probability_distribution();
        assert_eq!(distribution[9], 1);
        assert_eq!(distribution[1], 1);
        assert_eq!(distribution.iter().sum::<u64>(), 2);
    }

    #[test]
    fn test_processing_stats() {
        let metrics = PipelineMetrics::new();
        for us in 1..=100 {
            metrics.record_outcome(&classified(1.0, Label::Anomaly), Duration::from_micros(us));
        }
        let stats = metrics.get_processing_stats();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.max_us, 100);
        assert_eq!(stats.p50_us, 51);
        assert_eq!(stats.p99_us, 100);
    }
}
