//! Configuration management for the income anomaly pipeline

use crate::types::calendar::Calendar;
use crate::types::classification::RiskLevelThresholds;
use anyhow::{Context, Result};
use config::{Config, File};
use serde::Deserialize;
use std::path::Path;

/// Environment variable overriding the configuration file path
pub const CONFIG_PATH_ENV: &str = "INCOME_ANOMALY_CONFIG";

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub nats: NatsConfig,
    pub calendar: CalendarConfig,
    pub features: FeatureConfig,
    pub baseline: BaselineConfig,
    pub model: ModelConfig,
    pub explanation: ExplanationConfig,
    pub risk_levels: RiskLevelThresholds,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// NATS connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,
    /// Subject for incoming income transactions
    pub transaction_subject: String,
    /// Subject for incoming person profiles
    pub profile_subject: String,
    /// Request/reply subject for single classifications
    pub request_subject: String,
    /// Subject the review queue listens on
    pub review_subject: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            transaction_subject: "income.transactions".to_string(),
            profile_subject: "income.profiles".to_string(),
            request_subject: "income.classify".to_string(),
            review_subject: "income.review".to_string(),
        }
    }
}

/// Local calendar of the deployment
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// Offset from UTC in minutes (IST = 330)
    pub utc_offset_minutes: i32,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330,
        }
    }
}

impl CalendarConfig {
    pub fn calendar(&self) -> Calendar {
        Calendar::from_offset_minutes(self.utc_offset_minutes)
    }
}

/// Half-open amount band `[lower, upper)` just below a reporting threshold
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AmountBand {
    pub lower: f64,
    pub upper: f64,
}

impl AmountBand {
    pub fn contains(&self, amount: f64) -> bool {
        amount >= self.lower && amount < self.upper
    }
}

/// Feature extraction parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Length of the evaluation window in calendar months
    pub evaluation_months: u32,
    /// Minimum transactions required to produce a vector
    pub min_observations: usize,
    /// Minimum span between first and last transaction, in calendar months
    pub min_span_months: u32,
    /// First local hour of the night band (inclusive)
    pub night_start_hour: u32,
    /// Last local hour of the night band (inclusive)
    pub night_end_hour: u32,
    /// Amounts divisible by any of these units count as round
    pub round_units: Vec<f64>,
    /// Structuring bands watched for threshold avoidance
    pub structuring_bands: Vec<AmountBand>,
    /// Amounts above this are very high
    pub high_value_cutoff: f64,
    /// Multiple of the personal per-transaction mean that counts as a high deviation
    pub deviation_multiple: f64,
    /// Number of sector codes in the training vocabulary
    pub sector_levels: u32,
    /// Number of income tier codes in the training vocabulary
    pub income_tier_levels: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            evaluation_months: 6,
            min_observations: 5,
            min_span_months: 1,
            night_start_hour: 0,
            night_end_hour: 4,
            round_units: vec![1_000.0, 10_000.0, 100_000.0],
            structuring_bands: vec![AmountBand {
                lower: 49_000.0,
                upper: 50_000.0,
            }],
            high_value_cutoff: 500_000.0,
            deviation_multiple: 3.0,
            sector_levels: crate::types::Sector::COUNT,
            income_tier_levels: crate::types::IncomeTier::COUNT,
        }
    }
}

/// Rolling baseline parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Trailing window of monthly aggregates kept per person
    pub window_months: u32,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self { window_months: 24 }
    }
}

/// Scoring model configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path of the versioned model artifact (JSON)
    pub artifact_path: String,
    /// Operator override of the model's operating threshold
    pub threshold_override: Option<f64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            artifact_path: "models/income_anomaly_lr.json".to_string(),
            threshold_override: None,
        }
    }
}

/// Thresholds of the deterministic explanation rules
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExplanationConfig {
    /// Flags shown per result
    pub max_flags: usize,
    pub structuring_pct: f64,
    pub spike_multiple: f64,
    pub unverified_rate: f64,
    pub burst_ratio: f64,
    pub velocity_increase: f64,
    pub velocity_decrease: f64,
    pub volatility_cv: f64,
    pub pattern_break_deviation: f64,
    pub night_pct: f64,
    pub weekend_timing_pct: f64,
    pub weekend_heavy_pct: f64,
    pub round_amount_pct: f64,
    pub many_sources_count: f64,
    pub many_sources_concentration: f64,
    pub cash_rate: f64,
}

impl Default for ExplanationConfig {
    fn default() -> Self {
        Self {
            max_flags: 3,
            structuring_pct: 0.3,
            spike_multiple: 3.0,
            unverified_rate: 0.5,
            burst_ratio: 5.0,
            velocity_increase: 2.0,
            velocity_decrease: -0.7,
            volatility_cv: 0.5,
            pattern_break_deviation: 2.0,
            night_pct: 0.3,
            weekend_timing_pct: 0.5,
            weekend_heavy_pct: 0.4,
            round_amount_pct: 0.6,
            many_sources_count: 3.0,
            many_sources_concentration: 0.5,
            cash_rate: 0.6,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of concurrent workers in batch mode
    pub workers: usize,
    /// Retries of the retryable failed subset
    pub max_retries: u32,
    /// Batch job timeout in milliseconds
    pub timeout_ms: u64,
    /// Capacity of the result channel (backpressure on slow consumers)
    pub result_buffer: usize,
    /// Interval between full-population sweeps
    pub sweep_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 2,
            timeout_ms: 300_000,
            result_buffer: 256,
            sweep_interval_secs: 3_600,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `$INCOME_ANOMALY_CONFIG` or `config/config.toml`
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config/config.toml".to_string());
        Self::load_from_path(path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .context("Failed to build configuration")?;

        let config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if let Some(threshold) = self.model.threshold_override {
            anyhow::ensure!(
                (0.0..=1.0).contains(&threshold),
                "threshold_override must be within [0, 1], got {}",
                threshold
            );
        }
        anyhow::ensure!(self.features.evaluation_months > 0, "evaluation_months must be positive");
        anyhow::ensure!(self.features.min_observations > 0, "min_observations must be positive");
        anyhow::ensure!(
            self.features.night_start_hour < 24 && self.features.night_end_hour < 24,
            "night band hours must be within 0..24"
        );
        anyhow::ensure!(
            self.features.round_units.iter().all(|u| u.is_finite() && *u > 0.0),
            "round_units must be positive"
        );
        anyhow::ensure!(self.baseline.window_months > 0, "baseline window_months must be positive");
        anyhow::ensure!(self.pipeline.workers > 0, "pipeline workers must be positive");
        anyhow::ensure!(self.pipeline.result_buffer > 0, "result_buffer must be positive");
        Ok(())
    }
}
