//! Income Anomaly Pipeline Library
//!
//! Scores a person's recent income pattern against their own rolling
//! baseline, labels it against a versioned model's operating threshold and
//! attaches rule-based audit flags for human review.

pub mod baseline;
pub mod classifier;
pub mod config;
pub mod consumer;
pub mod error;
pub mod explain;
pub mod feature_extractor;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod producer;
pub mod source;
pub mod types;

pub use config::AppConfig;
pub use error::{PipelineError, PipelineResult};
pub use feature_extractor::FeatureExtractor;
pub use models::inference::ScoringEngine;
pub use pipeline::ClassificationPipeline;
pub use types::{
    classification::{ClassificationResult, ReviewOutcome},
    transaction::Transaction,
};
