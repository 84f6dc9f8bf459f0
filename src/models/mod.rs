//! Scoring model components

pub mod aggregator;
pub mod inference;
pub mod loader;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod scorer;
pub mod tree;

pub use aggregator::WeightedEnsembleScorer;
pub use inference::ScoringEngine;
pub use loader::{ModelArtifact, ModelLoader, ScorerSpec};
pub use scorer::{LogisticScorer, Scorer, ScoringModel};
pub use tree::TreeEnsembleScorer;
