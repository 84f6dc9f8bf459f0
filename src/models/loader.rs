//! Versioned model artifact loader

use crate::error::{PipelineError, PipelineResult};
use crate::feature_extractor::FeatureSchema;
use crate::models::aggregator::WeightedEnsembleScorer;
use crate::models::scorer::{LogisticScorer, Scaler, Scorer, ScoringModel};
use crate::models::tree::TreeEnsembleScorer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// On-disk JSON form of a trained model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: String,
    pub training_metadata_id: String,
    pub operating_threshold: f64,
    pub feature_schema: FeatureSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaler: Option<Scaler>,
    pub scorer: ScorerSpec,
}

/// Scoring function representation, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScorerSpec {
    Logistic(LogisticScorer),
    TreeEnsemble(TreeEnsembleScorer),
    WeightedEnsemble { members: Vec<EnsembleMember> },
    /// ONNX graph, path relative to the artifact file
    Onnx { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleMember {
    pub weight: f64,
    pub scorer: ScorerSpec,
}

impl ScorerSpec {
    fn build(self, n_features: usize, base_dir: &Path) -> Result<Box<dyn Scorer>, String> {
        match self {
            ScorerSpec::Logistic(scorer) => {
                scorer.validate(n_features)?;
                Ok(Box::new(scorer))
            }
            ScorerSpec::TreeEnsemble(scorer) => {
                scorer.validate(n_features)?;
                Ok(Box::new(scorer))
            }
            ScorerSpec::WeightedEnsemble { members } => {
                let members = members
                    .into_iter()
                    .map(|m| Ok((m.weight, m.scorer.build(n_features, base_dir)?)))
                    .collect::<Result<Vec<_>, String>>()?;
                Ok(Box::new(WeightedEnsembleScorer::new(members)?))
            }
            ScorerSpec::Onnx { path } => Self::build_onnx(base_dir.join(path)),
        }
    }

    #[cfg(feature = "onnx")]
    fn build_onnx(path: PathBuf) -> Result<Box<dyn Scorer>, String> {
        crate::models::onnx::OnnxScorer::load(&path)
            .map(|s| Box::new(s) as Box<dyn Scorer>)
            .map_err(|e| format!("{:#}", e))
    }

    #[cfg(not(feature = "onnx"))]
    fn build_onnx(path: PathBuf) -> Result<Box<dyn Scorer>, String> {
        Err(format!(
            "{} needs the onnx feature, which this build does not include",
            path.display()
        ))
    }
}

/// Loads artifacts and validates them against the extractor's schema
#[derive(Debug, Clone)]
pub struct ModelLoader {
    expected: Arc<FeatureSchema>,
}

impl ModelLoader {
    pub fn new(expected: Arc<FeatureSchema>) -> Self {
        Self { expected }
    }

    pub fn expected_schema(&self) -> &Arc<FeatureSchema> {
        &self.expected
    }

    /// Load and validate a JSON artifact from disk
    pub fn load<P: AsRef<Path>>(&self, path: P) -> PipelineResult<ScoringModel> {
        let path = path.as_ref();
        let origin = path.display().to_string();

        let raw = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::model_load(&origin, e.to_string()))?;
        let artifact: ModelArtifact = serde_json::from_str(&raw)
            .map_err(|e| PipelineError::model_load(&origin, e.to_string()))?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let model = self.from_artifact(artifact, &origin, base_dir)?;

        info!(
            path = %origin,
            version = %model.version(),
            scorer = model.scorer_kind(),
            threshold = model.operating_threshold(),
            "Model artifact loaded"
        );
        Ok(model)
    }

    /// Validate an in-memory artifact and build its model
    pub fn from_artifact(
        &self,
        artifact: ModelArtifact,
        origin: &str,
        base_dir: &Path,
    ) -> PipelineResult<ScoringModel> {
        if let Some(mismatch) = self.expected.mismatch(&artifact.feature_schema) {
            return Err(PipelineError::SchemaMismatch(format!(
                "artifact {} ({}): {}",
                origin, artifact.version, mismatch
            )));
        }
        if artifact.version.trim().is_empty() {
            return Err(PipelineError::model_load(origin, "empty version"));
        }
        let threshold = artifact.operating_threshold;
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::model_load(
                origin,
                format!("operating_threshold {} outside [0, 1]", threshold),
            ));
        }

        let n_features = self.expected.len();
        if let Some(scaler) = &artifact.scaler {
            scaler
                .validate(n_features)
                .map_err(|e| PipelineError::model_load(origin, e))?;
        }
        let scorer = artifact
            .scorer
            .build(n_features, base_dir)
            .map_err(|e| PipelineError::model_load(origin, e))?;

        Ok(ScoringModel::new(
            artifact.version,
            artifact.training_metadata_id,
            threshold,
            self.expected.clone(),
            artifact.scaler,
            scorer,
        ))
    }
}
