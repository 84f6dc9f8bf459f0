//! Scorer contract and the versioned scoring model built around it

use crate::error::{PipelineError, PipelineResult};
use crate::feature_extractor::{FeatureSchema, FeatureVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One scoring function: standardized feature values in, probability out.
///
/// Implementations are selected by the artifact's declared `type`.
pub trait Scorer: Send + Sync + fmt::Debug {
    /// Artifact tag of this scorer
    fn kind(&self) -> &'static str;

    /// Anomaly probability for one feature row
    fn score(&self, features: &[f64]) -> anyhow::Result<f64>;
}

pub(crate) fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Logistic regression over the feature row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticScorer {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LogisticScorer {
    pub(crate) fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.coefficients.len() != n_features {
            return Err(format!(
                "logistic scorer has {} coefficients for {} features",
                self.coefficients.len(),
                n_features
            ));
        }
        if !self.intercept.is_finite() || self.coefficients.iter().any(|c| !c.is_finite()) {
            return Err("logistic scorer has non-finite parameters".to_string());
        }
        Ok(())
    }
}

impl Scorer for LogisticScorer {
    fn kind(&self) -> &'static str {
        "logistic"
    }

    fn score(&self, features: &[f64]) -> anyhow::Result<f64> {
        anyhow::ensure!(
            features.len() == self.coefficients.len(),
            "expected {} features, got {}",
            self.coefficients.len(),
            features.len()
        );
        let z = self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(w, x)| w * x)
                .sum::<f64>();
        Ok(sigmoid(z))
    }
}

/// Training-time standardisation `(x - mean) / scale`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl Scaler {
    pub(crate) fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.mean.len() != n_features || self.scale.len() != n_features {
            return Err(format!(
                "scaler has {} means and {} scales for {} features",
                self.mean.len(),
                self.scale.len(),
                n_features
            ));
        }
        if self.mean.iter().chain(&self.scale).any(|v| !v.is_finite()) {
            return Err("scaler has non-finite parameters".to_string());
        }
        Ok(())
    }

    pub fn transform(&self, values: &[f64]) -> Vec<f64> {
        values
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (mean, scale))| {
                let scale = if *scale == 0.0 { 1.0 } else { *scale };
                (x - mean) / scale
            })
            .collect()
    }
}

/// Immutable, versioned scoring model.
///
/// Scoring refuses to run on a vector whose schema differs from the one the
/// model was trained on.
pub struct ScoringModel {
    version: String,
    training_metadata_id: String,
    operating_threshold: f64,
    schema: Arc<FeatureSchema>,
    scaler: Option<Scaler>,
    scorer: Box<dyn Scorer>,
}

impl ScoringModel {
    pub fn new(
        version: impl Into<String>,
        training_metadata_id: impl Into<String>,
        operating_threshold: f64,
        schema: Arc<FeatureSchema>,
        scaler: Option<Scaler>,
        scorer: Box<dyn Scorer>,
    ) -> Self {
        Self {
            version: version.into(),
            training_metadata_id: training_metadata_id.into(),
            operating_threshold,
            schema,
            scaler,
            scorer,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn training_metadata_id(&self) -> &str {
        &self.training_metadata_id
    }

    pub fn operating_threshold(&self) -> f64 {
        self.operating_threshold
    }

    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    pub fn scorer_kind(&self) -> &'static str {
        self.scorer.kind()
    }

    /// Anomaly probability in [0, 1] for `vector`.
    pub fn score(&self, vector: &FeatureVector) -> PipelineResult<f64> {
        if !Arc::ptr_eq(&self.schema, vector.schema()) {
            if let Some(mismatch) = self.schema.mismatch(vector.schema()) {
                return Err(PipelineError::SchemaMismatch(format!(
                    "model {}: {}",
                    self.version, mismatch
                )));
            }
        }

        let probability = match &self.scaler {
            Some(scaler) => self.scorer.score(&scaler.transform(vector.values())),
            None => self.scorer.score(vector.values()),
        }
        .map_err(|e| PipelineError::Scoring {
            version: self.version.clone(),
            reason: e.to_string(),
        })?;

        if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
            return Err(PipelineError::Scoring {
                version: self.version.clone(),
                reason: format!("probability {} outside [0, 1]", probability),
            });
        }
        Ok(probability)
    }
}

impl fmt::Debug for ScoringModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoringModel")
            .field("version", &self.version)
            .field("training_metadata_id", &self.training_metadata_id)
            .field("operating_threshold", &self.operating_threshold)
            .field("scorer", &self.scorer.kind())
            .field("scaled", &self.scaler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_extractor::{extractor_schema, FeatureField, FeatureKind, FEATURE_COUNT};
    use chrono::{TimeZone, Utc};

    #[derive(Debug)]
    struct Constant(f64);

    impl Scorer for Constant {
        fn kind(&self) -> &'static str {
            "constant"
        }

        fn score(&self, _features: &[f64]) -> anyhow::Result<f64> {
            Ok(self.0)
        }
    }

    fn vector(schema: Arc<FeatureSchema>) -> FeatureVector {
        let n = schema.len();
        FeatureVector::new("p1", Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(), 6, schema, vec![0.5; n])
            .unwrap()
    }

    fn model(scorer: Box<dyn Scorer>) -> ScoringModel {
        ScoringModel::new("test-1", "run-1", 0.5, extractor_schema(), None, scorer)
    }

    #[test]
    fn test_logistic_scorer() {
        let scorer = LogisticScorer {
            intercept: -1.0,
            coefficients: vec![2.0, 0.0],
        };
        let p = scorer.score(&[0.5, 100.0]).unwrap();
        assert!((p - 0.5).abs() < 1e-12);
        assert!(scorer.score(&[1.0]).is_err());
        assert!(scorer.validate(3).is_err());
    }

    #[test]
    fn test_scaler_treats_zero_scale_as_one() {
        let scaler = Scaler {
            mean: vec![1.0, 2.0],
            scale: vec![2.0, 0.0],
        };
        assert_eq!(scaler.transform(&[5.0, 3.0]), vec![2.0, 1.0]);
    }

    #[test]
    fn test_schema_mismatch_refuses_to_score() {
        let mut fields = extractor_schema().fields().to_vec();
        fields[0] = FeatureField {
            name: "renamed".to_string(),
            kind: FeatureKind::Proportion,
        };
        let foreign = vector(Arc::new(FeatureSchema::new(fields)));

        let err = model(Box::new(Constant(0.3))).score(&foreign).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch(_)));
    }

    #[test]
    fn test_out_of_range_probability_is_a_scoring_error() {
        let v = vector(extractor_schema());
        assert!(matches!(
            model(Box::new(Constant(f64::NAN))).score(&v),
            Err(PipelineError::Scoring { .. })
        ));
        assert!(model(Box::new(Constant(1.2))).score(&v).is_err());
        assert_eq!(model(Box::new(Constant(0.25))).score(&v).unwrap(), 0.25);
    }

    #[test]
    fn test_equal_but_distinct_schema_is_accepted() {
        let copy = Arc::new(FeatureSchema::new(extractor_schema().fields().to_vec()));
        assert_eq!(copy.len(), FEATURE_COUNT);
        assert!(model(Box::new(Constant(0.4))).score(&vector(copy)).is_ok());
    }
}
