//! Score aggregation for multi-model ensembles

use crate::models::scorer::Scorer;

/// Weighted mean of member scorer probabilities.
///
/// Weights are normalized to sum to 1.
#[derive(Debug)]
pub struct WeightedEnsembleScorer {
    members: Vec<(f64, Box<dyn Scorer>)>,
}

impl WeightedEnsembleScorer {
    pub fn new(members: Vec<(f64, Box<dyn Scorer>)>) -> Result<Self, String> {
        if members.is_empty() {
            return Err("weighted ensemble has no members".to_string());
        }
        if members.iter().any(|(w, _)| !w.is_finite() || *w < 0.0) {
            return Err("ensemble weights must be finite and non-negative".to_string());
        }
        if members.iter().map(|(w, _)| w).sum::<f64>() <= 0.0 {
            return Err("ensemble weights sum to zero".to_string());
        }
        Ok(Self { members })
    }

    pub fn member_kinds(&self) -> Vec<&'static str> {
        self.members.iter().map(|(_, s)| s.kind()).collect()
    }
}

impl Scorer for WeightedEnsembleScorer {
    fn kind(&self) -> &'static str {
        "weighted_ensemble"
    }

    fn score(&self, features: &[f64]) -> anyhow::Result<f64> {
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;

        for (weight, scorer) in &self.members {
            let score = scorer.score(features)?;
            anyhow::ensure!(
                score.is_finite(),
                "{} member produced a non-finite score",
                scorer.kind()
            );
            weighted_sum += score * weight;
            total_weight += weight;
        }

        Ok((weighted_sum / total_weight).clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::scorer::LogisticScorer;

    fn constant(p: f64) -> Box<dyn Scorer> {
        // sigmoid(logit(p)) with no coefficients
        Box::new(LogisticScorer {
            intercept: (p / (1.0 - p)).ln(),
            coefficients: vec![],
        })
    }

    #[test]
    fn test_weighted_aggregation() {
        let ensemble = WeightedEnsembleScorer::new(vec![(3.0, constant(0.8)), (1.0, constant(0.4))]).unwrap();
        // (0.8*3 + 0.4*1) / 4 = 0.7
        assert!((ensemble.score(&[]).unwrap() - 0.7).abs() < 1e-9);
        assert_eq!(ensemble.member_kinds(), vec!["logistic", "logistic"]);
    }

    #[test]
    fn test_member_failure_propagates() {
        let broken: Box<dyn Scorer> = Box::new(LogisticScorer {
            intercept: 0.0,
            coefficients: vec![1.0],
        });
        let ensemble = WeightedEnsembleScorer::new(vec![(1.0, constant(0.5)), (1.0, broken)]).unwrap();
        assert!(ensemble.score(&[]).is_err());
    }

    #[test]
    fn test_invalid_weights() {
        assert!(WeightedEnsembleScorer::new(vec![]).is_err());
        assert!(WeightedEnsembleScorer::new(vec![(0.0, constant(0.5))]).is_err());
        assert!(WeightedEnsembleScorer::new(vec![(-1.0, constant(0.5)), (2.0, constant(0.5))]).is_err());
    }
}
