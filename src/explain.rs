//! Deterministic audit flags over the feature vector.
//!
//! Rules are independent of the statistical model so a reviewer always has
//! a human-readable reason next to the score.

use crate::config::ExplanationConfig;
use crate::feature_extractor::FeatureVector;
use crate::types::classification::{FlagType, Label};

/// Flags shown for one result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Explanation {
    /// Matched rules in priority order, capped
    pub flags: Vec<FlagType>,
    /// Rules matched before capping
    pub total_matched: usize,
}

pub struct ExplanationGenerator {
    config: ExplanationConfig,
}

impl ExplanationGenerator {
    pub fn new(config: ExplanationConfig) -> Self {
        Self { config }
    }

    /// Every rule that fires, highest priority first
    pub fn matched_rules(&self, v: &FeatureVector) -> Vec<FlagType> {
        let c = &self.config;
        let weekend = v.value("weekend_pct");
        let deviation = v.value("max_deviation_from_mean");
        let velocity = v.value("velocity_change");

        let rules = [
            (FlagType::Structuring, v.value("near_50k_pct") > c.structuring_pct),
            (
                FlagType::SuddenSpike,
                v.value("max_mom_increase") > c.spike_multiple || deviation > c.spike_multiple,
            ),
            (FlagType::UnverifiedIncome, v.value("unverified_rate") > c.unverified_rate),
            (FlagType::DormantBurst, v.value("burst_ratio") > c.burst_ratio),
            (
                FlagType::VelocityChange,
                velocity > c.velocity_increase || velocity < c.velocity_decrease,
            ),
            (FlagType::HighVolatility, v.value("income_cv") > c.volatility_cv),
            (FlagType::PatternBreak, deviation > c.pattern_break_deviation),
            (
                FlagType::SuspiciousTiming,
                v.value("night_hours_pct") > c.night_pct || weekend > c.weekend_timing_pct,
            ),
            (FlagType::WeekendHeavy, weekend > c.weekend_heavy_pct),
            (FlagType::RoundAmounts, v.value("round_amount_pct") > c.round_amount_pct),
            (
                FlagType::ManySources,
                v.value("num_unique_sources") >= c.many_sources_count
                    && v.value("source_concentration") < c.many_sources_concentration,
            ),
            (FlagType::CashHeavy, v.value("cash_deposit_rate") > c.cash_rate),
        ];

        rules
            .into_iter()
            .filter_map(|(flag, fired)| fired.then_some(flag))
            .collect()
    }

    /// Capped flags for a labelled vector. An anomaly no rule explains is
    /// marked score-only.
    pub fn explain(&self, v: &FeatureVector, label: Label) -> Explanation {
        let mut flags = self.matched_rules(v);
        let total_matched = flags.len();

        if flags.is_empty() && label == Label::Anomaly {
            flags.push(FlagType::ScoreOnly);
        }
        flags.truncate(self.config.max_flags.max(1));

        Explanation {
            flags,
            total_matched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_extractor::{extractor_schema, FEATURE_COUNT};
    use chrono::{TimeZone, Utc};

    fn vector(features: &[(&str, f64)]) -> FeatureVector {
        let schema = extractor_schema();
        let mut values = vec![0.0; FEATURE_COUNT];
        // A single steady source by default
        values[schema.index_of("source_concentration").unwrap()] = 1.0;
        values[schema.index_of("num_unique_sources").unwrap()] = 1.0;
        for (name, value) in features {
            values[schema.index_of(name).unwrap()] = *value;
        }
        FeatureVector::new("p1", Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(), 6, schema, values).unwrap()
    }

    fn generator() -> ExplanationGenerator {
        ExplanationGenerator::new(ExplanationConfig::default())
    }

    #[test]
    fn test_quiet_vector_has_no_flags() {
        let explanation = generator().explain(&vector(&[]), Label::Normal);
        assert!(explanation.flags.is_empty());
        assert_eq!(explanation.total_matched, 0);
    }

    #[test]
    fn test_structuring_outranks_timing() {
        let v = vector(&[
            ("near_50k_pct", 1.0),
            ("unverified_rate", 1.0),
            ("weekend_pct", 1.0),
            ("night_hours_pct", 1.0),
            ("num_unique_sources", 3.0),
            ("source_concentration", 0.4),
        ]);
        let explanation = generator().explain(&v, Label::Anomaly);

        assert_eq!(
            explanation.flags,
            vec![FlagType::Structuring, FlagType::UnverifiedIncome, FlagType::SuspiciousTiming]
        );
        // + weekend heavy, many sources
        assert_eq!(explanation.total_matched, 5);
    }

    #[test]
    fn test_score_only_anomaly() {
        let explanation = generator().explain(&vector(&[]), Label::Anomaly);
        assert_eq!(explanation.flags, vec![FlagType::ScoreOnly]);
        assert_eq!(explanation.total_matched, 0);
    }

    #[test]
    fn test_rules_fire_independently_of_label() {
        let v = vector(&[("cash_deposit_rate", 0.9), ("velocity_change", -0.8)]);
        let explanation = generator().explain(&v, Label::Normal);
        assert_eq!(explanation.flags, vec![FlagType::VelocityChange, FlagType::CashHeavy]);
    }

    #[test]
    fn test_spike_also_breaks_pattern() {
        let v = vector(&[("max_deviation_from_mean", 29.0), ("max_mom_increase", 29.0)]);
        let flags = generator().matched_rules(&v);
        assert_eq!(flags, vec![FlagType::SuddenSpike, FlagType::PatternBreak]);
    }

    #[test]
    fn test_max_flags_cap() {
        let config = ExplanationConfig {
            max_flags: 1,
            ..ExplanationConfig::default()
        };
        let v = vector(&[("round_amount_pct", 1.0), ("income_cv", 0.9)]);
        let explanation = ExplanationGenerator::new(config).explain(&v, Label::Anomaly);
        assert_eq!(explanation.flags, vec![FlagType::HighVolatility]);
        assert_eq!(explanation.total_matched, 2);
    }
}
