//! Feature extraction for income pattern anomaly scoring.
//!
//! Turns one person's transactions over an evaluation window, their rolling
//! baseline and their profile into the fixed 22-field vector the scoring
//! models were trained on. Field order is the schema contract with every
//! model artifact.

use crate::baseline::{BaselineReference, WorkerBaseline};
use crate::config::FeatureConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::types::calendar::Calendar;
use crate::types::transaction::{Channel, PersonProfile, Transaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Number of features produced
pub const FEATURE_COUNT: usize = 22;

/// How a feature's values are bounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    /// Clamped to [0, 1]
    Proportion,
    Count,
    /// Unbounded but finite
    Ratio,
    Categorical,
}

/// Feature order, matching training.
const FEATURES: [(&str, FeatureKind); FEATURE_COUNT] = [
    ("unverified_rate", FeatureKind::Proportion),
    ("weekend_pct", FeatureKind::Proportion),
    ("night_hours_pct", FeatureKind::Proportion),
    ("source_concentration", FeatureKind::Proportion),
    ("num_unique_sources", FeatureKind::Count),
    ("income_cv", FeatureKind::Ratio),
    ("max_deviation_from_mean", FeatureKind::Ratio),
    ("amount_range_ratio", FeatureKind::Ratio),
    ("round_amount_pct", FeatureKind::Proportion),
    ("near_50k_pct", FeatureKind::Proportion),
    ("very_high_pct", FeatureKind::Proportion),
    ("avg_tx_per_month", FeatureKind::Ratio),
    ("velocity_change", FeatureKind::Ratio),
    ("burst_ratio", FeatureKind::Ratio),
    ("freq_cv", FeatureKind::Ratio),
    ("max_mom_increase", FeatureKind::Ratio),
    ("avg_mom_change", FeatureKind::Ratio),
    ("pct_high_deviation", FeatureKind::Proportion),
    ("cash_deposit_rate", FeatureKind::Proportion),
    ("sector_encoded", FeatureKind::Categorical),
    ("income_tier_encoded", FeatureKind::Categorical),
    ("is_formal", FeatureKind::Categorical),
];

/// One named, typed field of a feature schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureField {
    pub name: String,
    pub kind: FeatureKind,
}

/// Ordered list of feature fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSchema {
    fields: Vec<FeatureField>,
}

impl FeatureSchema {
    pub fn new(fields: Vec<FeatureField>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[FeatureField] {
        &self.fields
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// First difference from `other`, if any.
    pub fn mismatch(&self, other: &FeatureSchema) -> Option<String> {
        if let Some((i, (a, b))) = self
            .fields
            .iter()
            .zip(other.fields.iter())
            .enumerate()
            .find(|(_, (a, b))| a != b)
        {
            return Some(format!(
                "field {} is {} ({:?}) but expected {} ({:?})",
                i, b.name, b.kind, a.name, a.kind
            ));
        }
        if self.len() != other.len() {
            return Some(format!("{} fields but expected {}", other.len(), self.len()));
        }
        None
    }
}

/// The schema every vector from [`FeatureExtractor`] carries
pub fn extractor_schema() -> Arc<FeatureSchema> {
    static SCHEMA: OnceLock<Arc<FeatureSchema>> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            Arc::new(FeatureSchema::new(
                FEATURES
                    .iter()
                    .map(|(name, kind)| FeatureField {
                        name: name.to_string(),
                        kind: *kind,
                    })
                    .collect(),
            ))
        })
        .clone()
}

/// Immutable feature vector for one person and window
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub person_id: String,
    pub window_end: DateTime<Utc>,
    pub observation_count: usize,
    schema: Arc<FeatureSchema>,
    values: Vec<f64>,
}

impl FeatureVector {
    /// Build a vector against an explicit schema.
    pub fn new(
        person_id: impl Into<String>,
        window_end: DateTime<Utc>,
        observation_count: usize,
        schema: Arc<FeatureSchema>,
        values: Vec<f64>,
    ) -> PipelineResult<Self> {
        if schema.len() != values.len() {
            return Err(PipelineError::SchemaMismatch(format!(
                "{} values for {} schema fields",
                values.len(),
                schema.len()
            )));
        }
        Ok(Self {
            person_id: person_id.into(),
            window_end,
            observation_count,
            schema,
            values,
        })
    }

    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.schema.index_of(name).map(|i| self.values[i])
    }

    /// `get` for fields the extractor always produces; 0 if absent.
    pub(crate) fn value(&self, name: &str) -> f64 {
        self.get(name).unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.schema.names().zip(self.values.iter().copied())
    }
}

/// Feature extractor for income pattern anomaly detection.
pub struct FeatureExtractor {
    config: FeatureConfig,
    calendar: Calendar,
    schema: Arc<FeatureSchema>,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig, calendar: Calendar) -> Self {
        Self {
            config,
            calendar,
            schema: extractor_schema(),
        }
    }

    pub fn feature_count(&self) -> usize {
        FEATURE_COUNT
    }

    pub fn feature_names(&self) -> Vec<&'static str> {
        FEATURES.iter().map(|(name, _)| *name).collect()
    }

    pub fn schema(&self) -> Arc<FeatureSchema> {
        self.schema.clone()
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Evaluation window `[start, window_end)`.
    pub fn window(&self, window_end: DateTime<Utc>) -> PipelineResult<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self
            .calendar
            .sub_months(window_end, self.config.evaluation_months)
            .ok_or_else(|| {
                PipelineError::InvalidTransaction(format!("window end {} out of range", window_end))
            })?;
        Ok((start, window_end))
    }

    /// Extract the feature vector for `person_id` over the window ending at `window_end`.
    ///
    /// `transactions` must all fall inside the window. `baseline` supplies the
    /// personal reference from months before the window; without pre-window
    /// history the window's own averages are used.
    pub fn extract(
        &self,
        person_id: &str,
        window_end: DateTime<Utc>,
        transactions: &[Transaction],
        baseline: Option<&WorkerBaseline>,
        profile: Option<&PersonProfile>,
    ) -> PipelineResult<FeatureVector> {
        let (start, end) = self.window(window_end)?;
        self.validate(person_id, start, end, transactions)?;

        let mut txs: Vec<&Transaction> = transactions.iter().collect();
        txs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        self.check_minimum_data(person_id, &txs)?;
        let (sector, tier, formal) = self.profile_encodings(person_id, profile)?;

        let reference = baseline
            .map(|b| b.reference_before(self.calendar.month_of(start)))
            .filter(|r| !r.is_empty());

        let n = txs.len() as f64;
        let fraction = |pred: &dyn Fn(&Transaction) -> bool| txs.iter().filter(|t| pred(t)).count() as f64 / n;

        let unverified_rate = fraction(&|t| !t.source_verified);
        let weekend_pct = fraction(&|t| self.calendar.is_weekend(t.timestamp));
        let night_hours_pct = fraction(&|t| self.is_night(self.calendar.hour_of(t.timestamp)));

        let mut per_source: HashMap<&str, f64> = HashMap::new();
        for t in &txs {
            *per_source.entry(t.source_id.as_str()).or_insert(0.0) += t.amount;
        }
        let total_amount: f64 = txs.iter().map(|t| t.amount).sum();
        let max_source = per_source.values().copied().fold(0.0, f64::max);
        let source_concentration = if total_amount > 0.0 { max_source / total_amount } else { 0.0 };
        let num_unique_sources = per_source.len() as f64;

        let (monthly_totals, monthly_counts) = self.monthly_series(&txs);
        let income_cv = coefficient_of_variation(&monthly_totals);
        let max_deviation_from_mean = max_deviation(&monthly_totals, reference.as_ref());

        let max_amount = txs.iter().map(|t| t.amount).fold(0.0, f64::max);
        let min_amount = txs.iter().map(|t| t.amount).fold(f64::INFINITY, f64::min).max(1.0);
        let amount_range_ratio = max_amount / min_amount;

        let round_amount_pct = fraction(&|t| self.is_round(t.amount));
        let near_50k_pct = fraction(&|t| self.config.structuring_bands.iter().any(|b| b.contains(t.amount)));
        let very_high_pct = fraction(&|t| t.amount > self.config.high_value_cutoff);

        let avg_tx_per_month = mean(&monthly_counts);
        let freq_cv = coefficient_of_variation(&monthly_counts);

        let midpoint = start + (end - start) / 2;
        let first_half = txs.iter().filter(|t| t.timestamp < midpoint).count() as f64;
        let second_half = n - first_half;
        let velocity_change = if first_half > 0.0 { (second_half - first_half) / first_half } else { 0.0 };

        let max_count = monthly_counts.iter().copied().fold(0.0, f64::max);
        let burst_ratio = if avg_tx_per_month > 0.0 { max_count / avg_tx_per_month } else { 0.0 };

        let changes = month_over_month(&monthly_totals);
        let max_mom_increase = changes.iter().copied().fold(0.0, f64::max);
        let avg_mom_change = if changes.is_empty() {
            0.0
        } else {
            changes.iter().map(|c| c.abs()).sum::<f64>() / changes.len() as f64
        };

        let per_tx_mean = reference
            .map(|r| r.mean_transaction_amount)
            .filter(|m| *m > 0.0)
            .unwrap_or(total_amount / n);
        let limit = self.config.deviation_multiple * per_tx_mean;
        let pct_high_deviation = if per_tx_mean > 0.0 {
            fraction(&|t| (t.amount - per_tx_mean).abs() > limit)
        } else {
            0.0
        };

        let cash_deposit_rate = fraction(&|t| t.channel == Channel::Cash);

        let mut values = vec![
            unverified_rate,
            weekend_pct,
            night_hours_pct,
            source_concentration,
            num_unique_sources,
            income_cv,
            max_deviation_from_mean,
            amount_range_ratio,
            round_amount_pct,
            near_50k_pct,
            very_high_pct,
            avg_tx_per_month,
            velocity_change,
            burst_ratio,
            freq_cv,
            max_mom_increase,
            avg_mom_change,
            pct_high_deviation,
            cash_deposit_rate,
            sector,
            tier,
            formal,
        ];

        for (value, (name, kind)) in values.iter_mut().zip(FEATURES.iter()) {
            if !value.is_finite() {
                return Err(PipelineError::InvalidTransaction(format!(
                    "feature {} is not finite for {}",
                    name, person_id
                )));
            }
            if *kind == FeatureKind::Proportion {
                *value = value.clamp(0.0, 1.0);
            }
        }

        FeatureVector::new(person_id, window_end, txs.len(), self.schema.clone(), values)
    }

    fn validate(
        &self,
        person_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        transactions: &[Transaction],
    ) -> PipelineResult<()> {
        for t in transactions {
            if !t.has_valid_amount() {
                return Err(PipelineError::InvalidTransaction(format!(
                    "transaction {} has invalid amount {}",
                    t.id, t.amount
                )));
            }
            if t.timestamp < start || t.timestamp >= end {
                return Err(PipelineError::InvalidTransaction(format!(
                    "transaction {} at {} is outside window [{}, {})",
                    t.id, t.timestamp, start, end
                )));
            }
            if t.person_id != person_id {
                return Err(PipelineError::InvalidTransaction(format!(
                    "transaction {} belongs to {}, not {}",
                    t.id, t.person_id, person_id
                )));
            }
        }
        Ok(())
    }

    fn check_minimum_data(&self, person_id: &str, txs: &[&Transaction]) -> PipelineResult<()> {
        if txs.len() < self.config.min_observations {
            return Err(PipelineError::insufficient(
                person_id,
                format!(
                    "{} transactions, at least {} required",
                    txs.len(),
                    self.config.min_observations
                ),
            ));
        }

        let (Some(first), Some(last)) = (txs.first(), txs.last()) else {
            return Err(PipelineError::insufficient(person_id, "no transactions"));
        };
        let spans = self
            .calendar
            .add_months(first.timestamp, self.config.min_span_months)
            .is_some_and(|required| last.timestamp >= required);
        if !spans {
            return Err(PipelineError::insufficient(
                person_id,
                format!(
                    "transactions span {} to {}, less than {} month(s)",
                    first.timestamp, last.timestamp, self.config.min_span_months
                ),
            ));
        }
        Ok(())
    }

    fn profile_encodings(
        &self,
        person_id: &str,
        profile: Option<&PersonProfile>,
    ) -> PipelineResult<(f64, f64, f64)> {
        let invalid = |reason: String| PipelineError::InvalidProfile {
            person_id: person_id.to_string(),
            reason,
        };
        let profile = profile.ok_or_else(|| invalid("no profile record".to_string()))?;

        let sector = profile
            .sector_encoded
            .ok_or_else(|| invalid("sector_encoded missing".to_string()))?;
        if sector >= self.config.sector_levels {
            return Err(invalid(format!(
                "sector_encoded {} outside 0..{}",
                sector, self.config.sector_levels
            )));
        }

        let tier = profile
            .income_tier_encoded
            .ok_or_else(|| invalid("income_tier_encoded missing".to_string()))?;
        if tier >= self.config.income_tier_levels {
            return Err(invalid(format!(
                "income_tier_encoded {} outside 0..{}",
                tier, self.config.income_tier_levels
            )));
        }

        let formal = profile
            .is_formal
            .ok_or_else(|| invalid("is_formal missing".to_string()))?;

        Ok((sector as f64, tier as f64, if formal { 1.0 } else { 0.0 }))
    }

    /// Night band is inclusive and may wrap past midnight.
    fn is_night(&self, hour: u32) -> bool {
        let (from, to) = (self.config.night_start_hour, self.config.night_end_hour);
        if from <= to {
            hour >= from && hour <= to
        } else {
            hour >= from || hour <= to
        }
    }

    fn is_round(&self, amount: f64) -> bool {
        amount > 0.0
            && self.config.round_units.iter().any(|unit| {
                let rem = amount % unit;
                rem < 1e-6 || unit - rem < 1e-6
            })
    }

    /// Monthly totals and counts from the first to the last active month, gaps zero-filled.
    fn monthly_series(&self, txs: &[&Transaction]) -> (Vec<f64>, Vec<f64>) {
        let (Some(first), Some(last)) = (txs.first(), txs.last()) else {
            return (Vec::new(), Vec::new());
        };
        let first_month = self.calendar.month_of(first.timestamp);
        let months = first_month.months_until(self.calendar.month_of(last.timestamp)).max(0) as usize + 1;

        let mut totals = vec![0.0; months];
        let mut counts = vec![0.0; months];
        for t in txs {
            let idx = first_month.months_until(self.calendar.month_of(t.timestamp)) as usize;
            totals[idx] += t.amount;
            counts[idx] += 1.0;
        }
        (totals, counts)
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(FeatureConfig::default(), Calendar::utc())
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Population standard deviation over mean; 0 when the mean is 0.
fn coefficient_of_variation(values: &[f64]) -> f64 {
    let mu = mean(values);
    if mu == 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / mu
}

fn max_deviation(monthly_totals: &[f64], reference: Option<&BaselineReference>) -> f64 {
    let baseline_mean = reference
        .map(|r| r.mean_monthly_total)
        .filter(|m| *m > 0.0)
        .unwrap_or_else(|| mean(monthly_totals));
    if baseline_mean <= 0.0 {
        return 0.0;
    }
    monthly_totals
        .iter()
        .map(|t| (t - baseline_mean).abs() / baseline_mean)
        .fold(0.0, f64::max)
}

/// Relative month-over-month changes, skipping months that follow a zero month.
fn month_over_month(monthly_totals: &[f64]) -> Vec<f64> {
    monthly_totals
        .windows(2)
        .filter(|pair| pair[0] > 0.0)
        .map(|pair| (pair[1] - pair[0]) / pair[0])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineStore;
    use crate::source::InMemoryTransactionSource;
    use crate::types::{IncomeTier, MonthKey, Sector};
    use chrono::TimeZone;

    fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
    }

    fn window_end() -> DateTime<Utc> {
        at(2024, 7, 1, 0)
    }

    fn profile() -> PersonProfile {
        PersonProfile::new("p1", Sector::Manufacturing, IncomeTier::Medium, true)
    }

    /// Monthly salary on a weekday at 11:00 from January to June 2024
    fn salary(amount: f64) -> Vec<Transaction> {
        // Wednesdays
        let days = [(1, 10), (2, 14), (3, 13), (4, 10), (5, 15), (6, 12)];
        days.iter()
            .map(|(m, d)| Transaction::new(format!("sal-{}", m), "p1", "EMP_1", amount, at(2024, *m, *d, 11)))
            .collect()
    }

    fn extract(txs: &[Transaction]) -> PipelineResult<FeatureVector> {
        FeatureExtractor::default().extract("p1", window_end(), txs, None, Some(&profile()))
    }

    #[test]
    fn test_schema_order_and_count() {
        let extractor = FeatureExtractor::default();
        let names = extractor.feature_names();
        assert_eq!(extractor.feature_count(), 22);
        assert_eq!(names.len(), 22);
        assert_eq!(names[0], "unverified_rate");
        assert_eq!(names[9], "near_50k_pct");
        assert_eq!(names[21], "is_formal");
        assert_eq!(extractor.schema().names().collect::<Vec<_>>(), names);
    }

    #[test]
    fn test_regular_salary_features() {
        let vector = extract(&salary(45_000.0)).unwrap();

        assert_eq!(vector.observation_count, 6);
        assert_eq!(vector.get("unverified_rate"), Some(0.0));
        assert_eq!(vector.get("weekend_pct"), Some(0.0));
        assert_eq!(vector.get("night_hours_pct"), Some(0.0));
        assert_eq!(vector.get("source_concentration"), Some(1.0));
        assert_eq!(vector.get("num_unique_sources"), Some(1.0));
        assert!(vector.value("income_cv").abs() < 1e-9);
        assert!(vector.value("max_deviation_from_mean").abs() < 1e-9);
        assert_eq!(vector.get("amount_range_ratio"), Some(1.0));
        assert_eq!(vector.get("round_amount_pct"), Some(1.0));
        assert_eq!(vector.get("avg_tx_per_month"), Some(1.0));
        assert_eq!(vector.get("burst_ratio"), Some(1.0));
        assert!(vector.value("velocity_change").abs() < 1e-9);
        assert_eq!(vector.get("max_mom_increase"), Some(0.0));
        assert_eq!(vector.get("sector_encoded"), Some(Sector::Manufacturing.code() as f64));
        assert_eq!(vector.get("income_tier_encoded"), Some(2.0));
        assert_eq!(vector.get("is_formal"), Some(1.0));
    }

    #[test]
    fn test_minimum_observation_boundary() {
        let txs = salary(30_000.0);
        assert!(extract(&txs[..5]).is_ok());

        let err = extract(&txs[..4]).unwrap_err();
        assert!(err.is_no_opinion(), "unexpected error {:?}", err);
    }

    #[test]
    fn test_short_span_is_insufficient() {
        let txs: Vec<Transaction> = (1..=6)
            .map(|d| Transaction::new(format!("t{}", d), "p1", "EMP", 1_000.0, at(2024, 6, d, 12)))
            .collect();
        assert!(matches!(extract(&txs), Err(PipelineError::InsufficientData { .. })));
    }

    #[test]
    fn test_structuring_pattern_features() {
        // Saturdays and Sundays at 02:00 from three unverified sources
        let days = [(5, 4), (5, 12), (5, 19), (5, 26), (6, 8)];
        let txs: Vec<Transaction> = days
            .iter()
            .enumerate()
            .map(|(i, (m, d))| {
                Transaction::new(
                    format!("s{}", i),
                    "p1",
                    format!("SRC_{}", i % 3),
                    49_000.0 + 200.0 * i as f64,
                    at(2024, *m, *d, 2),
                )
                .unverified()
            })
            .collect();

        let vector = extract(&txs).unwrap();
        assert_eq!(vector.get("near_50k_pct"), Some(1.0));
        assert_eq!(vector.get("unverified_rate"), Some(1.0));
        assert_eq!(vector.get("weekend_pct"), Some(1.0));
        assert_eq!(vector.get("night_hours_pct"), Some(1.0));
        assert_eq!(vector.get("num_unique_sources"), Some(3.0));
        assert_eq!(vector.get("round_amount_pct"), Some(0.2));
    }

    #[test]
    fn test_deviation_uses_pre_window_baseline() {
        let source = Arc::new(InMemoryTransactionSource::new());
        let store = BaselineStore::new(source, Calendar::utc(), 24);
        let mut history = Vec::new();
        for m in 1..=12 {
            history.push(Transaction::new(format!("h{}", m), "p1", "EMP", 25_000.0, at(2023, m, 10, 11)));
        }
        let mut window: Vec<Transaction> = (1..=5)
            .map(|m| Transaction::new(format!("w{}", m), "p1", "EMP", 25_000.0, at(2024, m, 10, 11)))
            .collect();
        for i in 0..5 {
            window.push(
                Transaction::new(format!("x{}", i), "p1", format!("NEW_{}", i), 150_000.0, at(2024, 6, 3 + i, 11))
                    .unverified(),
            );
        }
        history.extend(window.iter().cloned());
        store.backfill("p1", history).unwrap();
        let baseline = store.snapshot("p1").unwrap();

        let vector = FeatureExtractor::default()
            .extract("p1", window_end(), &window, Some(&baseline), Some(&profile()))
            .unwrap();

        assert!((vector.value("max_deviation_from_mean") - 29.0).abs() < 1e-9);
        assert!((vector.value("max_mom_increase") - 29.0).abs() < 1e-9);
        assert_eq!(vector.get("unverified_rate"), Some(0.5));
        // Per-transaction mean is 25,000: 150,000 deviates by 5x
        assert_eq!(vector.get("pct_high_deviation"), Some(0.5));
    }

    #[test]
    fn test_window_starts_at_local_month_boundary() {
        let ist = Calendar::from_offset_minutes(330);
        let extractor = FeatureExtractor::new(FeatureConfig::default(), ist);
        let end = ist.month_start(MonthKey::new(2024, 7)).unwrap();

        let (start, _) = extractor.window(end).unwrap();
        assert_eq!(start, ist.month_start(MonthKey::new(2024, 1)).unwrap());
        assert_eq!(ist.month_of(start), MonthKey::new(2024, 1));

        // 17:30 local on 31 December: baseline history, not window
        let new_years_eve = at(2023, 12, 31, 12);
        assert!(new_years_eve < start);

        let source = Arc::new(InMemoryTransactionSource::new());
        let store = BaselineStore::new(source, ist, 24);
        let mut history: Vec<Transaction> = (1..=11)
            .map(|m| Transaction::new(format!("h{}", m), "p1", "EMP", 25_000.0, at(2023, m, 10, 6)))
            .collect();
        history.push(Transaction::new("h12", "p1", "EMP", 25_000.0, new_years_eve));
        let window = salary(25_000.0);
        history.extend(window.iter().cloned());
        store.backfill("p1", history).unwrap();
        let baseline = store.snapshot("p1").unwrap();

        let reference = baseline.reference_before(ist.month_of(start));
        assert_eq!(reference.months, 12);
        assert!((reference.mean_monthly_total - 25_000.0).abs() < 1e-9);

        let vector = extractor
            .extract("p1", end, &window, Some(&baseline), Some(&profile()))
            .unwrap();
        assert!(vector.value("max_deviation_from_mean").abs() < 1e-9);
        assert_eq!(vector.observation_count, 6);
    }

    #[test]
    fn test_velocity_and_burst() {
        // One transaction in each of Jan-Mar, then three in each of Apr-Jun
        let mut txs = Vec::new();
        for m in 1..=3 {
            txs.push(Transaction::new(format!("a{}", m), "p1", "EMP", 1_000.0, at(2024, m, 5, 11)));
        }
        for m in 4..=6 {
            for d in [5, 12, 19] {
                txs.push(Transaction::new(format!("b{}-{}", m, d), "p1", "EMP", 1_000.0, at(2024, m, d, 11)));
            }
        }

        let vector = extract(&txs).unwrap();
        assert!((vector.value("velocity_change") - 2.0).abs() < 1e-9);
        assert_eq!(vector.get("avg_tx_per_month"), Some(2.0));
        assert_eq!(vector.get("burst_ratio"), Some(1.5));
        assert!((vector.value("freq_cv") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_month_over_month_skips_zero_months() {
        assert_eq!(month_over_month(&[100.0, 0.0, 50.0, 100.0]), vec![-1.0, 1.0]);
        assert!(month_over_month(&[0.0, 10.0]).is_empty());
    }

    #[test]
    fn test_proportions_bounded_and_extraction_deterministic() {
        let mut txs = salary(12_345.0);
        txs.push(
            Transaction::new("cash", "p1", "SHOP", 0.0, at(2024, 3, 16, 23))
                .unverified()
                .via(Channel::Cash),
        );
        txs.push(Transaction::new("big", "p1", "SHOP", 600_000.0, at(2024, 4, 20, 3)));

        let first = extract(&txs).unwrap();
        let mut reversed = txs.clone();
        reversed.reverse();
        let second = extract(&reversed).unwrap();
        assert_eq!(first, second);

        for ((name, value), field) in first.iter().zip(first.schema().fields()) {
            assert!(value.is_finite(), "{} not finite", name);
            if field.kind == FeatureKind::Proportion {
                assert!((0.0..=1.0).contains(&value), "{} = {}", name, value);
            }
        }
        // Zero amount floors the minimum at one currency unit
        assert_eq!(first.get("amount_range_ratio"), Some(600_000.0));
    }

    #[test]
    fn test_invalid_transactions_rejected() {
        let mut txs = salary(10_000.0);
        txs[2].amount = -1.0;
        assert!(matches!(extract(&txs), Err(PipelineError::InvalidTransaction(_))));

        let mut txs = salary(10_000.0);
        txs.push(Transaction::new("late", "p1", "EMP", 10.0, window_end()));
        assert!(matches!(extract(&txs), Err(PipelineError::InvalidTransaction(_))));
    }

    #[test]
    fn test_profile_validation() {
        let extractor = FeatureExtractor::default();
        let txs = salary(10_000.0);

        let missing = extractor.extract("p1", window_end(), &txs, None, None);
        assert!(matches!(missing, Err(PipelineError::InvalidProfile { .. })));

        let mut out_of_range = profile();
        out_of_range.sector_encoded = Some(Sector::COUNT);
        let err = extractor.extract("p1", window_end(), &txs, None, Some(&out_of_range));
        assert!(matches!(err, Err(PipelineError::InvalidProfile { .. })));

        let mut no_formal = profile();
        no_formal.is_formal = None;
        assert!(extractor.extract("p1", window_end(), &txs, None, Some(&no_formal)).is_err());
    }

    #[test]
    fn test_night_band_wraps_midnight() {
        let config = FeatureConfig {
            night_start_hour: 22,
            night_end_hour: 5,
            ..FeatureConfig::default()
        };
        let extractor = FeatureExtractor::new(config, Calendar::utc());
        assert!(extractor.is_night(23));
        assert!(extractor.is_night(0));
        assert!(extractor.is_night(5));
        assert!(!extractor.is_night(6));
        assert!(!extractor.is_night(21));
    }

    #[test]
    fn test_schema_mismatch_description() {
        let schema = extractor_schema();
        let mut fields = schema.fields().to_vec();
        fields.swap(0, 1);
        let swapped = FeatureSchema::new(fields);
        assert!(schema.mismatch(&swapped).unwrap().contains("weekend_pct"));
        assert!(schema.mismatch(&schema).is_none());

        let truncated = FeatureSchema::new(schema.fields()[..21].to_vec());
        assert!(schema.mismatch(&truncated).is_some());
    }
}
