//! Classification output records handed to the review queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Model-driven label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Normal,
    Anomaly,
}

/// Audit-facing reason attached to a classification.
///
/// Declaration order is the display priority: when more flags fire than
/// can be shown, earlier variants win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    Structuring,
    SuddenSpike,
    UnverifiedIncome,
    DormantBurst,
    VelocityChange,
    HighVolatility,
    PatternBreak,
    SuspiciousTiming,
    WeekendHeavy,
    RoundAmounts,
    ManySources,
    CashHeavy,
    /// The model labelled an anomaly but no rule matched
    ScoreOnly,
}

impl FlagType {
    pub fn description(&self) -> &'static str {
        match self {
            FlagType::Structuring => "structuring detected: amounts cluster just below a reporting threshold",
            FlagType::SuddenSpike => "sudden spike: income jumped 3x+ above the personal average",
            FlagType::UnverifiedIncome => "most income comes from unverified sources",
            FlagType::DormantBurst => "burst of activity far above the usual monthly rate",
            FlagType::VelocityChange => "transaction frequency changed dramatically",
            FlagType::HighVolatility => "monthly income varies wildly",
            FlagType::PatternBreak => "regular income pattern broke away from the personal baseline",
            FlagType::SuspiciousTiming => "suspicious timing pattern: night or weekend credits",
            FlagType::WeekendHeavy => "unusual concentration of weekend credits",
            FlagType::RoundAmounts => "suspiciously round amounts",
            FlagType::ManySources => "income split across many sources",
            FlagType::CashHeavy => "income mostly arrives as cash deposits",
            FlagType::ScoreOnly => "score-only, no rule matched",
        }
    }
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Coarse risk level derived from probability and matched rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Determine risk level from a 0-100 risk score and thresholds
    pub fn from_score(score: f64, thresholds: &RiskLevelThresholds) -> Self {
        if score >= thresholds.high {
            RiskLevel::High
        } else if score >= thresholds.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Configurable risk level cut points on the 0-100 risk score
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLevelThresholds {
    pub medium: f64,
    pub high: f64,
}

impl Default for RiskLevelThresholds {
    fn default() -> Self {
        Self {
            medium: 40.0,
            high: 70.0,
        }
    }
}

/// Risk score: probability on a 0-100 scale plus 10 points per matched rule, capped at 100.
pub fn risk_score(probability: f64, matched_rules: usize) -> f64 {
    (probability * 100.0 + matched_rules as f64 * 10.0).min(100.0)
}

/// Result of classifying one person over one evaluation window.
///
/// Contains no wall-clock or random fields, so classifying an unchanged
/// history under an unchanged model yields an identical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Deterministic identifier derived from person, window and model version
    pub result_id: Uuid,

    pub person_id: String,

    /// Exclusive end of the evaluation window
    pub window_end: DateTime<Utc>,

    /// Anomaly probability in [0, 1]
    pub probability: f64,

    pub label: Label,

    /// `probability` for anomalies, `1 - probability` otherwise
    pub confidence: f64,

    /// Operating threshold the label was decided against
    pub threshold: f64,

    /// Ranked, capped audit flags
    pub flags: Vec<FlagType>,

    /// 0-100 risk score
    pub risk_score: f64,

    pub risk_level: RiskLevel,

    pub model_version: String,

    /// Transactions the features were computed from
    pub observation_count: usize,
}

impl ClassificationResult {
    pub fn result_id_for(person_id: &str, window_end: DateTime<Utc>, model_version: &str) -> Uuid {
        let key = format!("{}|{}|{}", person_id, window_end.to_rfc3339(), model_version);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
    }

    pub fn is_anomaly(&self) -> bool {
        self.label == Label::Anomaly
    }
}

/// What the review queue receives for one person.
///
/// "Insufficient data" is never collapsed into "normal"; any scoring or
/// data failure is routed to manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReviewOutcome {
    Classified(ClassificationResult),
    InsufficientData {
        person_id: String,
        window_end: DateTime<Utc>,
        reason: String,
    },
    ManualReview {
        person_id: String,
        window_end: DateTime<Utc>,
        reason: String,
    },
}

impl ReviewOutcome {
    pub fn person_id(&self) -> &str {
        match self {
            ReviewOutcome::Classified(result) => &result.person_id,
            ReviewOutcome::InsufficientData { person_id, .. }
            | ReviewOutcome::ManualReview { person_id, .. } => person_id,
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            ReviewOutcome::Classified(result) if result.is_anomaly() => OutcomeKind::Anomaly,
            ReviewOutcome::Classified(_) => OutcomeKind::Normal,
            ReviewOutcome::InsufficientData { .. } => OutcomeKind::InsufficientData,
            ReviewOutcome::ManualReview { .. } => OutcomeKind::ManualReview,
        }
    }

    /// Short status name for logs and metrics
    pub fn status(&self) -> &'static str {
        self.kind().as_str()
    }
}

/// Review-queue state of an outcome, with classified results split by label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    Anomaly,
    Normal,
    InsufficientData,
    ManualReview,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Anomaly => "anomaly",
            OutcomeKind::Normal => "normal",
            OutcomeKind::InsufficientData => "insufficient_data",
            OutcomeKind::ManualReview => "manual_review",
        }
    }
}
