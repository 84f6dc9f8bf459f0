//! Type definitions for the income anomaly pipeline

pub mod calendar;
pub mod classification;
pub mod transaction;

pub use calendar::{Calendar, MonthKey};
pub use classification::{ClassificationResult, FlagType, Label, OutcomeKind, ReviewOutcome, RiskLevel};
pub use transaction::{Channel, IncomeTier, PersonProfile, Sector, Transaction};
