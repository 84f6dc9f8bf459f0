//! Income transaction and person profile records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payment channel an income transaction arrived through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Cash,
    Bank,
    Digital,
}

/// An income transaction credited to a person. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction identifier
    pub id: String,

    /// Person the income belongs to
    pub person_id: String,

    /// Paying source (employer, platform, individual)
    pub source_id: String,

    /// Whether the paying source has been verified
    #[serde(default)]
    pub source_verified: bool,

    /// Credited amount in currency units (non-negative)
    pub amount: f64,

    /// Credit time in UTC
    pub timestamp: DateTime<Utc>,

    /// Payment channel
    pub channel: Channel,
}

impl Transaction {
    /// Create a verified bank transaction
    pub fn new(
        id: impl Into<String>,
        person_id: impl Into<String>,
        source_id: impl Into<String>,
        amount: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            person_id: person_id.into(),
            source_id: source_id.into(),
            source_verified: true,
            amount,
            timestamp,
            channel: Channel::Bank,
        }
    }

    pub fn unverified(mut self) -> Self {
        self.source_verified = false;
        self
    }

    pub fn via(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Amount is finite and non-negative.
    pub fn has_valid_amount(&self) -> bool {
        self.amount.is_finite() && self.amount >= 0.0
    }
}

/// Job sector, in the alphabetical order of the training vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sector {
    Agriculture,
    Construction,
    DomesticWork,
    Education,
    GigEconomy,
    Healthcare,
    Manufacturing,
    OfficeWork,
    Retail,
    SelfEmployed,
    SkilledTrade,
    StreetVendor,
    Transport,
}

impl Sector {
    pub const COUNT: u32 = 13;

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Income tier, in the alphabetical order of the training vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncomeTier {
    High,
    Low,
    Medium,
}

impl IncomeTier {
    pub const COUNT: u32 = 3;

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Caller-supplied person profile carrying the categorical encodings.
///
/// Encodings are optional on the wire so that incomplete records can be
/// rejected by the extractor instead of silently defaulting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonProfile {
    pub person_id: String,
    #[serde(default)]
    pub sector_encoded: Option<u32>,
    #[serde(default)]
    pub income_tier_encoded: Option<u32>,
    #[serde(default)]
    pub is_formal: Option<bool>,
}

impl PersonProfile {
    pub fn new(
        person_id: impl Into<String>,
        sector: Sector,
        income_tier: IncomeTier,
        is_formal: bool,
    ) -> Self {
        Self {
            person_id: person_id.into(),
            sector_encoded: Some(sector.code()),
            income_tier_encoded: Some(income_tier.code()),
            is_formal: Some(is_formal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_transaction_serialization() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap();
        let tx = Transaction::new("tx_1", "p1", "EMP_1", 45000.0, ts).via(Channel::Cash);

        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.contains("\"channel\":\"cash\""));

        let deserialized: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx, deserialized);
    }

    #[test]
    fn test_amount_validation() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap();
        assert!(Transaction::new("a", "p", "s", 0.0, ts).has_valid_amount());
        assert!(!Transaction::new("b", "p", "s", -1.0, ts).has_valid_amount());
        assert!(!Transaction::new("c", "p", "s", f64::NAN, ts).has_valid_amount());
    }

    #[test]
    fn test_label_encoding_order() {
        assert_eq!(Sector::Agriculture.code(), 0);
        assert_eq!(Sector::Transport.code(), Sector::COUNT - 1);
        assert_eq!(IncomeTier::High.code(), 0);
        assert_eq!(IncomeTier::Medium.code(), 2);
    }

    #[test]
    fn test_profile_missing_fields_deserialize_as_none() {
        let profile: PersonProfile = serde_json::from_str(r#"{"person_id":"p9"}"#).unwrap();
        assert_eq!(profile.sector_encoded, None);
        assert_eq!(profile.is_formal, None);
    }
}
