//! Read boundary to the transaction ledger and person profile records

use crate::error::{PipelineError, PipelineResult};
use crate::types::transaction::{PersonProfile, Transaction};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Ordered read access to people's transactions and profiles.
///
/// The core never writes through this interface.
pub trait TransactionSource: Send + Sync {
    /// Every person known to the source
    fn person_ids(&self) -> PipelineResult<Vec<String>>;

    /// Transactions with `start <= timestamp < end`, ordered by timestamp
    fn transactions(
        &self,
        person_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PipelineResult<Vec<Transaction>>;

    /// Caller-maintained profile carrying categorical encodings
    fn profile(&self, person_id: &str) -> PipelineResult<Option<PersonProfile>>;
}

#[derive(Debug, Default)]
struct PersonRecord {
    profile: Option<PersonProfile>,
    /// Kept sorted by timestamp
    transactions: Vec<Transaction>,
}

/// In-process ledger fed by the ingest loop
#[derive(Debug, Default)]
pub struct InMemoryTransactionSource {
    people: RwLock<HashMap<String, PersonRecord>>,
}

impl InMemoryTransactionSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transaction. Returns false if the id was already recorded.
    pub fn record(&self, transaction: Transaction) -> bool {
        let mut people = self.people.write().unwrap_or_else(PoisonError::into_inner);
        let record = people.entry(transaction.person_id.clone()).or_default();

        if record.transactions.iter().any(|t| t.id == transaction.id) {
            return false;
        }

        let position = record
            .transactions
            .partition_point(|t| t.timestamp <= transaction.timestamp);
        record.transactions.insert(position, transaction);
        true
    }

    pub fn upsert_profile(&self, profile: PersonProfile) {
        let person_id = profile.person_id.clone();
        let mut people = self.people.write().unwrap_or_else(PoisonError::into_inner);
        people.entry(person_id).or_default().profile = Some(profile);
    }

    pub fn transaction_count(&self, person_id: &str) -> usize {
        let people = self.people.read().unwrap_or_else(PoisonError::into_inner);
        people.get(person_id).map_or(0, |r| r.transactions.len())
    }
}

impl TransactionSource for InMemoryTransactionSource {
    fn person_ids(&self) -> PipelineResult<Vec<String>> {
        let people = self.people.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = people.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn transactions(
        &self,
        person_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PipelineResult<Vec<Transaction>> {
        let people = self.people.read().unwrap_or_else(PoisonError::into_inner);
        let record = people
            .get(person_id)
            .ok_or_else(|| PipelineError::UnknownPerson(person_id.to_string()))?;

        Ok(record
            .transactions
            .iter()
            .filter(|t| t.timestamp >= start && t.timestamp < end)
            .cloned()
            .collect())
    }

    fn profile(&self, person_id: &str) -> PipelineResult<Option<PersonProfile>> {
        let people = self.people.read().unwrap_or_else(PoisonError::into_inner);
        Ok(people.get(person_id).and_then(|r| r.profile.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IncomeTier, Sector};
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_records_are_kept_in_timestamp_order() {
        let source = InMemoryTransactionSource::new();
        source.record(Transaction::new("t2", "p1", "s", 10.0, at(5)));
        source.record(Transaction::new("t1", "p1", "s", 10.0, at(2)));
        source.record(Transaction::new("t3", "p1", "s", 10.0, at(9)));

        let txs = source.transactions("p1", at(1), at(20)).unwrap();
        let ids: Vec<&str> = txs.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn test_range_is_half_open_and_duplicates_ignored() {
        let source = InMemoryTransactionSource::new();
        assert!(source.record(Transaction::new("t1", "p1", "s", 10.0, at(2))));
        assert!(!source.record(Transaction::new("t1", "p1", "s", 10.0, at(2))));
        source.record(Transaction::new("t2", "p1", "s", 10.0, at(5)));

        assert_eq!(source.transactions("p1", at(2), at(5)).unwrap().len(), 1);
        assert_eq!(source.transaction_count("p1"), 2);
    }

    #[test]
    fn test_unknown_person_and_profiles() {
        let source = InMemoryTransactionSource::new();
        assert!(matches!(
            source.transactions("ghost", at(1), at(2)),
            Err(PipelineError::UnknownPerson(_))
        ));

        source.upsert_profile(PersonProfile::new("p7", Sector::Retail, IncomeTier::Low, true));
        assert_eq!(source.person_ids().unwrap(), vec!["p7".to_string()]);
        assert!(source.profile("p7").unwrap().is_some());
        assert!(source.profile("ghost").unwrap().is_none());
    }

    #[test]
    fn test_upsert_profile_replaces_and_keeps_transactions() {
        let source = InMemoryTransactionSource::new();
        source.record(Transaction::new("t1", "p1", "s", 10.0, at(2)));
        source.upsert_profile(PersonProfile::new("p1", Sector::Retail, IncomeTier::Low, false));
        source.upsert_profile(PersonProfile::new("p1", Sector::Transport, IncomeTier::Medium, true));

        let profile = source.profile("p1").unwrap().unwrap();
        assert_eq!(profile.sector_encoded, Some(Sector::Transport.code()));
        assert_eq!(profile.is_formal, Some(true));
        assert_eq!(source.transaction_count("p1"), 1);
    }
}
