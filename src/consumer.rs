//! NATS subscriptions for transactions, profiles and classification requests

use crate::config::NatsConfig;
use crate::types::calendar::Calendar;
use anyhow::{Context, Result};
use async_nats::{Client, Subscriber};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Payload of a single classification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifyRequest {
    pub person_id: String,
    /// Exclusive window end; defaults to the start of the current local month
    #[serde(default)]
    pub window_end: Option<DateTime<Utc>>,
}

impl ClassifyRequest {
    pub fn window_end_or_default(&self, calendar: &Calendar, now: DateTime<Utc>) -> DateTime<Utc> {
        self.window_end
            .unwrap_or_else(|| calendar.current_month_start(now))
    }
}

/// Decode a JSON message payload
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).with_context(|| {
        format!(
            "Failed to decode {} from {} byte payload",
            std::any::type_name::<T>(),
            payload.len()
        )
    })
}

/// Subscribes to the pipeline's inbound subjects
pub struct IngestConsumer {
    client: Client,
    transaction_subject: String,
    profile_subject: String,
    request_subject: String,
}

impl IngestConsumer {
    pub fn new(client: Client, nats: &NatsConfig) -> Self {
        Self {
            client,
            transaction_subject: nats.transaction_subject.clone(),
            profile_subject: nats.profile_subject.clone(),
            request_subject: nats.request_subject.clone(),
        }
    }

    async fn subscribe(&self, subject: &str, what: &str) -> Result<Subscriber> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .with_context(|| format!("Failed to subscribe to {}", subject))?;
        info!(subject = %subject, "Subscribed to {} subject", what);
        Ok(subscriber)
    }

    pub async fn subscribe_transactions(&self) -> Result<Subscriber> {
        self.subscribe(&self.transaction_subject, "transaction").await
    }

    pub async fn subscribe_profiles(&self) -> Result<Subscriber> {
        self.subscribe(&self.profile_subject, "profile").await
    }

    pub async fn subscribe_requests(&self) -> Result<Subscriber> {
        self.subscribe(&self.request_subject, "classification request").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::transaction::{Channel, PersonProfile, Transaction};
    use chrono::TimeZone;

    #[test]
    fn test_decode_transaction_defaults_unverified() {
        let payload = br#"{
            "id": "tx-1",
            "person_id": "p1",
            "source_id": "EMP_1",
            "amount": 45000.0,
            "timestamp": "2024-03-13T05:30:00Z",
            "channel": "bank"
        }"#;
        let tx: Transaction = decode(payload).unwrap();
        assert!(!tx.source_verified);
        assert_eq!(tx.channel, Channel::Bank);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode::<PersonProfile>(b"not json").unwrap_err();
        assert!(err.to_string().contains("PersonProfile"));
    }

    #[test]
    fn test_request_window_defaults_to_month_start() {
        let request: ClassifyRequest = decode(br#"{"person_id": "p1"}"#).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 7, 15, 9, 0, 0).unwrap();
        let end = request.window_end_or_default(&Calendar::utc(), now);
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap());

        let explicit = ClassifyRequest {
            person_id: "p1".to_string(),
            window_end: Some(now),
        };
        assert_eq!(explicit.window_end_or_default(&Calendar::utc(), now), now);
    }
}
