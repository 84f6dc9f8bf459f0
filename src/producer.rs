//! NATS publisher for review-queue outcomes

use crate::types::classification::ReviewOutcome;
use anyhow::Result;
use async_nats::{Client, Subject};
use tracing::debug;

/// JSON wire form of an outcome, tagged by `status`
pub fn encode(outcome: &ReviewOutcome) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(outcome)?)
}

/// Publishes outcomes to the review queue and answers classification requests
#[derive(Clone)]
pub struct ResultProducer {
    client: Client,
    subject: String,
}

impl ResultProducer {
    pub fn new(client: Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
        }
    }

    /// Publish one outcome to the review subject
    pub async fn publish(&self, outcome: &ReviewOutcome) -> Result<()> {
        let payload = encode(outcome)?;
        self.client
            .publish(self.subject.clone(), payload.into())
            .await?;

        debug!(
            person_id = %outcome.person_id(),
            status = outcome.status(),
            "Published review outcome"
        );
        Ok(())
    }

    /// Answer a request/reply classification call
    pub async fn reply(&self, reply_to: Subject, outcome: &ReviewOutcome) -> Result<()> {
        let payload = encode(outcome)?;
        self.client.publish(reply_to, payload.into()).await?;
        Ok(())
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}
