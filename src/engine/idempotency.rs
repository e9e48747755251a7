use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::debug;

use crate::db::billing_event_repository::BillingEventRepository;
use crate::engine::error::EngineError;
use crate::models::billing_event::{BillingEventEnvelope, NewBillingEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller is the only processor of the event.
    Claimed,
    /// Another delivery already handled (or is handling) the event.
    AlreadyApplied,
}

/// Ledger of external billing event ids. The unique insert performed by
/// `mark_applied` is the whole dedup gate; no other locking is involved.
#[derive(Clone)]
pub struct IdempotencyStore {
    events: Arc<dyn BillingEventRepository>,
    claim_timeout: Duration,
}

impl IdempotencyStore {
    pub fn new(events: Arc<dyn BillingEventRepository>, claim_timeout: Duration) -> Self {
        Self {
            events,
            claim_timeout,
        }
    }

    pub async fn has_been_applied(&self, external_id: &str) -> Result<bool, EngineError> {
        let record = self.events.find_event(external_id).await?;
        Ok(record.is_some_and(|r| r.applied_at.is_some()))
    }

    pub async fn mark_applied(
        &self,
        envelope: &BillingEventEnvelope,
    ) -> Result<ClaimOutcome, EngineError> {
        let stale_before = OffsetDateTime::now_utc() - self.claim_timeout;
        let event = NewBillingEvent {
            external_id: envelope.external_id.clone(),
            account_id: envelope.account_id,
            event_type: envelope.event_type.clone(),
            observed_at: envelope.observed_at,
        };

        if self.events.try_claim_event(&event, stale_before).await? {
            debug!(external_id = %event.external_id, "claimed billing event");
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::AlreadyApplied)
        }
    }

    /// Stamps `applied_at` once the event's effects are committed.
    pub async fn confirm_applied(&self, external_id: &str) -> Result<(), EngineError> {
        self.events
            .mark_event_applied(external_id, OffsetDateTime::now_utc())
            .await?;
        Ok(())
    }

    /// Gives an unapplied claim back so the next delivery can process it.
    pub async fn release(&self, external_id: &str) -> Result<(), EngineError> {
        self.events.release_event_claim(external_id).await?;
        Ok(())
    }
}
