use async_trait::async_trait;
use time::OffsetDateTime;

use crate::models::billing_event::{BillingEventRecord, NewBillingEvent};

#[async_trait]
pub trait BillingEventRepository: Send + Sync {
    /// Unique insert on `external_id`. Returns `true` when this caller now owns
    /// the event. A row that was claimed before `stale_before` and never
    /// applied is taken over as well.
    async fn try_claim_event(
        &self,
        event: &NewBillingEvent,
        stale_before: OffsetDateTime,
    ) -> Result<bool, sqlx::Error>;

    async fn mark_event_applied(
        &self,
        external_id: &str,
        applied_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error>;

    /// Drops an unapplied claim so a redelivery can process the event again.
    async fn release_event_claim(&self, external_id: &str) -> Result<(), sqlx::Error>;

    async fn find_event(&self, external_id: &str)
        -> Result<Option<BillingEventRecord>, sqlx::Error>;
}
