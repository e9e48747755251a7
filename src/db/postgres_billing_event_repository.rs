use crate::db::billing_event_repository::BillingEventRepository;
use crate::models::billing_event::{BillingEventRecord, NewBillingEvent};
use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

pub struct PostgresBillingEventRepository {
    pub pool: PgPool,
}

#[async_trait]
impl BillingEventRepository for PostgresBillingEventRepository {
    async fn try_claim_event(
        &self,
        event: &NewBillingEvent,
        stale_before: OffsetDateTime,
    ) -> Result<bool, sqlx::Error> {
        // A conflicting row only yields a RETURNING row when its claim went
        // stale without ever being applied.
        let claimed = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO billing_events (external_id, account_id, event_type, observed_at, claimed_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (external_id) DO UPDATE SET claimed_at = NOW()
            WHERE billing_events.applied_at IS NULL
              AND billing_events.claimed_at < $5
            RETURNING external_id
            "#,
        )
        .bind(&event.external_id)
        .bind(event.account_id)
        .bind(&event.event_type)
        .bind(event.observed_at)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn mark_event_applied(
        &self,
        external_id: &str,
        applied_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE billing_events
            SET applied_at = $2
            WHERE external_id = $1 AND applied_at IS NULL
            "#,
        )
        .bind(external_id)
        .bind(applied_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release_event_claim(&self, external_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM billing_events WHERE external_id = $1 AND applied_at IS NULL")
            .bind(external_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn find_event(
        &self,
        external_id: &str,
    ) -> Result<Option<BillingEventRecord>, sqlx::Error> {
        sqlx::query_as::<_, BillingEventRecord>(
            r#"
            SELECT external_id, account_id, event_type, observed_at, claimed_at, applied_at
            FROM billing_events
            WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
    }
}
