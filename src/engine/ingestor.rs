use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::engine::error::{EngineError, RejectionReason};
use crate::engine::idempotency::{ClaimOutcome, IdempotencyStore};
use crate::engine::subscription::{SubscriptionStateMachine, SubscriptionTrigger, TransitionOutcome};
use crate::models::billing_event::BillingEventEnvelope;
use crate::services::signature::WebhookVerifier;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Applied { transition: TransitionOutcome },
    /// Seen before; nothing was changed.
    AlreadyProcessed,
    /// Event type the engine does not act on.
    Ignored,
}

/// Entry point for processor webhooks: verify, dedup, dispatch.
#[derive(Clone)]
pub struct BillingEventIngestor {
    verifier: Arc<dyn WebhookVerifier>,
    idempotency: IdempotencyStore,
    subscriptions: SubscriptionStateMachine,
}

impl BillingEventIngestor {
    pub fn new(
        verifier: Arc<dyn WebhookVerifier>,
        idempotency: IdempotencyStore,
        subscriptions: SubscriptionStateMachine,
    ) -> Self {
        Self {
            verifier,
            idempotency,
            subscriptions,
        }
    }

    /// Verifies `signature` against the raw body before anything is parsed.
    pub async fn ingest(
        &self,
        raw_body: &[u8],
        signature: &str,
    ) -> Result<IngestOutcome, EngineError> {
        if !self.verifier.verify(raw_body, signature) {
            warn!("billing event rejected: invalid signature");
            return Err(RejectionReason::InvalidSignature.into());
        }

        let envelope: BillingEventEnvelope = serde_json::from_slice(raw_body).map_err(|err| {
            warn!(?err, "billing event rejected: unparseable envelope");
            RejectionReason::Malformed(err.to_string())
        })?;

        self.ingest_verified(envelope).await
    }

    /// Processes an envelope whose signature was already checked. The
    /// external id is trimmed once here and every ledger call uses that form.
    pub async fn ingest_verified(
        &self,
        mut envelope: BillingEventEnvelope,
    ) -> Result<IngestOutcome, EngineError> {
        envelope.external_id = envelope.external_id.trim().to_string();
        let external_id = envelope.external_id.as_str();
        if external_id.is_empty() {
            return Err(RejectionReason::Malformed("missing external_id".into()).into());
        }

        let kind = envelope.kind();
        let trigger =
            match SubscriptionTrigger::from_event(&kind, &envelope.payload, envelope.observed_at) {
                Ok(Some(trigger)) => trigger,
                Ok(None) => {
                    info!(external_id, event_type = %envelope.event_type, "ignoring unhandled billing event type");
                    return Ok(IngestOutcome::Ignored);
                }
                Err(reason) => {
                    warn!(external_id, event_type = kind.as_str(), %reason, "billing event rejected");
                    return Err(reason.into());
                }
            };

        match self.idempotency.mark_applied(&envelope).await? {
            ClaimOutcome::AlreadyApplied => {
                info!(external_id, "billing event already processed");
                return Ok(IngestOutcome::AlreadyProcessed);
            }
            ClaimOutcome::Claimed => {}
        }

        match self.subscriptions.apply(envelope.account_id, &trigger).await {
            Ok(transition) => {
                if let Err(err) = self.idempotency.confirm_applied(external_id).await {
                    // The claim goes stale and a redelivery replays a no-op.
                    warn!(?err, external_id, "failed to stamp billing event as applied");
                }
                info!(
                    external_id,
                    account_id = %envelope.account_id,
                    event_type = kind.as_str(),
                    "billing event applied"
                );
                Ok(IngestOutcome::Applied { transition })
            }
            Err(err) => {
                if let Err(release_err) = self.idempotency.release(external_id).await {
                    error!(?release_err, external_id, "failed to release billing event claim");
                }
                warn!(?err, external_id, account_id = %envelope.account_id, "billing event dispatch failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::db::account_repository::AccountRepository;
    use crate::db::mock_db::InMemoryDb;
    use crate::engine::cascade::{RecordingScheduler, RemediationQueue};
    use crate::engine::retry::RetryPolicy;
    use crate::models::account::Tier;
    use crate::services::signature::mock::StaticWebhookVerifier;
    use crate::services::signature::HmacWebhookVerifier;
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    struct Harness {
        db: InMemoryDb,
        scheduler: Arc<RecordingScheduler>,
        ingestor: BillingEventIngestor,
    }

    fn harness(verifier: Arc<dyn WebhookVerifier>) -> Harness {
        let db = InMemoryDb::new();
        let scheduler = Arc::new(RecordingScheduler::default());
        let repo = Arc::new(db.clone());
        let ingestor = BillingEventIngestor::new(
            verifier,
            IdempotencyStore::new(repo.clone(), Duration::from_secs(1800)),
            SubscriptionStateMachine::new(
                repo,
                scheduler.clone(),
                RemediationQueue::new(),
                RetryPolicy::immediate(5),
            ),
        );
        Harness {
            db,
            scheduler,
            ingestor,
        }
    }

    fn body(external_id: &str, account_id: Uuid, kind: &str, payload: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "external_id": external_id,
            "account_id": account_id,
            "type": kind,
            "payload": payload,
            "observed_at": "2026-10-19T12:00:00Z",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn same_event_applied_many_times_has_one_effect() {
        let h = harness(Arc::new(StaticWebhookVerifier::accepting()));
        let account = h.db.create_account(Tier::Free).await.unwrap();
        let raw = body("evt_1", account.id, "checkout_completed", json!({ "customer": "cus_1" }));

        let first = h.ingestor.ingest(&raw, "sig").await.unwrap();
        assert!(matches!(first, IngestOutcome::Applied { .. }));
        for _ in 0..4 {
            assert_eq!(
                h.ingestor.ingest(&raw, "sig").await.unwrap(),
                IngestOutcome::AlreadyProcessed
            );
        }

        let stored = h.db.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.tier, Tier::Premium);
        assert_eq!(stored.tier_version, 1);
        assert_eq!(h.scheduler.jobs().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_redeliveries_apply_once() {
        let h = harness(Arc::new(StaticWebhookVerifier::accepting()));
        let account = h.db.create_account(Tier::Premium).await.unwrap();
        let raw = body("evt_del", account.id, "subscription_deleted", json!({}));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ingestor = h.ingestor.clone();
            let raw = raw.clone();
            handles.push(tokio::spawn(async move { ingestor.ingest(&raw, "sig").await }));
        }
        let mut applied = 0;
        for handle in handles {
            if matches!(handle.await.unwrap().unwrap(), IngestOutcome::Applied { .. }) {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(h.scheduler.jobs().len(), 1);
    }

    #[tokio::test]
    async fn bad_signature_changes_nothing() {
        let secret = "whsec_abc";
        let h = harness(Arc::new(HmacWebhookVerifier::new(secret, Duration::from_secs(300))));
        let account = h.db.create_account(Tier::Free).await.unwrap();
        let raw = body("evt_sig", account.id, "checkout_completed", json!({}));

        let err = h.ingestor.ingest(&raw, "t=1,v1=00").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::PermanentRejection(RejectionReason::InvalidSignature)
        ));
        assert_eq!(h.db.billing_event_count(), 0);
        let stored = h.db.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.tier, Tier::Free);

        let signer = HmacWebhookVerifier::new(secret, Duration::from_secs(300));
        let header = signer.sign(&raw, OffsetDateTime::now_utc().unix_timestamp());
        assert!(matches!(
            h.ingestor.ingest(&raw, &header).await.unwrap(),
            IngestOutcome::Applied { .. }
        ));
    }

    #[tokio::test]
    async fn malformed_events_are_permanent_and_unclaimed() {
        let h = harness(Arc::new(StaticWebhookVerifier::accepting()));
        let account = h.db.create_account(Tier::Free).await.unwrap();

        let err = h.ingestor.ingest(b"not json", "sig").await.unwrap_err();
        assert!(err.is_permanent());

        let raw = body("evt_nostatus", account.id, "subscription_updated", json!({}));
        let err = h.ingestor.ingest(&raw, "sig").await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(h.db.billing_event_count(), 0);
    }

    #[tokio::test]
    async fn unknown_event_type_is_ignored() {
        let h = harness(Arc::new(StaticWebhookVerifier::accepting()));
        let raw = body("evt_inv", Uuid::new_v4(), "invoice.paid", json!({}));
        assert_eq!(
            h.ingestor.ingest(&raw, "sig").await.unwrap(),
            IngestOutcome::Ignored
        );
        assert_eq!(h.db.billing_event_count(), 0);
    }

    #[tokio::test]
    async fn dedup_store_outage_is_transient() {
        let h = harness(Arc::new(StaticWebhookVerifier::accepting()));
        let account = h.db.create_account(Tier::Free).await.unwrap();
        h.db.set_billing_store_down(true);

        let raw = body("evt_down", account.id, "checkout_completed", json!({}));
        let err = h.ingestor.ingest(&raw, "sig").await.unwrap_err();
        assert!(err.is_transient());
        let stored = h.db.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.tier, Tier::Free);
    }

    #[tokio::test]
    async fn failed_dispatch_releases_claim_for_redelivery() {
        let h = harness(Arc::new(StaticWebhookVerifier::accepting()));
        let account = h.db.create_account(Tier::Free).await.unwrap();
        let raw = body("evt_retry", account.id, "checkout_completed", json!({}));

        h.db.set_account_store_down(true);
        let err = h.ingestor.ingest(&raw, "sig").await.unwrap_err();
        assert!(err.is_transient());

        h.db.set_account_store_down(false);
        assert!(matches!(
            h.ingestor.ingest(&raw, "sig").await.unwrap(),
            IngestOutcome::Applied { .. }
        ));
        let stored = h.db.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.tier, Tier::Premium);
    }

    #[tokio::test]
    async fn padded_external_id_is_released_and_stamped_in_trimmed_form() {
        let h = harness(Arc::new(StaticWebhookVerifier::accepting()));
        let account = h.db.create_account(Tier::Free).await.unwrap();
        let raw = body(" evt_pad ", account.id, "checkout_completed", json!({}));

        h.db.set_account_store_down(true);
        let err = h.ingestor.ingest(&raw, "sig").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(h.db.billing_event_count(), 0);

        h.db.set_account_store_down(false);
        assert!(matches!(
            h.ingestor.ingest(&raw, "sig").await.unwrap(),
            IngestOutcome::Applied { .. }
        ));
        assert!(h.ingestor.idempotency.has_been_applied("evt_pad").await.unwrap());

        let unpadded = body("evt_pad", account.id, "checkout_completed", json!({}));
        assert_eq!(
            h.ingestor.ingest(&unpadded, "sig").await.unwrap(),
            IngestOutcome::AlreadyProcessed
        );
        let stored = h.db.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.tier, Tier::Premium);
        assert_eq!(stored.tier_version, 1);
    }
}
