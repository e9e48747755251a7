pub mod auditor;
pub mod capacity;
pub mod cascade;
pub mod error;
pub mod idempotency;
pub mod ingestor;
pub mod membership;
pub mod registry;
pub mod retry;
pub mod subscription;
pub mod usage;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::EngineConfig;
use crate::db::account_repository::AccountRepository;
use crate::db::billing_event_repository::BillingEventRepository;
use crate::db::group_repository::GroupRepository;
use crate::db::membership_repository::MembershipRepository;
use crate::db::mock_db::InMemoryDb;
use crate::db::postgres_account_repository::PostgresAccountRepository;
use crate::db::postgres_billing_event_repository::PostgresBillingEventRepository;
use crate::db::postgres_group_repository::PostgresGroupRepository;
use crate::db::postgres_membership_repository::PostgresMembershipRepository;
use crate::db::postgres_usage_counter_repository::PostgresUsageCounterRepository;
use crate::db::usage_counter_repository::UsageCounterRepository;
use crate::services::signature::WebhookVerifier;

use self::auditor::ReconciliationAuditor;
use self::capacity::CapacityGate;
use self::cascade::{CascadeScheduler, RemediationQueue, TierCascadePropagator};
use self::idempotency::IdempotencyStore;
use self::ingestor::BillingEventIngestor;
use self::membership::MembershipService;
use self::registry::GroupRegistry;
use self::subscription::SubscriptionStateMachine;
use self::usage::UsageCounter;

/// Storage handles shared by every engine component.
#[derive(Clone)]
pub struct Repositories {
    pub accounts: Arc<dyn AccountRepository>,
    pub groups: Arc<dyn GroupRepository>,
    pub memberships: Arc<dyn MembershipRepository>,
    pub billing_events: Arc<dyn BillingEventRepository>,
    pub usage: Arc<dyn UsageCounterRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            accounts: Arc::new(PostgresAccountRepository { pool: pool.clone() }),
            groups: Arc::new(PostgresGroupRepository { pool: pool.clone() }),
            memberships: Arc::new(PostgresMembershipRepository { pool: pool.clone() }),
            billing_events: Arc::new(PostgresBillingEventRepository { pool: pool.clone() }),
            usage: Arc::new(PostgresUsageCounterRepository { pool }),
        }
    }

    pub fn in_memory(db: &InMemoryDb) -> Self {
        let db = Arc::new(db.clone());
        Self {
            accounts: db.clone(),
            groups: db.clone(),
            memberships: db.clone(),
            billing_events: db.clone(),
            usage: db,
        }
    }
}

/// Every engine component, wired over one set of repositories.
#[derive(Clone)]
pub struct Engine {
    pub ingestor: BillingEventIngestor,
    pub subscriptions: SubscriptionStateMachine,
    pub cascade: TierCascadePropagator,
    pub capacity: CapacityGate,
    pub memberships: MembershipService,
    pub usage: UsageCounter,
    pub auditor: ReconciliationAuditor,
    pub registry: GroupRegistry,
    pub remediation: RemediationQueue,
}

impl Engine {
    pub fn new(
        repos: Repositories,
        verifier: Arc<dyn WebhookVerifier>,
        scheduler: Arc<dyn CascadeScheduler>,
        config: &EngineConfig,
    ) -> Self {
        let remediation = RemediationQueue::new();
        let cascade = TierCascadePropagator::new(
            repos.groups.clone(),
            config.tier_limits,
            config.cascade_retry.clone(),
            remediation.clone(),
        );
        let subscriptions = SubscriptionStateMachine::new(
            repos.accounts.clone(),
            scheduler,
            remediation.clone(),
            config.tier_cas_retry.clone(),
        );
        let idempotency =
            IdempotencyStore::new(repos.billing_events.clone(), config.event_claim_timeout);
        let ingestor = BillingEventIngestor::new(verifier, idempotency, subscriptions.clone());
        let usage = UsageCounter::new(repos.usage.clone());
        let capacity = CapacityGate::new(
            repos.groups.clone(),
            usage.clone(),
            config.capacity_retry.clone(),
        );
        let memberships = MembershipService::new(
            repos.groups.clone(),
            repos.memberships.clone(),
            capacity.clone(),
        );
        let auditor = ReconciliationAuditor::new(
            repos.accounts.clone(),
            repos.groups.clone(),
            repos.memberships.clone(),
            cascade.clone(),
            remediation.clone(),
        );
        let registry = GroupRegistry::new(repos.accounts.clone(), repos.groups.clone(), cascade.clone());

        Self {
            ingestor,
            subscriptions,
            cascade,
            capacity,
            memberships,
            usage,
            auditor,
            registry,
            remediation,
        }
    }
}

#[cfg(test)]
mod tests {
    //! End-to-end flows across components, driven the way the service runs
    //! them: webhook in, cascade worker out.

    use super::*;
    use crate::db::account_repository::AccountRepository;
    use crate::engine::capacity::{Admission, AdmissionKind, DenialReason};
    use crate::engine::cascade::ChannelCascadeScheduler;
    use crate::engine::ingestor::IngestOutcome;
    use crate::engine::membership::MembershipOutcome;
    use crate::engine::retry::RetryPolicy;
    use crate::models::account::Tier;
    use crate::models::group::Visibility;
    use crate::services::signature::mock::StaticWebhookVerifier;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    fn test_config() -> EngineConfig {
        EngineConfig {
            capacity_retry: RetryPolicy::immediate(16),
            cascade_retry: RetryPolicy::immediate(3),
            tier_cas_retry: RetryPolicy::immediate(16),
            ..EngineConfig::default()
        }
    }

    fn engine(db: &InMemoryDb) -> (Engine, UnboundedReceiver<cascade::CascadeJob>) {
        let (scheduler, jobs) = ChannelCascadeScheduler::channel();
        let engine = Engine::new(
            Repositories::in_memory(db),
            Arc::new(StaticWebhookVerifier::accepting()),
            Arc::new(scheduler),
            &test_config(),
        );
        (engine, jobs)
    }

    fn event(external_id: &str, account_id: Uuid, kind: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "external_id": external_id,
            "account_id": account_id,
            "type": kind,
            "payload": { "status": "active" },
            "observed_at": "2026-10-19T09:30:00Z",
        }))
        .unwrap()
    }

    async fn drain_cascades(engine: &Engine, jobs: &mut UnboundedReceiver<cascade::CascadeJob>) {
        while let Ok(job) = jobs.try_recv() {
            engine.cascade.run(job).await.unwrap();
        }
    }

    #[tokio::test]
    async fn upgrade_then_downgrade_reaches_groups() {
        let db = InMemoryDb::new();
        let (engine, mut jobs) = engine(&db);
        let owner = db.create_account(Tier::Free).await.unwrap();
        let group = engine
            .registry
            .create_group(owner.id, Visibility::Open)
            .await
            .unwrap();
        assert_eq!(group.max_members, Some(10));

        let outcome = engine
            .ingestor
            .ingest(&event("evt_up", owner.id, "checkout_completed"), "sig")
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Applied { .. }));
        drain_cascades(&engine, &mut jobs).await;

        let upgraded = engine.auditor.audit_resource(group.id).await.unwrap();
        assert!(upgraded.is_clean());
        let stored = db.find_account(owner.id).await.unwrap().unwrap();
        assert_eq!(stored.tier, Tier::Premium);

        // Premium lets the group grow past the free limit.
        for _ in 0..12 {
            let joined = engine
                .memberships
                .request_join(group.id, Uuid::new_v4())
                .await
                .unwrap();
            assert!(matches!(joined, MembershipOutcome::Changed { .. }));
        }

        engine
            .ingestor
            .ingest(&event("evt_down", owner.id, "subscription_deleted"), "sig")
            .await
            .unwrap();
        drain_cascades(&engine, &mut jobs).await;

        // Existing members stay; new ones wait for the count to drop.
        assert_eq!(
            engine
                .memberships
                .request_join(group.id, Uuid::new_v4())
                .await
                .unwrap(),
            MembershipOutcome::Denied {
                reason: DenialReason::AtCapacity
            }
        );
        assert_eq!(db.active_member_count(group.id), 12);
    }

    #[tokio::test]
    async fn lost_cascade_is_recovered_by_audit() {
        let db = InMemoryDb::new();
        let (engine, jobs) = engine(&db);
        let owner = db.create_account(Tier::Free).await.unwrap();
        let group = engine
            .registry
            .create_group(owner.id, Visibility::Open)
            .await
            .unwrap();

        // The worker dies before running the job.
        drop(jobs);
        engine
            .ingestor
            .ingest(&event("evt_lost", owner.id, "checkout_completed"), "sig")
            .await
            .unwrap();
        let stale = db.find_group(group.id).await.unwrap().unwrap();
        assert!(!stale.is_premium);

        let report = engine.auditor.audit_account(owner.id).await.unwrap();
        assert_eq!(report.findings.len(), 1);
        let fresh = db.find_group(group.id).await.unwrap().unwrap();
        assert!(fresh.is_premium);
        assert_eq!(fresh.applied_tier_version, 1);
    }

    #[tokio::test]
    async fn creation_quota_follows_tier() {
        let db = InMemoryDb::new();
        let (engine, mut jobs) = engine(&db);
        let owner = db.create_account(Tier::Free).await.unwrap();
        let group = engine
            .registry
            .create_group(owner.id, Visibility::Open)
            .await
            .unwrap();

        for _ in 0..2 {
            assert_eq!(
                engine
                    .capacity
                    .try_admit(group.id, AdmissionKind::MonthlyCreation)
                    .await
                    .unwrap(),
                Admission::Admitted
            );
        }
        assert_eq!(
            engine
                .capacity
                .try_admit(group.id, AdmissionKind::MonthlyCreation)
                .await
                .unwrap(),
            Admission::Denied(DenialReason::AtCapacity)
        );

        engine
            .ingestor
            .ingest(&event("evt_trial", owner.id, "subscription_updated"), "sig")
            .await
            .unwrap();
        drain_cascades(&engine, &mut jobs).await;

        assert!(engine
            .capacity
            .try_admit(group.id, AdmissionKind::MonthlyCreation)
            .await
            .unwrap()
            .is_admitted());
        let used = engine
            .usage
            .current(group.id, time::OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(used, 3);
    }
}
