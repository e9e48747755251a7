use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::group_repository::GroupRepository;
use crate::db::membership_repository::SlotWrite;
use crate::engine::error::EngineError;
use crate::engine::retry::RetryPolicy;
use crate::engine::usage::UsageCounter;
use crate::models::group::Group;
use crate::models::usage::PeriodKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdmissionKind {
    /// One more ACTIVE member.
    Member,
    /// One more creation against the group's monthly quota.
    MonthlyCreation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DenialReason {
    AtCapacity,
    Banned,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied(DenialReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Outcome of a member admission that writes its record in the same commit
/// as the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatedWrite<T> {
    Written(T),
    /// The record was not in the state the write expected; no slot was taken.
    Conflict,
    Denied(DenialReason),
}

/// Admission control for bounded counters. Both paths are read-check-CAS
/// loops, so the stored value can never pass its limit even when many
/// callers race for the last slot. Losing every attempt is reported as
/// `AtCapacity`; the caller may try again later.
///
/// A bare `Member` admission holds a slot with no ACTIVE membership behind
/// it, and the next audit hands that slot back. Membership flows use
/// `admit_member_with` so the slot and the row commit together.
#[derive(Clone)]
pub struct CapacityGate {
    groups: Arc<dyn GroupRepository>,
    usage: UsageCounter,
    retry: RetryPolicy,
}

impl CapacityGate {
    pub fn new(groups: Arc<dyn GroupRepository>, usage: UsageCounter, retry: RetryPolicy) -> Self {
        Self {
            groups,
            usage,
            retry,
        }
    }

    pub async fn try_admit(
        &self,
        group_id: Uuid,
        kind: AdmissionKind,
    ) -> Result<Admission, EngineError> {
        self.try_admit_at(group_id, kind, OffsetDateTime::now_utc())
            .await
    }

    /// Same as `try_admit`, with the instant that selects the usage period
    /// supplied by the caller.
    pub async fn try_admit_at(
        &self,
        group_id: Uuid,
        kind: AdmissionKind,
        now: OffsetDateTime,
    ) -> Result<Admission, EngineError> {
        match kind {
            AdmissionKind::Member => self.admit_member(group_id).await,
            AdmissionKind::MonthlyCreation => {
                self.admit_creation(group_id, PeriodKey::for_instant(now))
                    .await
            }
        }
    }

    async fn load_group(&self, group_id: Uuid) -> Result<Group, EngineError> {
        self.groups
            .find_group(group_id)
            .await?
            .ok_or_else(|| EngineError::not_found("group", group_id))
    }

    /// Member admission whose slot is taken by `write` together with the
    /// record that needs it. `write` receives the `member_count` it must find
    /// and is called again whenever the count moved underneath it.
    pub async fn admit_member_with<T, F, Fut>(
        &self,
        group_id: Uuid,
        mut write: F,
    ) -> Result<GatedWrite<T>, EngineError>
    where
        F: FnMut(i64) -> Fut,
        Fut: Future<Output = Result<SlotWrite<T>, sqlx::Error>>,
    {
        let attempts = self.retry.attempts();
        for attempt in 0..attempts {
            let group = self.load_group(group_id).await?;
            if !group.has_member_slot() {
                info!(
                    %group_id,
                    member_count = group.member_count,
                    max_members = ?group.max_members,
                    "member admission denied: group is full"
                );
                return Ok(GatedWrite::Denied(DenialReason::AtCapacity));
            }

            match write(group.member_count).await? {
                SlotWrite::Written(record) => {
                    debug!(%group_id, member_count = group.member_count + 1, "member admitted");
                    return Ok(GatedWrite::Written(record));
                }
                SlotWrite::Conflict => return Ok(GatedWrite::Conflict),
                SlotWrite::CountMoved => {
                    debug!(%group_id, attempt = attempt + 1, "member count moved, retrying");
                    self.retry.pause(attempt).await;
                }
            }
        }

        warn!(%group_id, attempts, "member admission gave up after repeated conflicts");
        Ok(GatedWrite::Denied(DenialReason::AtCapacity))
    }

    async fn admit_member(&self, group_id: Uuid) -> Result<Admission, EngineError> {
        let groups = self.groups.clone();
        let gated = self
            .admit_member_with(group_id, |expected| {
                let groups = groups.clone();
                async move {
                    let taken = groups
                        .compare_and_increment_member_count(group_id, expected)
                        .await?;
                    Ok(if taken {
                        SlotWrite::Written(())
                    } else {
                        SlotWrite::CountMoved
                    })
                }
            })
            .await?;

        Ok(match gated {
            GatedWrite::Written(()) => Admission::Admitted,
            GatedWrite::Denied(reason) => Admission::Denied(reason),
            // A bare counter write never reports a conflict.
            GatedWrite::Conflict => Admission::Denied(DenialReason::AtCapacity),
        })
    }

    async fn admit_creation(
        &self,
        group_id: Uuid,
        period: PeriodKey,
    ) -> Result<Admission, EngineError> {
        let attempts = self.retry.attempts();
        for attempt in 0..attempts {
            let group = self.load_group(group_id).await?;
            let count = self.usage.ensure(group_id, period).await?;
            if let Some(quota) = group.monthly_event_quota {
                if count >= quota {
                    info!(%group_id, %period, count, quota, "creation denied: monthly quota reached");
                    return Ok(Admission::Denied(DenialReason::AtCapacity));
                }
            }

            if self
                .usage
                .compare_and_increment(group_id, period, count)
                .await?
            {
                debug!(%group_id, %period, count = count + 1, "creation admitted");
                return Ok(Admission::Admitted);
            }

            debug!(%group_id, %period, attempt = attempt + 1, "usage counter moved, retrying");
            self.retry.pause(attempt).await;
        }

        warn!(%group_id, %period, attempts, "creation admission gave up after repeated conflicts");
        Ok(Admission::Denied(DenialReason::AtCapacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::group_repository::NewGroup;
    use crate::db::mock_db::InMemoryDb;
    use crate::models::group::{TierProjection, Visibility};
    use time::macros::datetime;

    async fn group_with(db: &InMemoryDb, max_members: Option<i64>, quota: Option<i64>) -> Group {
        db.create_group(NewGroup {
            owner_account_id: Uuid::new_v4(),
            visibility: Visibility::Open,
            projection: TierProjection {
                is_premium: max_members.is_none(),
                max_members,
                monthly_event_quota: quota,
            },
            applied_tier_version: 0,
        })
        .await
        .unwrap()
    }

    fn gate(db: &InMemoryDb, retry: RetryPolicy) -> CapacityGate {
        let db = Arc::new(db.clone());
        CapacityGate::new(db.clone(), UsageCounter::new(db), retry)
    }

    #[tokio::test]
    async fn admits_until_full() {
        let db = InMemoryDb::new();
        let group = group_with(&db, Some(2), None).await;
        let gate = gate(&db, RetryPolicy::immediate(3));

        for _ in 0..2 {
            assert_eq!(
                gate.try_admit(group.id, AdmissionKind::Member).await.unwrap(),
                Admission::Admitted
            );
        }
        assert_eq!(
            gate.try_admit(group.id, AdmissionKind::Member).await.unwrap(),
            Admission::Denied(DenialReason::AtCapacity)
        );

        // Bare admissions have no ACTIVE rows behind them.
        db.set_member_count(group.id, 1);
        assert!(gate
            .try_admit(group.id, AdmissionKind::Member)
            .await
            .unwrap()
            .is_admitted());
    }

    #[tokio::test]
    async fn unbounded_group_always_admits() {
        let db = InMemoryDb::new();
        let group = group_with(&db, None, None).await;
        let gate = gate(&db, RetryPolicy::immediate(3));

        for _ in 0..25 {
            assert!(gate
                .try_admit(group.id, AdmissionKind::Member)
                .await
                .unwrap()
                .is_admitted());
        }
        assert_eq!(db.member_count_high_water(group.id), 25);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_never_exceed_limit() {
        let db = InMemoryDb::new();
        let group = group_with(&db, Some(5), None).await;
        let gate = gate(&db, RetryPolicy::immediate(64));

        let mut handles = Vec::new();
        for _ in 0..40 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.try_admit(group.id, AdmissionKind::Member).await
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_admitted() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 5);
        assert_eq!(db.member_count_high_water(group.id), 5);
    }

    #[tokio::test]
    async fn monthly_quota_rolls_over_at_month_boundary() {
        let db = InMemoryDb::new();
        let group = group_with(&db, Some(10), Some(2)).await;
        let gate = gate(&db, RetryPolicy::immediate(3));
        let march = datetime!(2026-03-31 23:59:59 UTC);
        let april = datetime!(2026-04-01 00:00:00 UTC);

        for _ in 0..2 {
            assert!(gate
                .try_admit_at(group.id, AdmissionKind::MonthlyCreation, march)
                .await
                .unwrap()
                .is_admitted());
        }
        assert_eq!(
            gate.try_admit_at(group.id, AdmissionKind::MonthlyCreation, march)
                .await
                .unwrap(),
            Admission::Denied(DenialReason::AtCapacity)
        );
        assert!(gate
            .try_admit_at(group.id, AdmissionKind::MonthlyCreation, april)
            .await
            .unwrap()
            .is_admitted());
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let db = InMemoryDb::new();
        let gate = gate(&db, RetryPolicy::immediate(1));
        let err = gate
            .try_admit(Uuid::new_v4(), AdmissionKind::Member)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "group", .. }));
    }
}
