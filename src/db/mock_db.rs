//! In-memory implementation of every repository trait. Each conditional write
//! happens under the shard lock of the row it touches, which gives the same
//! compare-and-swap behaviour as the conditional `UPDATE`s in the Postgres
//! repositories.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::account_repository::AccountRepository;
use crate::db::billing_event_repository::BillingEventRepository;
use crate::db::group_repository::{GroupRepository, NewGroup};
use crate::db::membership_repository::{MemberRecount, MembershipRepository, SlotWrite};
use crate::db::usage_counter_repository::UsageCounterRepository;
use crate::models::account::{Account, BillingRefs, Tier};
use crate::models::billing_event::{BillingEventRecord, NewBillingEvent};
use crate::models::group::{Group, TierProjection};
use crate::models::membership::{Membership, MembershipStatus};
use crate::models::usage::PeriodKey;

fn unavailable() -> sqlx::Error {
    sqlx::Error::PoolTimedOut
}

#[derive(Clone, Default)]
pub struct InMemoryDb {
    accounts: Arc<DashMap<Uuid, Account>>,
    groups: Arc<DashMap<Uuid, Group>>,
    memberships: Arc<DashMap<Uuid, Membership>>,
    membership_pairs: Arc<DashMap<(Uuid, Uuid), Uuid>>,
    billing_events: Arc<DashMap<String, BillingEventRecord>>,
    usage: Arc<DashMap<(Uuid, PeriodKey), i64>>,
    member_count_high_water: Arc<DashMap<Uuid, i64>>,
    failing_group_writes: Arc<DashMap<Uuid, u32>>,
    billing_store_down: Arc<AtomicBool>,
    account_store_down: Arc<AtomicBool>,
    group_listing_down: Arc<AtomicBool>,
}

impl InMemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest `member_count` any committed write ever produced for the group.
    pub fn member_count_high_water(&self, group_id: Uuid) -> i64 {
        self.member_count_high_water
            .get(&group_id)
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Corrupts the cached member count without touching memberships.
    pub fn set_member_count(&self, group_id: Uuid, count: i64) {
        if let Some(mut group) = self.groups.get_mut(&group_id) {
            group.member_count = count;
        }
    }

    /// Makes the next `times` tier projections written to the group fail.
    pub fn fail_group_writes(&self, group_id: Uuid, times: u32) {
        self.failing_group_writes.insert(group_id, times);
    }

    pub fn set_billing_store_down(&self, down: bool) {
        self.billing_store_down.store(down, Ordering::SeqCst);
    }

    pub fn set_account_store_down(&self, down: bool) {
        self.account_store_down.store(down, Ordering::SeqCst);
    }

    /// Makes `list_groups_for_owner` fail while set.
    pub fn set_group_listing_down(&self, down: bool) {
        self.group_listing_down.store(down, Ordering::SeqCst);
    }

    pub fn billing_event_count(&self) -> usize {
        self.billing_events.len()
    }

    fn record_high_water(&self, group_id: Uuid, count: i64) {
        self.member_count_high_water
            .entry(group_id)
            .and_modify(|v| *v = (*v).max(count))
            .or_insert(count);
    }

    fn take_injected_failure(&self, group_id: Uuid) -> bool {
        match self.failing_group_writes.get_mut(&group_id) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn check_accounts(&self) -> Result<(), sqlx::Error> {
        if self.account_store_down.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(())
    }

    fn check_billing(&self) -> Result<(), sqlx::Error> {
        if self.billing_store_down.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(())
    }
}

#[async_trait]
impl BillingEventRepository for InMemoryDb {
    async fn try_claim_event(
        &self,
        event: &NewBillingEvent,
        stale_before: OffsetDateTime,
    ) -> Result<bool, sqlx::Error> {
        self.check_billing()?;
        let now = OffsetDateTime::now_utc();
        match self.billing_events.entry(event.external_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(BillingEventRecord {
                    external_id: event.external_id.clone(),
                    account_id: event.account_id,
                    event_type: event.event_type.clone(),
                    observed_at: event.observed_at,
                    claimed_at: now,
                    applied_at: None,
                });
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.applied_at.is_none() && record.claimed_at < stale_before {
                    record.claimed_at = now;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn mark_event_applied(
        &self,
        external_id: &str,
        applied_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        self.check_billing()?;
        if let Some(mut record) = self.billing_events.get_mut(external_id) {
            if record.applied_at.is_none() {
                record.applied_at = Some(applied_at);
            }
        }
        Ok(())
    }

    async fn release_event_claim(&self, external_id: &str) -> Result<(), sqlx::Error> {
        self.check_billing()?;
        self.billing_events
            .remove_if(external_id, |_, record| record.applied_at.is_none());
        Ok(())
    }

    async fn find_event(
        &self,
        external_id: &str,
    ) -> Result<Option<BillingEventRecord>, sqlx::Error> {
        self.check_billing()?;
        Ok(self.billing_events.get(external_id).map(|r| r.clone()))
    }
}

#[async_trait]
impl AccountRepository for InMemoryDb {
    async fn create_account(&self, tier: Tier) -> Result<Account, sqlx::Error> {
        self.check_accounts()?;
        let now = OffsetDateTime::now_utc();
        let account = Account {
            id: Uuid::new_v4(),
            tier,
            tier_version: 0,
            billing_customer_ref: None,
            billing_subscription_ref: None,
            created_at: now,
            updated_at: now,
        };
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>, sqlx::Error> {
        self.check_accounts()?;
        Ok(self.accounts.get(&account_id).map(|a| a.clone()))
    }

    async fn compare_and_swap_tier(
        &self,
        account_id: Uuid,
        expected_version: i64,
        tier: Tier,
        refs: BillingRefs<'_>,
    ) -> Result<Option<Account>, sqlx::Error> {
        self.check_accounts()?;
        let Some(mut account) = self.accounts.get_mut(&account_id) else {
            return Ok(None);
        };
        if account.tier_version != expected_version {
            return Ok(None);
        }
        account.tier = tier;
        account.tier_version += 1;
        if let Some(customer) = refs.customer {
            account.billing_customer_ref = Some(customer.to_string());
        }
        if let Some(subscription) = refs.subscription {
            account.billing_subscription_ref = Some(subscription.to_string());
        }
        account.updated_at = OffsetDateTime::now_utc();
        Ok(Some(account.clone()))
    }
}

#[async_trait]
impl GroupRepository for InMemoryDb {
    async fn create_group(&self, group: NewGroup) -> Result<Group, sqlx::Error> {
        let now = OffsetDateTime::now_utc();
        let group = Group {
            id: Uuid::new_v4(),
            owner_account_id: group.owner_account_id,
            visibility: group.visibility,
            is_premium: group.projection.is_premium,
            max_members: group.projection.max_members,
            monthly_event_quota: group.projection.monthly_event_quota,
            member_count: 0,
            applied_tier_version: group.applied_tier_version,
            created_at: now,
            updated_at: now,
        };
        self.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn find_group(&self, group_id: Uuid) -> Result<Option<Group>, sqlx::Error> {
        Ok(self.groups.get(&group_id).map(|g| g.clone()))
    }

    async fn list_groups_for_owner(
        &self,
        owner_account_id: Uuid,
    ) -> Result<Vec<Group>, sqlx::Error> {
        if self.group_listing_down.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let mut groups: Vec<Group> = self
            .groups
            .iter()
            .filter(|g| g.owner_account_id == owner_account_id)
            .map(|g| g.clone())
            .collect();
        groups.sort_by_key(|g| g.created_at);
        Ok(groups)
    }

    async fn apply_tier_projection(
        &self,
        group_id: Uuid,
        projection: TierProjection,
        version: i64,
    ) -> Result<bool, sqlx::Error> {
        if self.take_injected_failure(group_id) {
            return Err(unavailable());
        }
        let Some(mut group) = self.groups.get_mut(&group_id) else {
            return Ok(false);
        };
        if group.applied_tier_version >= version {
            return Ok(false);
        }
        group.is_premium = projection.is_premium;
        group.max_members = projection.max_members;
        group.monthly_event_quota = projection.monthly_event_quota;
        group.applied_tier_version = version;
        group.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn compare_and_increment_member_count(
        &self,
        group_id: Uuid,
        expected: i64,
    ) -> Result<bool, sqlx::Error> {
        let committed = {
            let Some(mut group) = self.groups.get_mut(&group_id) else {
                return Ok(false);
            };
            if group.member_count != expected || !group.has_member_slot() {
                return Ok(false);
            }
            group.member_count += 1;
            group.updated_at = OffsetDateTime::now_utc();
            group.member_count
        };
        self.record_high_water(group_id, committed);
        Ok(true)
    }
}

impl InMemoryDb {
    fn new_membership(group_id: Uuid, account_id: Uuid, status: MembershipStatus) -> Membership {
        let now = OffsetDateTime::now_utc();
        Membership {
            id: Uuid::new_v4(),
            group_id,
            account_id,
            status,
            joined_at: (status == MembershipStatus::Active).then_some(now),
            created_at: now,
            updated_at: now,
        }
    }

    fn count_active(&self, group_id: Uuid) -> i64 {
        self.memberships
            .iter()
            .filter(|m| m.group_id == group_id && m.status == MembershipStatus::Active)
            .count() as i64
    }

    /// Number of ACTIVE rows for the group, read without locking the group.
    pub fn active_member_count(&self, group_id: Uuid) -> i64 {
        self.count_active(group_id)
    }

    // Runs `write` under the group's shard lock once `member_count` is
    // `expected` with a slot free, and bumps the count only if `write`
    // produced a row. Lock order is always group, then membership maps.
    fn with_member_slot(
        &self,
        group_id: Uuid,
        expected: i64,
        write: impl FnOnce() -> Option<Membership>,
    ) -> SlotWrite<Membership> {
        let committed = {
            let Some(mut group) = self.groups.get_mut(&group_id) else {
                return SlotWrite::CountMoved;
            };
            if group.member_count != expected || !group.has_member_slot() {
                return SlotWrite::CountMoved;
            }
            let Some(membership) = write() else {
                return SlotWrite::Conflict;
            };
            group.member_count += 1;
            group.updated_at = OffsetDateTime::now_utc();
            (group.member_count, membership)
        };
        self.record_high_water(group_id, committed.0);
        SlotWrite::Written(committed.1)
    }
}

#[async_trait]
impl MembershipRepository for InMemoryDb {
    async fn insert_membership(
        &self,
        group_id: Uuid,
        account_id: Uuid,
        status: MembershipStatus,
    ) -> Result<Option<Membership>, sqlx::Error> {
        match self.membership_pairs.entry((group_id, account_id)) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                let membership = Self::new_membership(group_id, account_id, status);
                self.memberships.insert(membership.id, membership.clone());
                slot.insert(membership.id);
                Ok(Some(membership))
            }
        }
    }

    async fn insert_active_membership(
        &self,
        group_id: Uuid,
        account_id: Uuid,
        expected_count: i64,
    ) -> Result<SlotWrite<Membership>, sqlx::Error> {
        Ok(self.with_member_slot(group_id, expected_count, || {
            match self.membership_pairs.entry((group_id, account_id)) {
                Entry::Occupied(_) => None,
                Entry::Vacant(slot) => {
                    let membership =
                        Self::new_membership(group_id, account_id, MembershipStatus::Active);
                    self.memberships.insert(membership.id, membership.clone());
                    slot.insert(membership.id);
                    Some(membership)
                }
            }
        }))
    }

    async fn activate_membership(
        &self,
        membership_id: Uuid,
        group_id: Uuid,
        expected_count: i64,
    ) -> Result<SlotWrite<Membership>, sqlx::Error> {
        Ok(self.with_member_slot(group_id, expected_count, || {
            let mut membership = self.memberships.get_mut(&membership_id)?;
            if membership.group_id != group_id || membership.status != MembershipStatus::Pending {
                return None;
            }
            let now = OffsetDateTime::now_utc();
            membership.status = MembershipStatus::Active;
            membership.joined_at = Some(now);
            membership.updated_at = now;
            Some(membership.clone())
        }))
    }

    async fn deactivate_membership(
        &self,
        membership_id: Uuid,
        to: MembershipStatus,
    ) -> Result<Option<Membership>, sqlx::Error> {
        let Some(group_id) = self.memberships.get(&membership_id).map(|m| m.group_id) else {
            return Ok(None);
        };
        let Some(mut group) = self.groups.get_mut(&group_id) else {
            return Ok(None);
        };
        let updated = {
            let Some(mut membership) = self.memberships.get_mut(&membership_id) else {
                return Ok(None);
            };
            if membership.status != MembershipStatus::Active {
                return Ok(None);
            }
            membership.status = to;
            membership.updated_at = OffsetDateTime::now_utc();
            membership.clone()
        };
        group.member_count = (group.member_count - 1).max(0);
        group.updated_at = OffsetDateTime::now_utc();
        Ok(Some(updated))
    }

    async fn find_membership(
        &self,
        membership_id: Uuid,
    ) -> Result<Option<Membership>, sqlx::Error> {
        Ok(self.memberships.get(&membership_id).map(|m| m.clone()))
    }

    async fn find_membership_for_pair(
        &self,
        group_id: Uuid,
        account_id: Uuid,
    ) -> Result<Option<Membership>, sqlx::Error> {
        let id = match self.membership_pairs.get(&(group_id, account_id)) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.memberships.get(&id).map(|m| m.clone()))
    }

    async fn compare_and_set_status(
        &self,
        membership_id: Uuid,
        from: MembershipStatus,
        to: MembershipStatus,
    ) -> Result<Option<Membership>, sqlx::Error> {
        let Some(mut membership) = self.memberships.get_mut(&membership_id) else {
            return Ok(None);
        };
        if membership.status != from {
            return Ok(None);
        }
        membership.status = to;
        membership.updated_at = OffsetDateTime::now_utc();
        Ok(Some(membership.clone()))
    }

    async fn recount_active_members(
        &self,
        group_id: Uuid,
    ) -> Result<Option<MemberRecount>, sqlx::Error> {
        let Some(mut group) = self.groups.get_mut(&group_id) else {
            return Ok(None);
        };
        let recount = MemberRecount {
            cached: group.member_count,
            actual: self.count_active(group_id),
        };
        if recount.actual != recount.cached {
            group.member_count = recount.actual;
            group.updated_at = OffsetDateTime::now_utc();
        }
        Ok(Some(recount))
    }
}

#[async_trait]
impl UsageCounterRepository for InMemoryDb {
    async fn get_usage_count(
        &self,
        group_id: Uuid,
        period: PeriodKey,
    ) -> Result<Option<i64>, sqlx::Error> {
        Ok(self.usage.get(&(group_id, period)).map(|c| *c))
    }

    async fn ensure_usage_counter(
        &self,
        group_id: Uuid,
        period: PeriodKey,
    ) -> Result<i64, sqlx::Error> {
        Ok(*self.usage.entry((group_id, period)).or_insert(0))
    }

    async fn compare_and_increment_usage(
        &self,
        group_id: Uuid,
        period: PeriodKey,
        expected: i64,
    ) -> Result<bool, sqlx::Error> {
        let Some(mut count) = self.usage.get_mut(&(group_id, period)) else {
            return Ok(false);
        };
        if *count != expected {
            return Ok(false);
        }
        *count += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::group::Visibility;

    fn bounded(max: i64) -> TierProjection {
        TierProjection {
            is_premium: false,
            max_members: Some(max),
            monthly_event_quota: Some(1),
        }
    }

    #[tokio::test]
    async fn member_increment_respects_expected_and_limit() {
        let db = InMemoryDb::new();
        let group = db
            .create_group(NewGroup {
                owner_account_id: Uuid::new_v4(),
                visibility: Visibility::Open,
                projection: bounded(1),
                applied_tier_version: 0,
            })
            .await
            .unwrap();

        assert!(!db.compare_and_increment_member_count(group.id, 3).await.unwrap());
        assert!(db.compare_and_increment_member_count(group.id, 0).await.unwrap());
        assert!(!db.compare_and_increment_member_count(group.id, 1).await.unwrap());
        assert_eq!(db.member_count_high_water(group.id), 1);
    }

    #[tokio::test]
    async fn claim_is_single_winner_until_stale() {
        let db = InMemoryDb::new();
        let event = NewBillingEvent {
            external_id: "evt_1".into(),
            account_id: Uuid::new_v4(),
            event_type: "subscription_deleted".into(),
            observed_at: OffsetDateTime::now_utc(),
        };
        let long_ago = OffsetDateTime::now_utc() - time::Duration::hours(1);
        assert!(db.try_claim_event(&event, long_ago).await.unwrap());
        assert!(!db.try_claim_event(&event, long_ago).await.unwrap());

        let future = OffsetDateTime::now_utc() + time::Duration::hours(1);
        assert!(db.try_claim_event(&event, future).await.unwrap());

        db.mark_event_applied("evt_1", OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(!db.try_claim_event(&event, future).await.unwrap());
        db.release_event_claim("evt_1").await.unwrap();
        assert!(db.find_event("evt_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_membership_pair_is_rejected() {
        let db = InMemoryDb::new();
        let (group_id, account_id) = (Uuid::new_v4(), Uuid::new_v4());
        let first = db
            .insert_membership(group_id, account_id, MembershipStatus::Pending)
            .await
            .unwrap();
        assert!(first.is_some());
        let second = db
            .insert_membership(group_id, account_id, MembershipStatus::Active)
            .await
            .unwrap();
        assert!(second.is_none());
    }
}
