use async_trait::async_trait;
use uuid::Uuid;

use crate::models::membership::{Membership, MembershipStatus};

/// Result of a membership write that also takes a member slot. The row and
/// the group's `member_count` commit together or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotWrite<T> {
    Written(T),
    /// `member_count` was no longer the expected value, or the group is full.
    CountMoved,
    /// The membership row was not in the expected state; nothing was written.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRecount {
    pub cached: i64,
    pub actual: i64,
}

#[async_trait]
pub trait MembershipRepository: Send + Sync {
    /// Inserts a new (group, account) row without taking a slot. Returns
    /// `None` when the pair already exists; rows are never replaced.
    async fn insert_membership(
        &self,
        group_id: Uuid,
        account_id: Uuid,
        status: MembershipStatus,
    ) -> Result<Option<Membership>, sqlx::Error>;

    /// Inserts an ACTIVE row for the pair and moves `member_count` from
    /// `expected_count` to `expected_count + 1` in the same commit.
    /// `Conflict` means the pair already exists.
    async fn insert_active_membership(
        &self,
        group_id: Uuid,
        account_id: Uuid,
        expected_count: i64,
    ) -> Result<SlotWrite<Membership>, sqlx::Error>;

    /// PENDING to ACTIVE together with `member_count + 1` from
    /// `expected_count`. `Conflict` means the row is no longer PENDING.
    async fn activate_membership(
        &self,
        membership_id: Uuid,
        group_id: Uuid,
        expected_count: i64,
    ) -> Result<SlotWrite<Membership>, sqlx::Error>;

    /// ACTIVE to `to` together with `member_count - 1`. Returns `None` when
    /// the stored status is no longer ACTIVE.
    async fn deactivate_membership(
        &self,
        membership_id: Uuid,
        to: MembershipStatus,
    ) -> Result<Option<Membership>, sqlx::Error>;

    async fn find_membership(&self, membership_id: Uuid)
        -> Result<Option<Membership>, sqlx::Error>;

    async fn find_membership_for_pair(
        &self,
        group_id: Uuid,
        account_id: Uuid,
    ) -> Result<Option<Membership>, sqlx::Error>;

    /// Moves `membership_id` from `from` to `to`. Returns `None` when the
    /// stored status is no longer `from`. Only for changes that leave the
    /// ACTIVE set untouched.
    async fn compare_and_set_status(
        &self,
        membership_id: Uuid,
        from: MembershipStatus,
        to: MembershipStatus,
    ) -> Result<Option<Membership>, sqlx::Error>;

    /// Counts ACTIVE rows and overwrites a drifted `member_count` while
    /// holding the group row, so no slot write can interleave. `None` when
    /// the group does not exist.
    async fn recount_active_members(
        &self,
        group_id: Uuid,
    ) -> Result<Option<MemberRecount>, sqlx::Error>;
}
