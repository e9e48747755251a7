use async_trait::async_trait;
use uuid::Uuid;

use crate::models::group::{Group, TierProjection, Visibility};

#[derive(Debug, Clone, Copy)]
pub struct NewGroup {
    pub owner_account_id: Uuid,
    pub visibility: Visibility,
    pub projection: TierProjection,
    pub applied_tier_version: i64,
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn create_group(&self, group: NewGroup) -> Result<Group, sqlx::Error>;

    async fn find_group(&self, group_id: Uuid) -> Result<Option<Group>, sqlx::Error>;

    async fn list_groups_for_owner(&self, owner_account_id: Uuid)
        -> Result<Vec<Group>, sqlx::Error>;

    /// Writes the projection and `applied_tier_version = version` only while
    /// the stored `applied_tier_version` is lower than `version`.
    async fn apply_tier_projection(
        &self,
        group_id: Uuid,
        projection: TierProjection,
        version: i64,
    ) -> Result<bool, sqlx::Error>;

    /// `member_count + 1`, conditioned on the count still being `expected`
    /// and on a free slot under `max_members` at write time. Slots that come
    /// with a membership row go through `MembershipRepository` instead.
    async fn compare_and_increment_member_count(
        &self,
        group_id: Uuid,
        expected: i64,
    ) -> Result<bool, sqlx::Error>;
}
