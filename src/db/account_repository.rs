use async_trait::async_trait;
use uuid::Uuid;

use crate::models::account::{Account, BillingRefs, Tier};

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn create_account(&self, tier: Tier) -> Result<Account, sqlx::Error>;

    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>, sqlx::Error>;

    /// Sets `tier` and `refs` and advances `tier_version` by one, but only
    /// while the stored version still equals `expected_version`. Returns the
    /// updated row, or `None` when another writer got there first.
    async fn compare_and_swap_tier(
        &self,
        account_id: Uuid,
        expected_version: i64,
        tier: Tier,
        refs: BillingRefs<'_>,
    ) -> Result<Option<Account>, sqlx::Error>;
}
