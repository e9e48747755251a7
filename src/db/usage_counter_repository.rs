use async_trait::async_trait;
use uuid::Uuid;

use crate::models::usage::PeriodKey;

#[async_trait]
pub trait UsageCounterRepository: Send + Sync {
    /// Current count, or `None` when nothing was created in the period yet.
    async fn get_usage_count(
        &self,
        group_id: Uuid,
        period: PeriodKey,
    ) -> Result<Option<i64>, sqlx::Error>;

    /// Creates the period row at zero if missing and returns its count.
    async fn ensure_usage_counter(
        &self,
        group_id: Uuid,
        period: PeriodKey,
    ) -> Result<i64, sqlx::Error>;

    /// `count + 1` conditioned on the count still being `expected`.
    async fn compare_and_increment_usage(
        &self,
        group_id: Uuid,
        period: PeriodKey,
        expected: i64,
    ) -> Result<bool, sqlx::Error>;
}
