use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::usage_counter_repository::UsageCounterRepository;
use crate::engine::error::EngineError;
use crate::models::usage::PeriodKey;

/// Per-group, per-calendar-month creation counter. A new month starts a new
/// row, so rollover needs no reset job. Increments only happen through the
/// capacity gate.
#[derive(Clone)]
pub struct UsageCounter {
    repo: Arc<dyn UsageCounterRepository>,
}

impl UsageCounter {
    pub fn new(repo: Arc<dyn UsageCounterRepository>) -> Self {
        Self { repo }
    }

    /// Creations recorded for the month containing `now`.
    pub async fn current(&self, group_id: Uuid, now: OffsetDateTime) -> Result<i64, EngineError> {
        let period = PeriodKey::for_instant(now);
        Ok(self.repo.get_usage_count(group_id, period).await?.unwrap_or(0))
    }

    pub(crate) async fn ensure(&self, group_id: Uuid, period: PeriodKey) -> Result<i64, EngineError> {
        Ok(self.repo.ensure_usage_counter(group_id, period).await?)
    }

    pub(crate) async fn compare_and_increment(
        &self,
        group_id: Uuid,
        period: PeriodKey,
        expected: i64,
    ) -> Result<bool, EngineError> {
        Ok(self
            .repo
            .compare_and_increment_usage(group_id, period, expected)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_db::InMemoryDb;
    use time::macros::datetime;

    #[tokio::test]
    async fn reads_zero_for_untouched_period() {
        let counter = UsageCounter::new(Arc::new(InMemoryDb::new()));
        let count = counter
            .current(Uuid::new_v4(), datetime!(2026-03-15 12:00 UTC))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn months_are_counted_separately() {
        let counter = UsageCounter::new(Arc::new(InMemoryDb::new()));
        let group_id = Uuid::new_v4();
        let march = PeriodKey::for_instant(datetime!(2026-03-31 23:59 UTC));

        counter.ensure(group_id, march).await.unwrap();
        assert!(counter.compare_and_increment(group_id, march, 0).await.unwrap());
        assert!(!counter.compare_and_increment(group_id, march, 0).await.unwrap());

        assert_eq!(
            counter
                .current(group_id, datetime!(2026-03-01 00:00 UTC))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            counter
                .current(group_id, datetime!(2026-04-01 00:00 UTC))
                .await
                .unwrap(),
            0
        );
    }
}
