use crate::db::usage_counter_repository::UsageCounterRepository;
use crate::models::usage::PeriodKey;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

pub struct PostgresUsageCounterRepository {
    pub pool: PgPool,
}

#[async_trait]
impl UsageCounterRepository for PostgresUsageCounterRepository {
    async fn get_usage_count(
        &self,
        group_id: Uuid,
        period: PeriodKey,
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT count FROM usage_counters WHERE group_id = $1 AND period_key = $2",
        )
        .bind(group_id)
        .bind(period.to_string())
        .fetch_optional(&self.pool)
        .await
    }

    async fn ensure_usage_counter(
        &self,
        group_id: Uuid,
        period: PeriodKey,
    ) -> Result<i64, sqlx::Error> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO usage_counters (group_id, period_key, count)
            VALUES ($1, $2, 0)
            ON CONFLICT (group_id, period_key) DO UPDATE SET count = usage_counters.count
            RETURNING count
            "#,
        )
        .bind(group_id)
        .bind(period.to_string())
        .fetch_one(&self.pool)
        .await
    }

    async fn compare_and_increment_usage(
        &self,
        group_id: Uuid,
        period: PeriodKey,
        expected: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE usage_counters
            SET count = count + 1
            WHERE group_id = $1 AND period_key = $2 AND count = $3
            "#,
        )
        .bind(group_id)
        .bind(period.to_string())
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
