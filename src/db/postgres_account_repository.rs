use crate::db::account_repository::AccountRepository;
use crate::models::account::{Account, BillingRefs, Tier};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

pub struct PostgresAccountRepository {
    pub pool: PgPool,
}

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    async fn create_account(&self, tier: Tier) -> Result<Account, sqlx::Error> {
        sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (id, tier, tier_version)
            VALUES ($1, $2, 0)
            RETURNING id, tier, tier_version, billing_customer_ref, billing_subscription_ref,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tier)
        .fetch_one(&self.pool)
        .await
    }

    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>, sqlx::Error> {
        sqlx::query_as::<_, Account>(
            r#"
            SELECT id, tier, tier_version, billing_customer_ref, billing_subscription_ref,
                   created_at, updated_at
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn compare_and_swap_tier(
        &self,
        account_id: Uuid,
        expected_version: i64,
        tier: Tier,
        refs: BillingRefs<'_>,
    ) -> Result<Option<Account>, sqlx::Error> {
        sqlx::query_as::<_, Account>(
            r#"
            UPDATE accounts
            SET tier = $3,
                tier_version = tier_version + 1,
                billing_customer_ref = COALESCE($4, billing_customer_ref),
                billing_subscription_ref = COALESCE($5, billing_subscription_ref),
                updated_at = NOW()
            WHERE id = $1 AND tier_version = $2
            RETURNING id, tier, tier_version, billing_customer_ref, billing_subscription_ref,
                      created_at, updated_at
            "#,
        )
        .bind(account_id)
        .bind(expected_version)
        .bind(tier)
        .bind(refs.customer)
        .bind(refs.subscription)
        .fetch_optional(&self.pool)
        .await
    }
}
