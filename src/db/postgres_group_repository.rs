use crate::db::group_repository::{GroupRepository, NewGroup};
use crate::models::group::{Group, TierProjection};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

pub struct PostgresGroupRepository {
    pub pool: PgPool,
}

const GROUP_COLUMNS: &str = "id, owner_account_id, visibility, is_premium, max_members, \
     monthly_event_quota, member_count, applied_tier_version, created_at, updated_at";

#[async_trait]
impl GroupRepository for PostgresGroupRepository {
    async fn create_group(&self, group: NewGroup) -> Result<Group, sqlx::Error> {
        let sql = format!(
            r#"
            INSERT INTO resource_groups
                (id, owner_account_id, visibility, is_premium, max_members,
                 monthly_event_quota, member_count, applied_tier_version)
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7)
            RETURNING {GROUP_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Group>(&sql)
            .bind(Uuid::new_v4())
            .bind(group.owner_account_id)
            .bind(group.visibility)
            .bind(group.projection.is_premium)
            .bind(group.projection.max_members)
            .bind(group.projection.monthly_event_quota)
            .bind(group.applied_tier_version)
            .fetch_one(&self.pool)
            .await
    }

    async fn find_group(&self, group_id: Uuid) -> Result<Option<Group>, sqlx::Error> {
        let sql = format!("SELECT {GROUP_COLUMNS} FROM resource_groups WHERE id = $1");
        sqlx::query_as::<_, Group>(&sql)
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn list_groups_for_owner(
        &self,
        owner_account_id: Uuid,
    ) -> Result<Vec<Group>, sqlx::Error> {
        let sql = format!(
            "SELECT {GROUP_COLUMNS} FROM resource_groups WHERE owner_account_id = $1 ORDER BY created_at"
        );
        sqlx::query_as::<_, Group>(&sql)
            .bind(owner_account_id)
            .fetch_all(&self.pool)
            .await
    }

    async fn apply_tier_projection(
        &self,
        group_id: Uuid,
        projection: TierProjection,
        version: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE resource_groups
            SET is_premium = $2,
                max_members = $3,
                monthly_event_quota = $4,
                applied_tier_version = $5,
                updated_at = NOW()
            WHERE id = $1 AND applied_tier_version < $5
            "#,
        )
        .bind(group_id)
        .bind(projection.is_premium)
        .bind(projection.max_members)
        .bind(projection.monthly_event_quota)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_increment_member_count(
        &self,
        group_id: Uuid,
        expected: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE resource_groups
            SET member_count = member_count + 1, updated_at = NOW()
            WHERE id = $1
              AND member_count = $2
              AND (max_members IS NULL OR member_count < max_members)
            "#,
        )
        .bind(group_id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
