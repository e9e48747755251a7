use crate::db::membership_repository::{MemberRecount, MembershipRepository, SlotWrite};
use crate::models::membership::{Membership, MembershipStatus};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

pub struct PostgresMembershipRepository {
    pub pool: PgPool,
}

const MEMBERSHIP_COLUMNS: &str =
    "id, group_id, account_id, status, joined_at, created_at, updated_at";

// Takes one member slot inside `tx`. Locks the group row until the
// transaction ends.
async fn take_member_slot(
    tx: &mut Transaction<'_, Postgres>,
    group_id: Uuid,
    expected_count: i64,
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
    .bind(expected_count)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl MembershipRepository for PostgresMembershipRepository {
    async fn insert_membership(
        &self,
        group_id: Uuid,
        account_id: Uuid,
        status: MembershipStatus,
    ) -> Result<Option<Membership>, sqlx::Error> {
        let joined_at =
            (status == MembershipStatus::Active).then(OffsetDateTime::now_utc);
        let sql = format!(
            r#"
            INSERT INTO memberships (id, group_id, account_id, status, joined_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (group_id, account_id) DO NOTHING
            RETURNING {MEMBERSHIP_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Membership>(&sql)
            .bind(Uuid::new_v4())
            .bind(group_id)
            .bind(account_id)
            .bind(status)
            .bind(joined_at)
            .fetch_optional(&self.pool)
            .await
    }

    async fn insert_active_membership(
        &self,
        group_id: Uuid,
        account_id: Uuid,
        expected_count: i64,
    ) -> Result<SlotWrite<Membership>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        if !take_member_slot(&mut tx, group_id, expected_count).await? {
            tx.rollback().await?;
            return Ok(SlotWrite::CountMoved);
        }

        let sql = format!(
            r#"
            INSERT INTO memberships (id, group_id, account_id, status, joined_at)
            VALUES ($1, $2, $3, 'active', NOW())
            ON CONFLICT (group_id, account_id) DO NOTHING
            RETURNING {MEMBERSHIP_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, Membership>(&sql)
            .bind(Uuid::new_v4())
            .bind(group_id)
            .bind(account_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(membership) = inserted else {
            tx.rollback().await?;
            return Ok(SlotWrite::Conflict);
        };

        tx.commit().await?;
        Ok(SlotWrite::Written(membership))
    }

    async fn activate_membership(
        &self,
        membership_id: Uuid,
        group_id: Uuid,
        expected_count: i64,
    ) -> Result<SlotWrite<Membership>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        if !take_member_slot(&mut tx, group_id, expected_count).await? {
            tx.rollback().await?;
            return Ok(SlotWrite::CountMoved);
        }

        let sql = format!(
            r#"
            UPDATE memberships
            SET status = 'active', joined_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND group_id = $2 AND status = 'pending'
            RETURNING {MEMBERSHIP_COLUMNS}
            "#
        );
        let activated = sqlx::query_as::<_, Membership>(&sql)
            .bind(membership_id)
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(membership) = activated else {
            tx.rollback().await?;
            return Ok(SlotWrite::Conflict);
        };

        tx.commit().await?;
        Ok(SlotWrite::Written(membership))
    }

    async fn deactivate_membership(
        &self,
        membership_id: Uuid,
        to: MembershipStatus,
    ) -> Result<Option<Membership>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Group row first, the same order the slot writes lock in.
        let group_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT g.id
            FROM resource_groups g
            JOIN memberships m ON m.group_id = g.id
            WHERE m.id = $1
            FOR UPDATE OF g
            "#,
        )
        .bind(membership_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(group_id) = group_id else {
            tx.rollback().await?;
            return Ok(None);
        };

        let sql = format!(
            r#"
            UPDATE memberships
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            RETURNING {MEMBERSHIP_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, Membership>(&sql)
            .bind(membership_id)
            .bind(to)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(membership) = updated else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE resource_groups
            SET member_count = GREATEST(member_count - 1, 0), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(group_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(membership))
    }

    async fn find_membership(
        &self,
        membership_id: Uuid,
    ) -> Result<Option<Membership>, sqlx::Error> {
        let sql = format!("SELECT {MEMBERSHIP_COLUMNS} FROM memberships WHERE id = $1");
        sqlx::query_as::<_, Membership>(&sql)
            .bind(membership_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn find_membership_for_pair(
        &self,
        group_id: Uuid,
        account_id: Uuid,
    ) -> Result<Option<Membership>, sqlx::Error> {
        let sql = format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM memberships WHERE group_id = $1 AND account_id = $2"
        );
        sqlx::query_as::<_, Membership>(&sql)
            .bind(group_id)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn compare_and_set_status(
        &self,
        membership_id: Uuid,
        from: MembershipStatus,
        to: MembershipStatus,
    ) -> Result<Option<Membership>, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE memberships
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {MEMBERSHIP_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Membership>(&sql)
            .bind(membership_id)
            .bind(from)
            .bind(to)
            .fetch_optional(&self.pool)
            .await
    }

    async fn recount_active_members(
        &self,
        group_id: Uuid,
    ) -> Result<Option<MemberRecount>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let cached = sqlx::query_scalar::<_, i64>(
            "SELECT member_count FROM resource_groups WHERE id = $1 FOR UPDATE",
        )
        .bind(group_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(cached) = cached else {
            tx.rollback().await?;
            return Ok(None);
        };

        let actual = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM memberships WHERE group_id = $1 AND status = 'active'",
        )
        .bind(group_id)
        .fetch_one(&mut *tx)
        .await?;

        if actual != cached {
            sqlx::query(
                "UPDATE resource_groups SET member_count = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(group_id)
            .bind(actual)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(MemberRecount { cached, actual }))
    }
}
