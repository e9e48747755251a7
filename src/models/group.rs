use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "group_visibility")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Join requests are admitted immediately, subject to capacity.
    Open,
    /// Join requests wait in PENDING until an approver acts on them.
    Restricted,
}

/// A resource owned by an account. `is_premium`, `max_members` and
/// `monthly_event_quota` are projections of the owner's tier and are only
/// written by the tier cascade.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Group {
    pub id: Uuid,
    pub owner_account_id: Uuid,
    pub visibility: Visibility,
    pub is_premium: bool,
    /// `None` means unbounded.
    pub max_members: Option<i64>,
    /// `None` means unbounded.
    pub monthly_event_quota: Option<i64>,
    /// Cached count of ACTIVE memberships.
    pub member_count: i64,
    pub applied_tier_version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Group {
    pub fn has_member_slot(&self) -> bool {
        match self.max_members {
            Some(max) => self.member_count < max,
            None => true,
        }
    }
}

/// Tier-derived fields written onto a group in one conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierProjection {
    pub is_premium: bool,
    pub max_members: Option<i64>,
    pub monthly_event_quota: Option<i64>,
}
