use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "membership_status")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Pending,
    Active,
    Banned,
    Removed,
}

/// Operations that move a membership between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipAction {
    Approve,
    Reject,
    Ban,
    Remove,
    Leave,
}

impl MembershipAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipAction::Approve => "approve",
            MembershipAction::Reject => "reject",
            MembershipAction::Ban => "ban",
            MembershipAction::Remove => "remove",
            MembershipAction::Leave => "leave",
        }
    }
}

impl std::fmt::Display for MembershipAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Pending => "pending",
            MembershipStatus::Active => "active",
            MembershipStatus::Banned => "banned",
            MembershipStatus::Removed => "removed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MembershipStatus::Banned | MembershipStatus::Removed)
    }

    /// Transition table. Returns the state an action leads to from `self`,
    /// or `None` when the action is not allowed.
    pub fn apply(self, action: MembershipAction) -> Option<MembershipStatus> {
        use MembershipAction::*;
        use MembershipStatus::*;
        match (self, action) {
            (Pending, Approve) => Some(Active),
            (Pending, Reject) => Some(Removed),
            (Active, Ban) => Some(Banned),
            (Active, Remove) | (Active, Leave) => Some(Removed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Membership {
    pub id: Uuid,
    pub group_id: Uuid,
    pub account_id: Uuid,
    pub status: MembershipStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub joined_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_moves_to_active_or_removed() {
        assert_eq!(
            MembershipStatus::Pending.apply(MembershipAction::Approve),
            Some(MembershipStatus::Active)
        );
        assert_eq!(
            MembershipStatus::Pending.apply(MembershipAction::Reject),
            Some(MembershipStatus::Removed)
        );
        assert_eq!(MembershipStatus::Pending.apply(MembershipAction::Ban), None);
    }

    #[test]
    fn active_moves_to_banned_or_removed() {
        assert_eq!(
            MembershipStatus::Active.apply(MembershipAction::Ban),
            Some(MembershipStatus::Banned)
        );
        assert_eq!(
            MembershipStatus::Active.apply(MembershipAction::Leave),
            Some(MembershipStatus::Removed)
        );
        assert_eq!(
            MembershipStatus::Active.apply(MembershipAction::Approve),
            None
        );
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for status in [MembershipStatus::Banned, MembershipStatus::Removed] {
            assert!(status.is_terminal());
            for action in [
                MembershipAction::Approve,
                MembershipAction::Reject,
                MembershipAction::Ban,
                MembershipAction::Remove,
                MembershipAction::Leave,
            ] {
                assert_eq!(status.apply(action), None);
            }
        }
    }
}
