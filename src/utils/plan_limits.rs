use serde::{Deserialize, Serialize};

use crate::models::{account::Tier, group::TierProjection};

pub const DEFAULT_FREE_MAX_MEMBERS: i64 = 10;
pub const DEFAULT_TRIAL_MAX_MEMBERS: i64 = 50;
pub const DEFAULT_FREE_MONTHLY_EVENT_QUOTA: i64 = 2;
pub const DEFAULT_TRIAL_MONTHLY_EVENT_QUOTA: i64 = 10;

/// Bounded limits for the non-premium tiers. Premium is unbounded on every
/// axis; canceled accounts fall back to the free limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub free_max_members: i64,
    pub trial_max_members: i64,
    pub free_monthly_event_quota: i64,
    pub trial_monthly_event_quota: i64,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            free_max_members: DEFAULT_FREE_MAX_MEMBERS,
            trial_max_members: DEFAULT_TRIAL_MAX_MEMBERS,
            free_monthly_event_quota: DEFAULT_FREE_MONTHLY_EVENT_QUOTA,
            trial_monthly_event_quota: DEFAULT_TRIAL_MONTHLY_EVENT_QUOTA,
        }
    }
}

impl TierLimits {
    pub fn max_members(&self, tier: Tier) -> Option<i64> {
        match tier {
            Tier::Premium => None,
            Tier::Trial => Some(self.trial_max_members),
            Tier::Free | Tier::Canceled => Some(self.free_max_members),
        }
    }

    pub fn monthly_event_quota(&self, tier: Tier) -> Option<i64> {
        match tier {
            Tier::Premium => None,
            Tier::Trial => Some(self.trial_monthly_event_quota),
            Tier::Free | Tier::Canceled => Some(self.free_monthly_event_quota),
        }
    }

    /// Everything a group derives from its owner's tier.
    pub fn projection(&self, tier: Tier) -> TierProjection {
        TierProjection {
            is_premium: tier.is_premium(),
            max_members: self.max_members(tier),
            monthly_event_quota: self.monthly_event_quota(tier),
        }
    }
}
