use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::db::account_repository::AccountRepository;
use crate::db::group_repository::{GroupRepository, NewGroup};
use crate::engine::cascade::{CascadeJob, GroupCascadeResult, TierCascadePropagator};
use crate::engine::error::EngineError;
use crate::models::group::{Group, Visibility};

/// Creates groups already stamped with their owner's current tier.
#[derive(Clone)]
pub struct GroupRegistry {
    accounts: Arc<dyn AccountRepository>,
    groups: Arc<dyn GroupRepository>,
    propagator: TierCascadePropagator,
}

impl GroupRegistry {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        groups: Arc<dyn GroupRepository>,
        propagator: TierCascadePropagator,
    ) -> Self {
        Self {
            accounts,
            groups,
            propagator,
        }
    }

    pub async fn create_group(
        &self,
        owner_account_id: Uuid,
        visibility: Visibility,
    ) -> Result<Group, EngineError> {
        let owner = self
            .accounts
            .find_account(owner_account_id)
            .await?
            .ok_or_else(|| EngineError::not_found("account", owner_account_id))?;

        let group = self
            .groups
            .create_group(NewGroup {
                owner_account_id,
                visibility,
                projection: self.propagator.limits().projection(owner.tier),
                applied_tier_version: owner.tier_version,
            })
            .await?;
        info!(group_id = %group.id, %owner_account_id, tier = %owner.tier, "group created");

        // A transition may have committed while the row was being written,
        // and its cascade could have listed the owner's groups before this one
        // existed.
        let Some(latest) = self.accounts.find_account(owner_account_id).await? else {
            return Ok(group);
        };
        if latest.tier_version > group.applied_tier_version {
            let job = CascadeJob {
                account_id: owner_account_id,
                tier: latest.tier,
                tier_version: latest.tier_version,
            };
            if self.propagator.apply_to_group(&group, job).await == GroupCascadeResult::Applied {
                if let Some(refreshed) = self.groups.find_group(group.id).await? {
                    return Ok(refreshed);
                }
            }
        }
        Ok(group)
    }
}
