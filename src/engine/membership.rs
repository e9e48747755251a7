use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::db::group_repository::GroupRepository;
use crate::db::membership_repository::MembershipRepository;
use crate::engine::capacity::{CapacityGate, DenialReason, GatedWrite};
use crate::engine::error::EngineError;
use crate::models::group::Visibility;
use crate::models::membership::{Membership, MembershipAction, MembershipStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MembershipOutcome {
    Changed { membership: Membership },
    Denied { reason: DenialReason },
}

impl MembershipOutcome {
    fn changed(membership: Membership) -> Self {
        MembershipOutcome::Changed { membership }
    }

    fn denied(reason: DenialReason) -> Self {
        MembershipOutcome::Denied { reason }
    }

    pub fn status(&self) -> Option<MembershipStatus> {
        match self {
            MembershipOutcome::Changed { membership } => Some(membership.status),
            MembershipOutcome::Denied { .. } => None,
        }
    }
}

/// Membership lifecycle. Every status change is a CAS on the previous
/// status. Changes into or out of ACTIVE move the group's `member_count` in
/// the same commit, so the cached count always matches the ACTIVE rows.
#[derive(Clone)]
pub struct MembershipService {
    groups: Arc<dyn GroupRepository>,
    memberships: Arc<dyn MembershipRepository>,
    gate: CapacityGate,
}

impl MembershipService {
    pub fn new(
        groups: Arc<dyn GroupRepository>,
        memberships: Arc<dyn MembershipRepository>,
        gate: CapacityGate,
    ) -> Self {
        Self {
            groups,
            memberships,
            gate,
        }
    }

    pub async fn request_join(
        &self,
        group_id: Uuid,
        account_id: Uuid,
    ) -> Result<MembershipOutcome, EngineError> {
        let group = self
            .groups
            .find_group(group_id)
            .await?
            .ok_or_else(|| EngineError::not_found("group", group_id))?;

        if let Some(existing) = self
            .memberships
            .find_membership_for_pair(group_id, account_id)
            .await?
        {
            return Ok(existing_pair_outcome(existing));
        }

        let created = match group.visibility {
            Visibility::Restricted => self
                .memberships
                .insert_membership(group_id, account_id, MembershipStatus::Pending)
                .await?,
            Visibility::Open => {
                let memberships = self.memberships.clone();
                let gated = self
                    .gate
                    .admit_member_with(group_id, |expected| {
                        let memberships = memberships.clone();
                        async move {
                            memberships
                                .insert_active_membership(group_id, account_id, expected)
                                .await
                        }
                    })
                    .await?;
                match gated {
                    GatedWrite::Written(membership) => Some(membership),
                    GatedWrite::Conflict => None,
                    GatedWrite::Denied(reason) => return Ok(MembershipOutcome::denied(reason)),
                }
            }
        };

        match created {
            Some(membership) => {
                info!(%group_id, %account_id, status = %membership.status, "membership created");
                Ok(MembershipOutcome::changed(membership))
            }
            None => {
                // A concurrent request for the same pair won the insert.
                let existing = self
                    .memberships
                    .find_membership_for_pair(group_id, account_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("membership", account_id))?;
                Ok(existing_pair_outcome(existing))
            }
        }
    }

    /// PENDING to ACTIVE, gated on a free member slot. A denial leaves the
    /// membership PENDING.
    pub async fn approve(&self, membership_id: Uuid) -> Result<MembershipOutcome, EngineError> {
        let membership = self.load(membership_id).await?;
        if membership.status.apply(MembershipAction::Approve).is_none() {
            return Err(EngineError::InvalidTransition {
                from: membership.status,
                action: MembershipAction::Approve,
            });
        }

        let group_id = membership.group_id;
        let memberships = self.memberships.clone();
        let gated = self
            .gate
            .admit_member_with(group_id, |expected| {
                let memberships = memberships.clone();
                async move {
                    memberships
                        .activate_membership(membership_id, group_id, expected)
                        .await
                }
            })
            .await?;

        match gated {
            GatedWrite::Written(updated) => {
                info!(%membership_id, %group_id, "membership approved");
                Ok(MembershipOutcome::changed(updated))
            }
            GatedWrite::Denied(reason) => {
                info!(%membership_id, %group_id, "approval denied: group is full");
                Ok(MembershipOutcome::denied(reason))
            }
            GatedWrite::Conflict => {
                let current = self.load(membership_id).await?;
                Err(EngineError::InvalidTransition {
                    from: current.status,
                    action: MembershipAction::Approve,
                })
            }
        }
    }

    pub async fn reject(&self, membership_id: Uuid) -> Result<MembershipOutcome, EngineError> {
        self.transition(membership_id, MembershipAction::Reject).await
    }

    pub async fn ban(&self, membership_id: Uuid) -> Result<MembershipOutcome, EngineError> {
        self.transition(membership_id, MembershipAction::Ban).await
    }

    pub async fn remove(&self, membership_id: Uuid) -> Result<MembershipOutcome, EngineError> {
        self.transition(membership_id, MembershipAction::Remove).await
    }

    pub async fn leave(
        &self,
        group_id: Uuid,
        account_id: Uuid,
    ) -> Result<MembershipOutcome, EngineError> {
        let membership = self
            .memberships
            .find_membership_for_pair(group_id, account_id)
            .await?
            .ok_or_else(|| EngineError::not_found("membership", account_id))?;
        self.transition(membership.id, MembershipAction::Leave).await
    }

    async fn load(&self, membership_id: Uuid) -> Result<Membership, EngineError> {
        self.memberships
            .find_membership(membership_id)
            .await?
            .ok_or_else(|| EngineError::not_found("membership", membership_id))
    }

    // Transitions that never need a new slot.
    async fn transition(
        &self,
        membership_id: Uuid,
        action: MembershipAction,
    ) -> Result<MembershipOutcome, EngineError> {
        let membership = self.load(membership_id).await?;
        let from = membership.status;
        let Some(to) = from.apply(action) else {
            return Err(EngineError::InvalidTransition { from, action });
        };

        let written = if from == MembershipStatus::Active {
            self.memberships.deactivate_membership(membership_id, to).await?
        } else {
            self.memberships
                .compare_and_set_status(membership_id, from, to)
                .await?
        };
        let Some(updated) = written else {
            let current = self.load(membership_id).await?;
            return Err(EngineError::InvalidTransition {
                from: current.status,
                action,
            });
        };

        info!(%membership_id, group_id = %updated.group_id, %action, %from, %to, "membership transitioned");
        Ok(MembershipOutcome::changed(updated))
    }
}

fn existing_pair_outcome(existing: Membership) -> MembershipOutcome {
    match existing.status {
        MembershipStatus::Pending | MembershipStatus::Active => MembershipOutcome::changed(existing),
        MembershipStatus::Banned => MembershipOutcome::denied(DenialReason::Banned),
        MembershipStatus::Removed => MembershipOutcome::denied(DenialReason::Removed),
    }
}
