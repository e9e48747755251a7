//! Backstop for the eventually-consistent parts of the engine.
//!
//! An audit recounts ACTIVE memberships and overwrites a drifted
//! `member_count`, then re-runs the cascade for any group whose
//! `applied_tier_version` lags its owner. The recount holds the group row, so
//! it never interleaves with a membership write that moves the count. Audits
//! only converge state and are safe to run at any cadence alongside normal
//! traffic.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::account_repository::AccountRepository;
use crate::db::group_repository::GroupRepository;
use crate::db::membership_repository::{MemberRecount, MembershipRepository};
use crate::engine::cascade::{CascadeJob, GroupCascadeResult, RemediationQueue, TierCascadePropagator};
use crate::engine::error::EngineError;
use crate::models::account::Account;
use crate::models::group::Group;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Drift {
    MemberCount { cached: i64, actual: i64 },
    TierLag { applied: i64, current: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftFinding {
    pub group_id: Uuid,
    pub drift: Drift,
    pub corrected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub groups_checked: usize,
    pub findings: Vec<DriftFinding>,
}

impl AuditReport {
    fn new() -> Self {
        Self {
            checked_at: OffsetDateTime::now_utc(),
            groups_checked: 0,
            findings: Vec::new(),
        }
    }

    fn merge(&mut self, other: AuditReport) {
        self.groups_checked += other.groups_checked;
        self.findings.extend(other.findings);
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn uncorrected(&self) -> usize {
        self.findings.iter().filter(|f| !f.corrected).count()
    }
}

#[derive(Clone)]
pub struct ReconciliationAuditor {
    accounts: Arc<dyn AccountRepository>,
    groups: Arc<dyn GroupRepository>,
    memberships: Arc<dyn MembershipRepository>,
    propagator: TierCascadePropagator,
    remediation: RemediationQueue,
}

impl ReconciliationAuditor {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        groups: Arc<dyn GroupRepository>,
        memberships: Arc<dyn MembershipRepository>,
        propagator: TierCascadePropagator,
        remediation: RemediationQueue,
    ) -> Self {
        Self {
            accounts,
            groups,
            memberships,
            propagator,
            remediation,
        }
    }

    pub async fn audit_resource(&self, group_id: Uuid) -> Result<AuditReport, EngineError> {
        let group = self
            .groups
            .find_group(group_id)
            .await?
            .ok_or_else(|| EngineError::not_found("group", group_id))?;
        let owner = self.load_account(group.owner_account_id).await?;

        let mut report = AuditReport::new();
        report.groups_checked = 1;
        report.findings = self.audit_group(&group, &owner).await?;
        Ok(report)
    }

    pub async fn audit_account(&self, account_id: Uuid) -> Result<AuditReport, EngineError> {
        let account = self.load_account(account_id).await?;
        let groups = self.groups.list_groups_for_owner(account_id).await?;

        let mut report = AuditReport::new();
        for group in &groups {
            report.findings.extend(self.audit_group(group, &account).await?);
        }
        report.groups_checked = groups.len();
        Ok(report)
    }

    /// Audits every account and group queued for remediation. Targets that
    /// cannot be audited right now are queued again.
    pub async fn sweep(&self) -> AuditReport {
        let mut report = AuditReport::new();
        let accounts = self.remediation.drain_accounts();
        let targets = self.remediation.drain();
        if accounts.is_empty() && targets.is_empty() {
            return report;
        }

        info!(
            accounts = accounts.len(),
            groups = targets.len(),
            "auditing remediation targets"
        );
        for (account_id, tier_version) in accounts {
            match self.audit_account(account_id).await {
                Ok(account_report) => report.merge(account_report),
                Err(EngineError::NotFound { .. }) => {
                    warn!(%account_id, "remediation account no longer exists");
                }
                Err(err) => {
                    warn!(?err, %account_id, "remediation account audit failed, requeueing");
                    self.remediation.push_account(account_id, tier_version);
                }
            }
        }
        for (group_id, tier_version) in targets {
            match self.audit_resource(group_id).await {
                Ok(group_report) => report.merge(group_report),
                Err(EngineError::NotFound { .. }) => {
                    warn!(%group_id, "remediation target no longer exists");
                }
                Err(err) => {
                    warn!(?err, %group_id, "remediation audit failed, requeueing");
                    self.remediation.push(group_id, tier_version);
                }
            }
        }
        report
    }

    async fn load_account(&self, account_id: Uuid) -> Result<Account, EngineError> {
        self.accounts
            .find_account(account_id)
            .await?
            .ok_or_else(|| EngineError::not_found("account", account_id))
    }

    async fn audit_group(
        &self,
        group: &Group,
        owner: &Account,
    ) -> Result<Vec<DriftFinding>, EngineError> {
        let mut findings = Vec::new();

        if let Some(MemberRecount { cached, actual }) =
            self.memberships.recount_active_members(group.id).await?
        {
            if actual != cached {
                warn!(group_id = %group.id, cached, actual, "drift detected: member count");
                findings.push(DriftFinding {
                    group_id: group.id,
                    drift: Drift::MemberCount { cached, actual },
                    corrected: true,
                });
            }
        }

        if group.applied_tier_version < owner.tier_version {
            warn!(
                group_id = %group.id,
                applied = group.applied_tier_version,
                current = owner.tier_version,
                "drift detected: tier projection lags owner"
            );
            let job = CascadeJob {
                account_id: owner.id,
                tier: owner.tier,
                tier_version: owner.tier_version,
            };
            let result = self.propagator.apply_to_group(group, job).await;
            findings.push(DriftFinding {
                group_id: group.id,
                drift: Drift::TierLag {
                    applied: group.applied_tier_version,
                    current: owner.tier_version,
                },
                corrected: result != GroupCascadeResult::Failed,
            });
        }

        Ok(findings)
    }
}
