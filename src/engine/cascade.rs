use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::group_repository::GroupRepository;
use crate::engine::error::EngineError;
use crate::engine::retry::{retry_with_backoff, RetryPolicy};
use crate::models::account::Tier;
use crate::models::group::Group;
use crate::utils::plan_limits::TierLimits;

/// Work item produced by a committed tier transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CascadeJob {
    pub account_id: Uuid,
    pub tier: Tier,
    pub tier_version: i64,
}

/// Hands cascade jobs to whatever runs them. Enqueueing must not block the
/// caller on the cascade itself.
pub trait CascadeScheduler: Send + Sync {
    fn enqueue(&self, job: CascadeJob) -> Result<(), EngineError>;
}

pub struct ChannelCascadeScheduler {
    sender: mpsc::UnboundedSender<CascadeJob>,
}

impl ChannelCascadeScheduler {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CascadeJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl CascadeScheduler for ChannelCascadeScheduler {
    fn enqueue(&self, job: CascadeJob) -> Result<(), EngineError> {
        self.sender.send(job).map_err(|_| EngineError::QueueClosed)
    }
}

/// Work the cascade could not finish. Groups whose write failed after all
/// retries are queued by id; accounts whose cascade never reached their
/// groups (enqueue or listing failed) are queued whole. The auditor drains
/// both.
#[derive(Clone, Default)]
pub struct RemediationQueue {
    targets: Arc<DashMap<Uuid, i64>>,
    accounts: Arc<DashMap<Uuid, i64>>,
}

fn keep_highest(map: &DashMap<Uuid, i64>, id: Uuid, tier_version: i64) {
    map.entry(id)
        .and_modify(|v| *v = (*v).max(tier_version))
        .or_insert(tier_version);
}

fn drain_map(map: &DashMap<Uuid, i64>) -> Vec<(Uuid, i64)> {
    let keys: Vec<Uuid> = map.iter().map(|e| *e.key()).collect();
    keys.into_iter().filter_map(|key| map.remove(&key)).collect()
}

impl RemediationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the highest version seen per group.
    pub fn push(&self, group_id: Uuid, tier_version: i64) {
        keep_highest(&self.targets, group_id, tier_version);
    }

    pub fn push_account(&self, account_id: Uuid, tier_version: i64) {
        keep_highest(&self.accounts, account_id, tier_version);
    }

    pub fn drain(&self) -> Vec<(Uuid, i64)> {
        drain_map(&self.targets)
    }

    pub fn drain_accounts(&self) -> Vec<(Uuid, i64)> {
        drain_map(&self.accounts)
    }

    pub fn len(&self) -> usize {
        self.targets.len() + self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.accounts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCascadeResult {
    Applied,
    /// The group already carried this version or a newer one.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CascadeReport {
    pub job: CascadeJob,
    pub applied: Vec<Uuid>,
    pub skipped: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

impl CascadeReport {
    fn new(job: CascadeJob) -> Self {
        Self {
            job,
            applied: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn record(&mut self, group_id: Uuid, result: GroupCascadeResult) {
        match result {
            GroupCascadeResult::Applied => self.applied.push(group_id),
            GroupCascadeResult::Skipped => self.skipped.push(group_id),
            GroupCascadeResult::Failed => self.failed.push(group_id),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Pushes an owner's tier onto every group they own. Each group is written
/// with a conditional update on `applied_tier_version`, so a job that arrives
/// after a newer one is a no-op for that group.
#[derive(Clone)]
pub struct TierCascadePropagator {
    groups: Arc<dyn GroupRepository>,
    limits: TierLimits,
    retry: RetryPolicy,
    remediation: RemediationQueue,
}

impl TierCascadePropagator {
    pub fn new(
        groups: Arc<dyn GroupRepository>,
        limits: TierLimits,
        retry: RetryPolicy,
        remediation: RemediationQueue,
    ) -> Self {
        Self {
            groups,
            limits,
            retry,
            remediation,
        }
    }

    pub fn limits(&self) -> &TierLimits {
        &self.limits
    }

    /// Runs one job across all of the owner's groups in parallel. A failing
    /// group does not stop the others. If the groups cannot be listed the
    /// whole account is queued for remediation.
    pub async fn run(&self, job: CascadeJob) -> Result<CascadeReport, EngineError> {
        let groups = match self.groups.list_groups_for_owner(job.account_id).await {
            Ok(groups) => groups,
            Err(err) => {
                self.remediation.push_account(job.account_id, job.tier_version);
                return Err(err.into());
            }
        };
        let mut report = CascadeReport::new(job);

        let mut handles = Vec::with_capacity(groups.len());
        for group in groups {
            let propagator = self.clone();
            let group_id = group.id;
            let handle =
                tokio::spawn(async move { propagator.apply_to_group(&group, job).await });
            handles.push((group_id, handle));
        }

        for (group_id, handle) in handles {
            match handle.await {
                Ok(result) => report.record(group_id, result),
                Err(join_err) => {
                    error!(%group_id, ?join_err, "cascade task aborted");
                    self.remediation.push(group_id, job.tier_version);
                    report.record(group_id, GroupCascadeResult::Failed);
                }
            }
        }

        if report.is_complete() {
            info!(
                account_id = %job.account_id,
                tier = %job.tier,
                tier_version = job.tier_version,
                applied = report.applied.len(),
                skipped = report.skipped.len(),
                "tier cascade finished"
            );
        } else {
            warn!(
                account_id = %job.account_id,
                tier_version = job.tier_version,
                failed = report.failed.len(),
                "tier cascade finished with failures"
            );
        }
        Ok(report)
    }

    pub async fn apply_to_group(&self, group: &Group, job: CascadeJob) -> GroupCascadeResult {
        if group.applied_tier_version >= job.tier_version {
            debug!(
                group_id = %group.id,
                applied = group.applied_tier_version,
                incoming = job.tier_version,
                "group already at or past this tier version"
            );
            return GroupCascadeResult::Skipped;
        }

        let group_id = group.id;
        let projection = self.limits.projection(job.tier);
        let outcome = retry_with_backoff(
            &self.retry,
            |_: &sqlx::Error| true,
            || {
                let groups = Arc::clone(&self.groups);
                async move {
                    groups
                        .apply_tier_projection(group_id, projection, job.tier_version)
                        .await
                }
            },
        )
        .await;

        match outcome {
            Ok(true) => GroupCascadeResult::Applied,
            Ok(false) => GroupCascadeResult::Skipped,
            Err(err) => {
                error!(
                    %group_id,
                    account_id = %job.account_id,
                    tier_version = job.tier_version,
                    ?err,
                    "tier cascade write failed, queued for remediation"
                );
                self.remediation.push(group_id, job.tier_version);
                GroupCascadeResult::Failed
            }
        }
    }
}

/// Records jobs instead of running them.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingScheduler {
    pub jobs: std::sync::Mutex<Vec<CascadeJob>>,
}

#[cfg(test)]
impl RecordingScheduler {
    pub fn jobs(&self) -> Vec<CascadeJob> {
        self.jobs.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl CascadeScheduler for RecordingScheduler {
    fn enqueue(&self, job: CascadeJob) -> Result<(), EngineError> {
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}
