use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::engine::auditor::ReconciliationAuditor;
use crate::engine::cascade::{CascadeJob, TierCascadePropagator};
use crate::state::AppState;

pub async fn start_background_workers(
    state: AppState,
    jobs: UnboundedReceiver<CascadeJob>,
    audit_interval: Duration,
) {
    spawn_cascade_worker(state.engine.cascade.clone(), jobs);
    spawn_audit_sweeper(state.engine.auditor.clone(), audit_interval);
    info!(?audit_interval, "background workers started");
}

/// Runs each queued cascade on its own task. Jobs for the same account may
/// overlap; the per-group version guard keeps the newest projection.
pub fn spawn_cascade_worker(
    propagator: TierCascadePropagator,
    mut jobs: UnboundedReceiver<CascadeJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let propagator = propagator.clone();
            tokio::spawn(async move {
                match propagator.run(job).await {
                    Ok(report) if !report.is_complete() => {
                        warn!(
                            account_id = %job.account_id,
                            failed = report.failed.len(),
                            "cascade left groups for remediation"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        // Listing failed; the account is queued for the next sweep.
                        error!(?err, account_id = %job.account_id, "cascade job failed");
                    }
                }
            });
        }
        info!("cascade queue closed, worker exiting");
    })
}

/// Drains the remediation queue every `period`.
pub fn spawn_audit_sweeper(auditor: ReconciliationAuditor, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = auditor.sweep().await;
            if report.groups_checked > 0 {
                info!(
                    groups = report.groups_checked,
                    findings = report.findings.len(),
                    uncorrected = report.uncorrected(),
                    "remediation sweep finished"
                );
            } else {
                debug!("remediation sweep found nothing to do");
            }
        }
    })
}
