use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::account_repository::AccountRepository;
use crate::engine::cascade::{CascadeJob, CascadeScheduler, RemediationQueue};
use crate::engine::error::{EngineError, RejectionReason};
use crate::engine::retry::RetryPolicy;
use crate::models::account::{BillingRefs, Tier};
use crate::models::billing_event::BillingEventType;

// Nested json lookup
fn jget<'a>(val: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = val;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

// Processor objects arrive either bare or wrapped in `data.object`.
fn object_field<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    payload
        .get(key)
        .or_else(|| jget(payload, &["data", "object", key]))
        .filter(|v| !v.is_null())
}

fn extract_str(payload: &Value, key: &str) -> Option<String> {
    object_field(payload, key)?.as_str().map(|s| s.to_string())
}

fn extract_i64(payload: &Value, key: &str) -> Option<i64> {
    object_field(payload, key)?.as_i64()
}

/// A billing event reduced to what the state machine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTrigger {
    CheckoutCompleted {
        customer_ref: Option<String>,
        subscription_ref: Option<String>,
    },
    SubscriptionUpdated {
        status: String,
        trial_active: bool,
        customer_ref: Option<String>,
        subscription_ref: Option<String>,
    },
    SubscriptionDeleted,
}

impl SubscriptionTrigger {
    /// `Ok(None)` for event types the engine does not react to.
    pub fn from_event(
        kind: &BillingEventType,
        payload: &Value,
        observed_at: OffsetDateTime,
    ) -> Result<Option<Self>, RejectionReason> {
        let trigger = match kind {
            BillingEventType::CheckoutCompleted => SubscriptionTrigger::CheckoutCompleted {
                customer_ref: extract_str(payload, "customer"),
                subscription_ref: extract_str(payload, "subscription"),
            },
            BillingEventType::SubscriptionUpdated => {
                let status = extract_str(payload, "status").ok_or_else(|| {
                    RejectionReason::Malformed("subscription_updated without status".into())
                })?;
                let trial_active = extract_i64(payload, "trial_end")
                    .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
                    .is_some_and(|trial_end| trial_end > observed_at);
                SubscriptionTrigger::SubscriptionUpdated {
                    status: status.to_lowercase(),
                    trial_active,
                    customer_ref: extract_str(payload, "customer"),
                    // Subscription objects carry their own id.
                    subscription_ref: extract_str(payload, "subscription")
                        .or_else(|| extract_str(payload, "id")),
                }
            }
            BillingEventType::SubscriptionDeleted => SubscriptionTrigger::SubscriptionDeleted,
            BillingEventType::Unknown(_) => return Ok(None),
        };
        Ok(Some(trigger))
    }

    /// Tier this trigger leads to, or `None` when it should leave the
    /// account alone.
    pub fn target_tier(&self) -> Option<Tier> {
        match self {
            SubscriptionTrigger::CheckoutCompleted { .. } => Some(Tier::Premium),
            SubscriptionTrigger::SubscriptionUpdated {
                status,
                trial_active,
                ..
            } => match status.as_str() {
                "trialing" => Some(Tier::Trial),
                "active" if *trial_active => Some(Tier::Trial),
                "active" => Some(Tier::Premium),
                "canceled" | "unpaid" | "past_due" => Some(Tier::Canceled),
                _ => None,
            },
            SubscriptionTrigger::SubscriptionDeleted => Some(Tier::Free),
        }
    }

    fn billing_refs(&self) -> BillingRefs<'_> {
        match self {
            SubscriptionTrigger::CheckoutCompleted {
                customer_ref,
                subscription_ref,
            }
            | SubscriptionTrigger::SubscriptionUpdated {
                customer_ref,
                subscription_ref,
                ..
            } => BillingRefs {
                customer: customer_ref.as_deref(),
                subscription: subscription_ref.as_deref(),
            },
            SubscriptionTrigger::SubscriptionDeleted => BillingRefs::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Transitioned {
        from: Tier,
        to: Tier,
        tier_version: i64,
        /// `false` when the cascade job could not be queued; the auditor
        /// picks up the lagging groups.
        cascade_enqueued: bool,
    },
    /// The account already has the target tier.
    Unchanged { tier: Tier, tier_version: i64 },
    /// The trigger maps to no tier (for example an `incomplete` status).
    Ignored,
}

/// Versioned tier transitions. Every write is a CAS on `tier_version`, and
/// a lost race re-reads the account before trying again, so the final tier
/// is decided by whichever transition commits last. Billing refs ride on
/// the same CAS, so a late delivery cannot overwrite newer ones.
#[derive(Clone)]
pub struct SubscriptionStateMachine {
    accounts: Arc<dyn AccountRepository>,
    cascades: Arc<dyn CascadeScheduler>,
    remediation: RemediationQueue,
    retry: RetryPolicy,
}

impl SubscriptionStateMachine {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        cascades: Arc<dyn CascadeScheduler>,
        remediation: RemediationQueue,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            accounts,
            cascades,
            remediation,
            retry,
        }
    }

    pub async fn apply(
        &self,
        account_id: Uuid,
        trigger: &SubscriptionTrigger,
    ) -> Result<TransitionOutcome, EngineError> {
        let Some(target) = trigger.target_tier() else {
            info!(%account_id, ?trigger, "subscription trigger has no tier effect");
            return Ok(TransitionOutcome::Ignored);
        };

        let attempts = self.retry.attempts();
        for attempt in 0..attempts {
            let account = self
                .accounts
                .find_account(account_id)
                .await?
                .ok_or_else(|| EngineError::not_found("account", account_id))?;

            if account.tier == target {
                debug!(%account_id, tier = %target, "account already at target tier");
                return Ok(TransitionOutcome::Unchanged {
                    tier: account.tier,
                    tier_version: account.tier_version,
                });
            }

            let Some(updated) = self
                .accounts
                .compare_and_swap_tier(account_id, account.tier_version, target, trigger.billing_refs())
                .await?
            else {
                debug!(
                    %account_id,
                    expected_version = account.tier_version,
                    attempt = attempt + 1,
                    "tier version moved, retrying transition"
                );
                self.retry.pause(attempt).await;
                continue;
            };

            info!(
                %account_id,
                from = %account.tier,
                to = %updated.tier,
                tier_version = updated.tier_version,
                "account tier transitioned"
            );

            let job = CascadeJob {
                account_id,
                tier: updated.tier,
                tier_version: updated.tier_version,
            };
            let cascade_enqueued = match self.cascades.enqueue(job) {
                Ok(()) => true,
                Err(err) => {
                    error!(?err, %account_id, tier_version = job.tier_version, "failed to enqueue tier cascade, queued for remediation");
                    self.remediation.push_account(account_id, job.tier_version);
                    false
                }
            };

            return Ok(TransitionOutcome::Transitioned {
                from: account.tier,
                to: updated.tier,
                tier_version: updated.tier_version,
                cascade_enqueued,
            });
        }

        warn!(%account_id, attempts, "tier transition gave up after repeated conflicts");
        Err(EngineError::CasExhausted(format!("account {account_id}")))
    }
}
