use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Event kinds the subscription state machine reacts to. Anything else is
/// carried through as `Unknown` and ignored after logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEventType {
    CheckoutCompleted,
    SubscriptionUpdated,
    SubscriptionDeleted,
    Unknown(String),
}

impl BillingEventType {
    /// Accepts both the short names and the processor's dotted names.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "checkout_completed" | "checkout.session.completed" => Self::CheckoutCompleted,
            "subscription_updated" | "customer.subscription.updated" => Self::SubscriptionUpdated,
            "subscription_deleted" | "customer.subscription.deleted" => Self::SubscriptionDeleted,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::CheckoutCompleted => "checkout_completed",
            Self::SubscriptionUpdated => "subscription_updated",
            Self::SubscriptionDeleted => "subscription_deleted",
            Self::Unknown(raw) => raw.as_str(),
        }
    }
}

/// Event envelope as delivered by the payment processor. The signature travels
/// separately (a request header) and is checked against the raw body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEventEnvelope {
    pub external_id: String,
    pub account_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
}

impl BillingEventEnvelope {
    pub fn kind(&self) -> BillingEventType {
        BillingEventType::parse(&self.event_type)
    }
}

/// Row in the idempotency ledger.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingEventRecord {
    pub external_id: String,
    pub account_id: Uuid,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub claimed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub applied_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewBillingEvent {
    pub external_id: String,
    pub account_id: Uuid,
    pub event_type: String,
    pub observed_at: OffsetDateTime,
}
