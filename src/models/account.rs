use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use time::OffsetDateTime;
use uuid::Uuid;

/// Subscription level of an account. Every limit a group enforces is derived
/// from its owner's tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "account_tier")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Trial,
    Premium,
    Canceled,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Trial => "trial",
            Tier::Premium => "premium",
            Tier::Canceled => "canceled",
        }
    }

    pub fn is_premium(self) -> bool {
        matches!(self, Tier::Premium)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processor-side identifiers carried by a billing event. `None` keeps the
/// stored value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BillingRefs<'a> {
    pub customer: Option<&'a str>,
    pub subscription: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub tier: Tier,
    /// Advanced by one on every accepted tier transition.
    pub tier_version: i64,
    pub billing_customer_ref: Option<String>,
    pub billing_subscription_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
