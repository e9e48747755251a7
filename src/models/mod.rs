pub mod account;
pub mod billing_event;
pub mod group;
pub mod membership;
pub mod usage;
