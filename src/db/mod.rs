pub mod account_repository;
pub mod billing_event_repository;
pub mod group_repository;
pub mod membership_repository;
pub mod mock_db;
pub mod postgres_account_repository;
pub mod postgres_billing_event_repository;
pub mod postgres_group_repository;
pub mod postgres_membership_repository;
pub mod postgres_usage_counter_repository;
pub mod usage_counter_repository;
