pub mod aggregate;
pub mod checkin;
pub mod filter;
pub mod keys;
pub mod metrics;
pub mod mock;
pub mod redis;
pub mod retry;
pub mod store;
