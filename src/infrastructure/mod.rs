pub mod auth;
pub mod gateway;
pub mod persistence;
pub mod rate_limiter;
pub mod streaming;
