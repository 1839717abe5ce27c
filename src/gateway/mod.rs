//! Gateway module - Circuit breaking, rate limiting, health checking, and routing

pub mod circuit_breaker;
pub mod health_check;
pub mod rate_limit;
pub mod router;
