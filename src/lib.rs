//! PNCP request governance
//!
//! Sliding-window rate limiting with a Redis ledger and an in-process
//! fallback, a fail-soft typed cache with pattern invalidation, and a
//! long-TTL cache of procurement reference tables.

pub mod backend;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod fallback;
pub mod identity;
pub mod invalidation;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod redis;
pub mod service;
pub mod utils;
pub mod value;

// Re-export main types
pub use backend::{CacheBackend, InMemoryBackend};
pub use cache::{CacheKey, CacheService};
pub use config::GovernanceConfig;
pub use error::{GovernanceError, Result};
pub use identity::ClientId;
pub use invalidation::Entity;
pub use limiter::{Decision, LedgerBackend, RateLimiter};
pub use middleware::{governance_middleware, RateLimitRejection};
pub use service::GovernanceService;
pub use value::CacheValue;
