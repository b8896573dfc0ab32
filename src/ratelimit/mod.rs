//! Rate limiting logic and shared state stores.

mod backend;
mod clock;
mod gcra;
mod key;
mod limiter;
mod memory;
mod redis_store;

pub use backend::{StoreError, TatStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use gcra::{evaluate, period_nanos, Evaluation, StoreReply, GCRA_SCRIPT};
pub use key::{RateLimitKey, IP_NAMESPACE};
pub use limiter::{Decision, RateLimiter};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
