//! Request throttling: sliding-window rate limiting and login lockout.

mod key;
mod limiter;
mod login;
mod rules;
mod store;
mod sweeper;

pub use key::{
    login_key, normalize_identifier, skip_paths, KeyFn, KeyStrategy, RequestInfo, SkipFn,
    UNKNOWN_CLIENT,
};
pub use limiter::{Preset, RateLimitDecision, RateLimiter, RateLimiterConfig};
pub use login::{FailedAttempt, LockoutPolicy, LoginDecision, LoginThrottle};
pub use rules::LimiterRules;
pub use store::{Admission, WindowCounterStore, WindowEntry};
pub use sweeper::{Sweeper, SweeperBuilder};
