//! Failed-login tracking with escalating account lockout.
//!
//! Failures are counted per `(identifier, ip)` pair. Reaching the attempt
//! threshold inside the lookback window locks the pair out; every further
//! lockout within the quiet period lasts longer than the previous one.
//!
//! Callers must treat unknown identifiers exactly like known ones: check the
//! lockout first, then record a failure for every failed verification,
//! whether or not the account exists. Every result type here has the same
//! shape regardless of account existence, so nothing in the data tells the
//! two cases apart.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::key::{login_key, mask_identifier, normalize_identifier};
use super::store::WindowEntry;
use crate::clock::Clock;
use crate::error::{GatekeeperError, Result};

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// Lockout timing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutPolicy {
    /// Failures within the lookback window that trigger a lockout
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Width of the failure counting window
    #[serde(default = "default_lookback_window_ms")]
    pub lookback_window_ms: u64,

    /// Duration of the first lockout
    #[serde(default = "default_base_lockout_ms")]
    pub base_lockout_ms: u64,

    /// Largest multiple of the base duration a lockout can reach
    #[serde(default = "default_escalation_cap")]
    pub escalation_cap: u32,

    /// Failure-free time after which escalation history is forgotten
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            lookback_window_ms: default_lookback_window_ms(),
            base_lockout_ms: default_base_lockout_ms(),
            escalation_cap: default_escalation_cap(),
            quiet_period_ms: default_quiet_period_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_lookback_window_ms() -> u64 {
    15 * MINUTE_MS
}

fn default_base_lockout_ms() -> u64 {
    15 * MINUTE_MS
}

fn default_escalation_cap() -> u32 {
    8
}

fn default_quiet_period_ms() -> u64 {
    24 * HOUR_MS
}

impl LockoutPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(GatekeeperError::Config(
                "login throttle: max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.lookback_window_ms == 0 || self.base_lockout_ms == 0 {
            return Err(GatekeeperError::Config(
                "login throttle: lookback_window_ms and base_lockout_ms must be greater than 0"
                    .to_string(),
            ));
        }
        if self.escalation_cap == 0 {
            return Err(GatekeeperError::Config(
                "login throttle: escalation_cap must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Lockout length after `prior_lockouts` earlier lockouts.
    ///
    /// `base * min(prior_lockouts + 1, escalation_cap)`.
    pub fn lockout_duration(&self, prior_lockouts: u32) -> u64 {
        let multiplier = prior_lockouts.saturating_add(1).min(self.escalation_cap);
        self.base_lockout_ms.saturating_mul(multiplier as u64)
    }
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailedAttempt {
    /// Failures left before the next lockout (0 once locked)
    pub remaining_attempts: u32,
    /// Whether the key is locked after this call
    pub is_locked: bool,
    /// Lockout length if this call triggered one, otherwise the time left on
    /// an existing lockout, otherwise 0
    pub lockout_ms: u64,
}

/// Whether an authentication attempt may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginDecision {
    Allowed,
    LockedOut { remaining_ms: u64 },
}

impl LoginDecision {
    pub fn is_locked(&self) -> bool {
        matches!(self, LoginDecision::LockedOut { .. })
    }

    /// Remaining lockout in whole minutes, rounded up, for user messages.
    pub fn remaining_minutes(&self) -> u64 {
        match self {
            LoginDecision::Allowed => 0,
            LoginDecision::LockedOut { remaining_ms } => remaining_ms.div_ceil(MINUTE_MS),
        }
    }
}

#[derive(Debug, Clone)]
struct LoginEntry {
    failures: WindowEntry,
    locked_until: Option<u64>,
    lockout_count: u32,
    last_failure: u64,
}

impl LoginEntry {
    fn new(now: u64) -> Self {
        Self {
            failures: WindowEntry::new(now),
            locked_until: None,
            lockout_count: 0,
            last_failure: now,
        }
    }

    /// Start of the current quiet stretch: the later of the last failure and
    /// the end of the last lockout.
    fn quiet_since(&self) -> u64 {
        self.last_failure.max(self.locked_until.unwrap_or(0))
    }

    fn is_quiet(&self, now: u64, quiet_period_ms: u64) -> bool {
        now.saturating_sub(self.quiet_since()) >= quiet_period_ms
    }

    fn remaining_lockout(&self, now: u64) -> u64 {
        self.locked_until
            .map(|until| until.saturating_sub(now))
            .unwrap_or(0)
    }
}

/// Per-`(identifier, ip)` failed login tracker.
pub struct LoginThrottle {
    entries: DashMap<String, LoginEntry>,
    policy: LockoutPolicy,
    clock: Arc<dyn Clock>,
}

impl LoginThrottle {
    /// Create a throttle, validating its policy.
    pub fn new(policy: LockoutPolicy, clock: Arc<dyn Clock>) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            entries: DashMap::new(),
            policy,
            clock,
        })
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    /// True iff the pair has a lockout deadline in the future.
    pub fn is_locked_out(&self, identifier: &str, ip: &str) -> bool {
        self.remaining_lockout_ms(identifier, ip) > 0
    }

    /// Milliseconds left on the pair's lockout, 0 if not locked.
    pub fn remaining_lockout_ms(&self, identifier: &str, ip: &str) -> u64 {
        let now = self.clock.now_ms();
        self.entries
            .get(&login_key(identifier, ip))
            .map(|entry| entry.remaining_lockout(now))
            .unwrap_or(0)
    }

    /// Lockout status as a single decision, for use before verification.
    pub fn check(&self, identifier: &str, ip: &str) -> LoginDecision {
        match self.remaining_lockout_ms(identifier, ip) {
            0 => LoginDecision::Allowed,
            remaining_ms => LoginDecision::LockedOut { remaining_ms },
        }
    }

    /// Record a failed verification and lock the pair out if it reached the
    /// threshold.
    ///
    /// Counting and the lockout write happen under one shard lock, so
    /// concurrent failures cannot both trigger a lockout.
    pub fn record_failed_attempt(&self, identifier: &str, ip: &str) -> FailedAttempt {
        let now = self.clock.now_ms();
        let key = login_key(identifier, ip);
        let mut entry = self
            .entries
            .entry(key)
            .or_insert_with(|| LoginEntry::new(now));

        let remaining = entry.remaining_lockout(now);
        if remaining > 0 {
            entry.last_failure = now;
            trace!("Failure recorded while locked out, lockout unchanged");
            return FailedAttempt {
                remaining_attempts: 0,
                is_locked: true,
                lockout_ms: remaining,
            };
        }

        if entry.lockout_count > 0 && entry.is_quiet(now, self.policy.quiet_period_ms) {
            debug!(
                prior_lockouts = entry.lockout_count,
                "Quiet period elapsed, escalation history cleared"
            );
            entry.lockout_count = 0;
        }

        if entry.locked_until.take().is_some() {
            // An expired lockout starts a fresh count
            entry.failures.clear();
        }

        entry.last_failure = now;
        entry.failures.trim(now, self.policy.lookback_window_ms);
        entry.failures.push(now);

        let failures = entry.failures.len() as u32;
        if failures < self.policy.max_attempts {
            debug!(
                failures,
                max_attempts = self.policy.max_attempts,
                "Failed login attempt recorded"
            );
            return FailedAttempt {
                remaining_attempts: self.policy.max_attempts - failures,
                is_locked: false,
                lockout_ms: 0,
            };
        }

        let lockout_ms = self.policy.lockout_duration(entry.lockout_count);
        entry.locked_until = Some(now.saturating_add(lockout_ms));
        entry.lockout_count += 1;
        entry.failures.clear();

        warn!(
            identifier = %mask_identifier(&normalize_identifier(identifier)),
            ip = %ip,
            lockout_ms,
            lockout_count = entry.lockout_count,
            "Too many failed login attempts, locking out"
        );

        FailedAttempt {
            remaining_attempts: 0,
            is_locked: true,
            lockout_ms,
        }
    }

    /// Forget everything about the pair (successful authentication, manual
    /// unlock).
    pub fn clear_attempts(&self, identifier: &str, ip: &str) {
        self.entries.remove(&login_key(identifier, ip));
    }

    /// Drop pairs that are unlocked, have no recent failures and no
    /// escalation history worth keeping. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut evicted = 0;

        self.entries.retain(|_, entry| {
            if entry.remaining_lockout(now) > 0 {
                return true;
            }

            entry.failures.trim(now, self.policy.lookback_window_ms);
            let quiet = entry.is_quiet(now, self.policy.quiet_period_ms);
            let keep = !entry.failures.is_empty() || (entry.lockout_count > 0 && !quiet);
            if !keep {
                evicted += 1;
            }
            keep
        });

        evicted
    }

    /// Number of tracked pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for LoginThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginThrottle")
            .field("policy", &self.policy)
            .field("entries", &self.entries.len())
            .finish()
    }
}
