//! Lease primitives.

use crate::id::{LockId, TaskId};
use crate::Time;
use serde::{Deserialize, Serialize};

/// A granted, time-bounded exclusive right over a resource.
///
/// Tokens never carry an "expired" flag: validity is always computed by
/// comparing `expires_at` against the injected clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    /// Unique identifier of this grant
    pub lock_id: LockId,

    /// Task the lease was taken for
    pub task_id: TaskId,

    /// Locked resource
    pub resource_key: String,

    /// Who holds the lease
    pub holder: String,

    /// When the lease was first granted
    pub acquired_at: Time,

    /// When the lease stops being valid
    pub expires_at: Time,
}

impl LockToken {
    /// True once `now >= expires_at`.
    pub fn is_expired_at(&self, now: Time) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, zero if already expired.
    pub fn remaining(&self, now: Time) -> chrono::Duration {
        if self.is_expired_at(now) {
            chrono::Duration::zero()
        } else {
            self.expires_at - now
        }
    }
}

/// Stored state of one resource key.
///
/// `version` increases on every mutation, including release, and is the
/// guard used for compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Resource this record guards
    pub resource_key: String,

    /// Last granted token, `None` after release or reclaim
    pub current: Option<LockToken>,

    /// Monotonic mutation counter
    pub version: u64,
}

impl LockRecord {
    /// The current token if it is still valid at `now`.
    pub fn live_token(&self, now: Time) -> Option<&LockToken> {
        self.current.as_ref().filter(|t| !t.is_expired_at(now))
    }

    /// The current token if it has expired at `now`.
    pub fn expired_token(&self, now: Time) -> Option<&LockToken> {
        self.current.as_ref().filter(|t| t.is_expired_at(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_at: Time) -> LockToken {
        LockToken {
            lock_id: LockId::new(),
            task_id: TaskId::new(),
            resource_key: "repo:42".to_string(),
            holder: "w1".to_string(),
            acquired_at: expires_at - chrono::Duration::seconds(60),
            expires_at,
        }
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let t = chrono::Utc::now();
        let tok = token(t);
        let eps = chrono::Duration::milliseconds(1);
        assert!(!tok.is_expired_at(t - eps));
        assert!(tok.is_expired_at(t));
        assert!(tok.is_expired_at(t + eps));
    }

    #[test]
    fn test_remaining_saturates_at_zero() {
        let t = chrono::Utc::now();
        let tok = token(t);
        assert_eq!(tok.remaining(t + chrono::Duration::seconds(5)), chrono::Duration::zero());
        assert_eq!(tok.remaining(t - chrono::Duration::seconds(5)), chrono::Duration::seconds(5));
    }

    #[test]
    fn test_record_live_and_expired_views() {
        let t = chrono::Utc::now();
        let record = LockRecord {
            resource_key: "repo:42".to_string(),
            current: Some(token(t)),
            version: 3,
        };
        assert!(record.live_token(t - chrono::Duration::seconds(1)).is_some());
        assert!(record.expired_token(t - chrono::Duration::seconds(1)).is_none());
        assert!(record.live_token(t).is_none());
        assert!(record.expired_token(t).is_some());
    }
}
