//! Per-name retention policies
//!
//! Policies are keyed by logical topic name. Internal stores (pending-ack
//! ledgers, the transaction log, buffer snapshots) are addressed by the same
//! kind of name, so a policy can target them exactly like an ordinary topic.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Retention of a ledger's data after it has been consumed
///
/// `-1` means unlimited for either dimension, `0` means no retention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub retention_time_minutes: i64,
    pub retention_size_mb: i64,
}

impl RetentionPolicy {
    pub const INFINITE: RetentionPolicy = RetentionPolicy::new(-1, -1);

    pub const fn new(retention_time_minutes: i64, retention_size_mb: i64) -> Self {
        Self {
            retention_time_minutes,
            retention_size_mb,
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.retention_time_minutes < 0 && self.retention_size_mb < 0
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}min/{}MB",
            self.retention_time_minutes, self.retention_size_mb
        )
    }
}

/// Broker-wide policy table
#[derive(Debug, Default)]
pub struct TopicPolicies {
    retention: DashMap<String, RetentionPolicy>,
}

impl TopicPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_retention(&self, name: &str, policy: RetentionPolicy) {
        self.retention.insert(name.to_string(), policy);
    }

    pub fn get_retention(&self, name: &str) -> Option<RetentionPolicy> {
        self.retention.get(name).map(|p| *p)
    }

    pub fn remove_retention(&self, name: &str) -> Option<RetentionPolicy> {
        self.retention.remove(name).map(|(_, p)| p)
    }
}
