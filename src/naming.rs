//! Topic names and the names of the internal stores derived from them
//!
//! A topic is addressed as `persistent://tenant/namespace/local`. Its ledger
//! is stored as `tenant/namespace/persistent/local`. Internal stores follow
//! fixed naming rules:
//!
//! | Store | Name |
//! |-------|------|
//! | Transaction log of partition `p` | `persistent://pulsar/system/__transaction_log_{p}` |
//! | Coordinator assignment partition `p` | `persistent://pulsar/system/transaction_coordinator_assign-partition-{p}` |
//! | Pending acks of `sub` on `topic` | `{topic}-{sub}__transaction_pending_ack` |
//! | Buffer snapshots of a namespace | `persistent://{tenant}/{ns}/__transaction_buffer_snapshot` |

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StreamlineError};

const PERSISTENT_SCHEME: &str = "persistent://";

/// Tenant of the broker's own system namespace
pub const SYSTEM_TENANT: &str = "pulsar";

/// Namespace holding coordinator state
pub const SYSTEM_NAMESPACE: &str = "pulsar/system";

const TRANSACTION_LOG_PREFIX: &str = "__transaction_log_";
const COORDINATOR_ASSIGN_TOPIC: &str = "transaction_coordinator_assign";
const PARTITION_SUFFIX: &str = "-partition-";
const PENDING_ACK_SUFFIX: &str = "__transaction_pending_ack";
const BUFFER_SNAPSHOT_TOPIC: &str = "__transaction_buffer_snapshot";

/// A `tenant/namespace` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceName {
    tenant: String,
    namespace: String,
}

impl NamespaceName {
    pub fn new(tenant: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            namespace: namespace.into(),
        }
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_TENANT, "system")
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_system(&self) -> bool {
        self.tenant == SYSTEM_TENANT && self.namespace == "system"
    }

    /// The namespace's buffer snapshot topic
    pub fn buffer_snapshot_topic(&self) -> TopicName {
        TopicName::new(self.clone(), BUFFER_SNAPSHOT_TOPIC)
    }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.namespace)
    }
}

impl FromStr for NamespaceName {
    type Err = StreamlineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((tenant, ns)) if !tenant.is_empty() && !ns.is_empty() && !ns.contains('/') => {
                Ok(Self::new(tenant, ns))
            }
            _ => Err(StreamlineError::InvalidTopicName(format!(
                "invalid namespace '{}'",
                s
            ))),
        }
    }
}

/// Fully qualified persistent topic name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicName {
    namespace: NamespaceName,
    local: String,
}

impl TopicName {
    pub fn new(namespace: NamespaceName, local: impl Into<String>) -> Self {
        Self {
            namespace,
            local: local.into(),
        }
    }

    /// Parse `persistent://tenant/ns/topic`
    pub fn parse(name: &str) -> Result<Self> {
        name.parse()
    }

    /// Transaction log ledger of a coordinator partition
    pub fn transaction_log(partition: u64) -> Self {
        Self::new(
            NamespaceName::system(),
            format!("{}{}", TRANSACTION_LOG_PREFIX, partition),
        )
    }

    /// Partition `partition` of the coordinator assignment topic
    pub fn coordinator_assign(partition: u64) -> Self {
        Self::new(
            NamespaceName::system(),
            format!("{}{}{}", COORDINATOR_ASSIGN_TOPIC, PARTITION_SUFFIX, partition),
        )
    }

    /// Pending-ack store of `subscription` on this topic
    pub fn pending_ack_store(&self, subscription: &str) -> Self {
        Self::new(
            self.namespace.clone(),
            format!("{}-{}{}", self.local, subscription, PENDING_ACK_SUFFIX),
        )
    }

    pub fn namespace(&self) -> &NamespaceName {
        &self.namespace
    }

    pub fn local_name(&self) -> &str {
        &self.local
    }

    /// Storage name of the topic's ledger
    pub fn persistence_name(&self) -> String {
        format!(
            "{}/{}/persistent/{}",
            self.namespace.tenant, self.namespace.namespace, self.local
        )
    }

    /// Whether this names one of the internal transaction stores
    pub fn is_internal(&self) -> bool {
        self.local.starts_with(TRANSACTION_LOG_PREFIX)
            || self.local.ends_with(PENDING_ACK_SUFFIX)
            || self.local == BUFFER_SNAPSHOT_TOPIC
    }

    pub fn is_pending_ack_store(&self) -> bool {
        self.local.ends_with(PENDING_ACK_SUFFIX)
    }

    /// Partition index for `-partition-N` topics
    pub fn partition_index(&self) -> Option<u64> {
        self.local
            .rsplit_once(PARTITION_SUFFIX)
            .and_then(|(_, idx)| idx.parse().ok())
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", PERSISTENT_SCHEME, self.namespace, self.local)
    }
}

impl FromStr for TopicName {
    type Err = StreamlineError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix(PERSISTENT_SCHEME).ok_or_else(|| {
            StreamlineError::InvalidTopicName(format!("'{}' is not a persistent topic", s))
        })?;
        let mut parts = rest.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(tenant), Some(ns), Some(local))
                if !tenant.is_empty() && !ns.is_empty() && !local.is_empty() =>
            {
                Ok(Self::new(NamespaceName::new(tenant, ns), local))
            }
            _ => Err(StreamlineError::InvalidTopicName(format!(
                "'{}' is not of the form persistent://tenant/namespace/topic",
                s
            ))),
        }
    }
}
