//! Topics and subscriptions
//!
//! - `persistent` - Topic with its ledger and transaction buffer
//! - `subscription` - Subscription with its cursor and pending acks
//! - `cursor` - Acknowledgment state of a subscription
//! - `registry` - Loaded and known topics of a broker

pub mod cursor;
pub mod persistent;
pub mod registry;
pub mod subscription;

pub use cursor::SubscriptionCursor;
pub use persistent::{
    PersistentTopic, PublishContext, PublishFailure, PublishReceipt, PublishResult,
};
pub use registry::TopicRegistry;
pub use subscription::PersistentSubscription;

use std::sync::Arc;

use crate::config::{StorageConfig, TransactionConfig};
use crate::storage::{ManagedLedgerFactory, TopicPolicies};
use crate::transaction::TransactionMetadataStoreService;

/// Broker services shared by every topic
pub(crate) struct TopicContext {
    pub(crate) factory: Arc<dyn ManagedLedgerFactory>,
    pub(crate) policies: Arc<TopicPolicies>,
    pub(crate) coordinators: Arc<TransactionMetadataStoreService>,
    pub(crate) storage: StorageConfig,
    pub(crate) transaction: TransactionConfig,
}
