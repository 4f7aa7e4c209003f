#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Streamline Transactions
//!
//! The transactional messaging core of a Streamline broker. A producer
//! publishes several messages and a consumer acknowledges several messages
//! as one atomic unit; commit or abort applies consistently to every topic
//! and subscription the transaction touched, survives crashes and topic
//! reloads, and is driven by a partitioned transaction coordinator.
//!
//! ## Components
//!
//! - **Transaction coordinator** ([`transaction`]): allocates transaction
//!   ids, logs every status change and tells participants the outcome.
//! - **Transaction buffer** ([`buffer`]): hides uncommitted messages of a
//!   topic from readers and snapshots its state for fast recovery.
//! - **Pending-ack store** ([`pending_ack`]): keeps transactional
//!   acknowledgments away from the subscription cursor until commit.
//! - **Broker glue** ([`broker`], [`topic`]): topic and subscription
//!   registries, load and unload, and the publish/acknowledge entry points.
//! - **Storage** ([`storage`]): managed ledgers in memory or in CRC-framed
//!   segment files.
//!
//! ## Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use streamline_txn::{BrokerConfig, BrokerService, PublishContext, Result, TopicName};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let broker = BrokerService::start(BrokerConfig::in_memory()).await?;
//!     let topic = broker
//!         .get_or_create_topic(&TopicName::parse("persistent://acme/orders/created")?)
//!         .await?;
//!
//!     let txn = broker.new_transaction(None).await?;
//!     topic
//!         .publish_txn_message(txn, PublishContext::single("p1", 0), Bytes::from("order-1"))
//!         .await
//!         .map_err(|f| f.into_error())?;
//!     broker.commit_transaction(txn).await?;
//!
//!     broker.close().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod buffer;
pub mod config;
pub mod error;
pub mod logging;
pub mod naming;
pub mod pending_ack;
pub mod storage;
pub mod testing;
pub mod topic;
pub mod transaction;

pub use broker::BrokerService;
pub use config::BrokerConfig;
pub use error::{LedgerError, Result, ServerErrorCode, StreamlineError};
pub use naming::{NamespaceName, TopicName};
pub use pending_ack::AckKind;
pub use storage::{Position, RetentionPolicy};
pub use topic::{
    PersistentSubscription, PersistentTopic, PublishContext, PublishFailure, PublishReceipt,
};
pub use transaction::{TxnAction, TxnId, TxnParticipant, TxnStatus};
