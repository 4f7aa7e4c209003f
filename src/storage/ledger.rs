//! Managed ledger abstraction
//!
//! A managed ledger is a named, append-only sequence of entries. Every open
//! of a name starts a new underlying ledger (a new `ledger_id`) on top of the
//! data retained from earlier ones, so positions order first by ledger id and
//! then by entry id. Entry ids restart at 0 in each ledger.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::policies::{RetentionPolicy, TopicPolicies};
use crate::error::LedgerError;

/// Location of an entry inside a managed ledger
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Position {
    pub ledger_id: i64,
    pub entry_id: i64,
}

impl Position {
    /// Sentinel placed before every real entry
    pub const EARLIEST: Position = Position {
        ledger_id: -1,
        entry_id: -1,
    };

    pub const fn new(ledger_id: i64, entry_id: i64) -> Self {
        Self {
            ledger_id,
            entry_id,
        }
    }

    /// The position directly after this one in the same ledger
    pub fn next(&self) -> Position {
        Position::new(self.ledger_id, self.entry_id + 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ledger_id, self.entry_id)
    }
}

/// An entry read back from a ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub position: Position,
    pub data: Bytes,
}

/// Per-ledger configuration
///
/// Retention is resolved on every read from the policy table, so a policy set
/// on the ledger's logical name after it was opened is visible immediately.
/// `fallback` applies while the name has no policy of its own.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    policies: Arc<TopicPolicies>,
    policy_name: String,
    fallback: RetentionPolicy,
}

impl LedgerConfig {
    pub fn new(
        policies: Arc<TopicPolicies>,
        policy_name: impl Into<String>,
        fallback: RetentionPolicy,
    ) -> Self {
        Self {
            policies,
            policy_name: policy_name.into(),
            fallback,
        }
    }

    /// Configuration backed by a private policy table
    pub fn standalone(policy_name: impl Into<String>) -> Self {
        Self::new(
            Arc::new(TopicPolicies::new()),
            policy_name,
            RetentionPolicy::default(),
        )
    }

    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.policies
            .get_retention(&self.policy_name)
            .unwrap_or(self.fallback)
    }

    pub fn set_retention(&self, policy: RetentionPolicy) {
        self.policies.set_retention(&self.policy_name, policy);
    }
}

/// A named append-only log
#[async_trait]
pub trait ManagedLedger: Send + Sync + fmt::Debug {
    /// Storage name of the ledger
    fn name(&self) -> &str;

    /// Id of the ledger currently accepting appends
    fn current_ledger_id(&self) -> i64;

    /// Append one entry; fails with `AlreadyClosed` after `close`
    async fn append(&self, data: Bytes) -> Result<Position, LedgerError>;

    /// Read up to `max` entries at or after `from`
    async fn read_entries(&self, from: Position, max: usize)
        -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Last appended entry, or `(current_ledger_id, -1)` when nothing was ever written
    fn last_confirmed_position(&self) -> Position;

    /// First retained entry, or `None` when the ledger holds no entries
    fn first_position(&self) -> Option<Position>;

    /// Number of retained entries
    fn entry_count(&self) -> u64;

    /// Drop every ledger older than `ledger_id`, never the current one
    async fn trim_ledgers_before(&self, ledger_id: i64) -> Result<u64, LedgerError>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), LedgerError>;

    fn config(&self) -> &LedgerConfig;
}

/// Opens managed ledgers by name
#[async_trait]
pub trait ManagedLedgerFactory: Send + Sync {
    /// Open or return the already open ledger for `name`
    ///
    /// Concurrent opens of the same name resolve to one instance.
    async fn open(
        &self,
        name: &str,
        config: LedgerConfig,
    ) -> Result<Arc<dyn ManagedLedger>, LedgerError>;

    /// Whether an open, not yet closed instance is cached for `name`
    fn is_open(&self, name: &str) -> bool;

    /// Remove the cached instance for `name` without closing it or touching storage
    fn evict(&self, name: &str) -> Option<Arc<dyn ManagedLedger>>;

    /// Whether storage holds data for `name`
    async fn exists(&self, name: &str) -> bool;

    /// Close and permanently remove `name`
    async fn delete(&self, name: &str) -> Result<(), LedgerError>;

    /// Close every cached ledger
    async fn close_all(&self);
}

type LedgerCell = Arc<OnceCell<Arc<dyn ManagedLedger>>>;

/// Cache of open ledgers with single-flight opening
#[derive(Default)]
pub(crate) struct OpenLedgers {
    cells: DashMap<String, LedgerCell>,
}

impl OpenLedgers {
    /// Return the cached ledger, opening it with `open` when absent or closed
    pub(crate) async fn get_or_open<F, Fut>(
        &self,
        name: &str,
        open: F,
    ) -> Result<Arc<dyn ManagedLedger>, LedgerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Arc<dyn ManagedLedger>, LedgerError>>,
    {
        loop {
            let cell = self.cells.entry(name.to_string()).or_default().clone();
            let ledger = cell.get_or_try_init(&open).await?.clone();
            if !ledger.is_closed() {
                return Ok(ledger);
            }
            // A closed instance is never handed out again
            self.cells.remove_if(name, |_, c| Arc::ptr_eq(c, &cell));
        }
    }

    pub(crate) fn is_open(&self, name: &str) -> bool {
        self.cells
            .get(name)
            .and_then(|cell| cell.get().map(|l| !l.is_closed()))
            .unwrap_or(false)
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<dyn ManagedLedger>> {
        self.cells
            .remove(name)
            .and_then(|(_, cell)| cell.get().cloned())
    }

    pub(crate) fn drain(&self) -> Vec<Arc<dyn ManagedLedger>> {
        let names: Vec<String> = self.cells.iter().map(|e| e.key().clone()).collect();
        names.iter().filter_map(|n| self.remove(n)).collect()
    }
}

/// Batched sequential reader over a ledger
pub struct LedgerReader {
    ledger: Arc<dyn ManagedLedger>,
    next: Position,
    batch_size: usize,
    exhausted: bool,
}

impl LedgerReader {
    pub fn new(ledger: Arc<dyn ManagedLedger>, from: Position, batch_size: usize) -> Self {
        Self {
            ledger,
            next: from,
            batch_size: batch_size.max(1),
            exhausted: false,
        }
    }

    /// Read everything from the start of the ledger
    pub fn from_start(ledger: Arc<dyn ManagedLedger>, batch_size: usize) -> Self {
        Self::new(ledger, Position::EARLIEST, batch_size)
    }

    /// Next batch, or `None` once the end was reached
    pub async fn next_batch(&mut self) -> Result<Option<Vec<LedgerEntry>>, LedgerError> {
        if self.exhausted {
            return Ok(None);
        }
        let batch = self
            .ledger
            .read_entries(self.next, self.batch_size)
            .await?;
        match batch.last() {
            Some(last) => {
                self.next = last.position.next();
                if batch.len() < self.batch_size {
                    self.exhausted = true;
                }
                Ok(Some(batch))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}
