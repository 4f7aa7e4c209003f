//! In-memory managed ledgers
//!
//! Data outlives the ledger instances: closing and reopening a name keeps its
//! entries and starts a new ledger id, like the file-backed implementation.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::ledger::{
    LedgerConfig, LedgerEntry, ManagedLedger, ManagedLedgerFactory, OpenLedgers, Position,
};
use crate::error::LedgerError;

#[derive(Debug, Default)]
struct MemoryStorage {
    ledgers: BTreeMap<i64, Vec<Bytes>>,
}

impl MemoryStorage {
    fn next_ledger_id(&self) -> i64 {
        self.ledgers.keys().next_back().map_or(0, |id| id + 1)
    }
}

/// Factory keeping every ledger in process memory
#[derive(Default)]
pub struct MemoryLedgerFactory {
    storage: DashMap<String, Arc<Mutex<MemoryStorage>>>,
    open: OpenLedgers,
}

impl MemoryLedgerFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManagedLedgerFactory for MemoryLedgerFactory {
    async fn open(
        &self,
        name: &str,
        config: LedgerConfig,
    ) -> Result<Arc<dyn ManagedLedger>, LedgerError> {
        self.open
            .get_or_open(name, || async {
                let storage = self.storage.entry(name.to_string()).or_default().clone();
                let ledger_id = {
                    let mut s = storage.lock();
                    let id = s.next_ledger_id();
                    s.ledgers.insert(id, Vec::new());
                    id
                };
                debug!(ledger = name, ledger_id, "Opened in-memory ledger");
                Ok(Arc::new(MemoryLedger {
                    name: name.to_string(),
                    ledger_id,
                    storage,
                    closed: AtomicBool::new(false),
                    config: config.clone(),
                }) as Arc<dyn ManagedLedger>)
            })
            .await
    }

    fn is_open(&self, name: &str) -> bool {
        self.open.is_open(name)
    }

    fn evict(&self, name: &str) -> Option<Arc<dyn ManagedLedger>> {
        self.open.remove(name)
    }

    async fn exists(&self, name: &str) -> bool {
        self.storage.contains_key(name)
    }

    async fn delete(&self, name: &str) -> Result<(), LedgerError> {
        if let Some(ledger) = self.open.remove(name) {
            ledger.close().await?;
        }
        self.storage
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| LedgerError::NotFound {
                name: name.to_string(),
            })
    }

    async fn close_all(&self) {
        for ledger in self.open.drain() {
            let _ = ledger.close().await;
        }
    }
}

#[derive(Debug)]
struct MemoryLedger {
    name: String,
    ledger_id: i64,
    storage: Arc<Mutex<MemoryStorage>>,
    closed: AtomicBool,
    config: LedgerConfig,
}

#[async_trait]
impl ManagedLedger for MemoryLedger {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_ledger_id(&self) -> i64 {
        self.ledger_id
    }

    async fn append(&self, data: Bytes) -> Result<Position, LedgerError> {
        if self.is_closed() {
            return Err(LedgerError::closed(&self.name));
        }
        let mut storage = self.storage.lock();
        let entries = storage
            .ledgers
            .get_mut(&self.ledger_id)
            .ok_or_else(|| LedgerError::NotFound {
                name: self.name.clone(),
            })?;
        entries.push(data);
        Ok(Position::new(self.ledger_id, entries.len() as i64 - 1))
    }

    async fn read_entries(
        &self,
        from: Position,
        max: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let storage = self.storage.lock();
        let mut out = Vec::with_capacity(max.min(64));
        for (&ledger_id, entries) in storage.ledgers.range(from.ledger_id.max(0)..) {
            let start = if ledger_id == from.ledger_id {
                from.entry_id.max(0) as usize
            } else {
                0
            };
            for (entry_id, data) in entries.iter().enumerate().skip(start) {
                if out.len() >= max {
                    return Ok(out);
                }
                out.push(LedgerEntry {
                    position: Position::new(ledger_id, entry_id as i64),
                    data: data.clone(),
                });
            }
        }
        Ok(out)
    }

    fn last_confirmed_position(&self) -> Position {
        let storage = self.storage.lock();
        storage
            .ledgers
            .iter()
            .rev()
            .find(|(_, entries)| !entries.is_empty())
            .map(|(&id, entries)| Position::new(id, entries.len() as i64 - 1))
            .unwrap_or(Position::new(self.ledger_id, -1))
    }

    fn first_position(&self) -> Option<Position> {
        let storage = self.storage.lock();
        storage
            .ledgers
            .iter()
            .find(|(_, entries)| !entries.is_empty())
            .map(|(&id, _)| Position::new(id, 0))
    }

    fn entry_count(&self) -> u64 {
        let storage = self.storage.lock();
        storage.ledgers.values().map(|e| e.len() as u64).sum()
    }

    async fn trim_ledgers_before(&self, ledger_id: i64) -> Result<u64, LedgerError> {
        let bound = ledger_id.min(self.ledger_id);
        let mut storage = self.storage.lock();
        let kept = storage.ledgers.split_off(&bound);
        let removed = std::mem::replace(&mut storage.ledgers, kept);
        Ok(removed.values().map(|e| e.len() as u64).sum())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), LedgerError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(ledger = %self.name, ledger_id = self.ledger_id, "Closed in-memory ledger");
        }
        Ok(())
    }

    fn config(&self) -> &LedgerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ledger::LedgerReader;

    fn config() -> LedgerConfig {
        LedgerConfig::standalone("persistent://t/ns/topic")
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let factory = MemoryLedgerFactory::new();
        let ledger = factory.open("t/ns/persistent/topic", config()).await.unwrap();

        assert_eq!(ledger.last_confirmed_position(), Position::new(0, -1));
        assert!(ledger.first_position().is_none());

        let p0 = ledger.append(Bytes::from_static(b"a")).await.unwrap();
        let p1 = ledger.append(Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(p0, Position::new(0, 0));
        assert_eq!(p1, Position::new(0, 1));
        assert_eq!(ledger.last_confirmed_position(), p1);

        let entries = ledger.read_entries(Position::EARLIEST, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].data, Bytes::from_static(b"b"));

        let entries = ledger.read_entries(p1, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_ledger_rejects_appends() {
        let factory = MemoryLedgerFactory::new();
        let ledger = factory.open("a", config()).await.unwrap();
        ledger.close().await.unwrap();

        let err = ledger.append(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(err.is_closed());
        assert!(!factory.is_open("a"));
    }

    #[tokio::test]
    async fn test_reopen_starts_new_ledger() {
        let factory = MemoryLedgerFactory::new();
        let ledger = factory.open("a", config()).await.unwrap();
        ledger.append(Bytes::from_static(b"x")).await.unwrap();
        ledger.close().await.unwrap();

        let reopened = factory.open("a", config()).await.unwrap();
        assert_eq!(reopened.current_ledger_id(), 1);
        assert_eq!(reopened.last_confirmed_position(), Position::new(0, 0));

        let p = reopened.append(Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(p, Position::new(1, 0));

        let all = reopened.read_entries(Position::EARLIEST, 10).await.unwrap();
        let positions: Vec<_> = all.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![Position::new(0, 0), Position::new(1, 0)]);
    }

    #[tokio::test]
    async fn test_concurrent_open_shares_instance() {
        let factory = Arc::new(MemoryLedgerFactory::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let f = factory.clone();
            handles.push(tokio::spawn(async move { f.open("shared", config()).await }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap().current_ledger_id());
        }
        assert!(ids.iter().all(|id| *id == 0));
    }

    #[tokio::test]
    async fn test_evict_keeps_storage() {
        let factory = MemoryLedgerFactory::new();
        let ledger = factory.open("a", config()).await.unwrap();
        ledger.append(Bytes::from_static(b"x")).await.unwrap();

        assert!(factory.evict("a").is_some());
        assert!(!factory.is_open("a"));
        assert!(factory.exists("a").await);
        // The evicted instance stays usable for whoever still holds it
        assert!(ledger.append(Bytes::from_static(b"y")).await.is_ok());
    }

    #[tokio::test]
    async fn test_trim_and_reader() {
        let factory = MemoryLedgerFactory::new();
        let ledger = factory.open("a", config()).await.unwrap();
        for i in 0..3u8 {
            ledger.append(Bytes::from(vec![i])).await.unwrap();
        }
        ledger.close().await.unwrap();

        let ledger = factory.open("a", config()).await.unwrap();
        for i in 3..5u8 {
            ledger.append(Bytes::from(vec![i])).await.unwrap();
        }

        let mut reader = LedgerReader::from_start(ledger.clone(), 2);
        let mut seen = Vec::new();
        while let Some(batch) = reader.next_batch().await.unwrap() {
            seen.extend(batch.into_iter().map(|e| e.data[0]));
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        assert_eq!(ledger.trim_ledgers_before(1).await.unwrap(), 3);
        assert_eq!(ledger.first_position(), Some(Position::new(1, 0)));
        assert_eq!(ledger.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_delete() {
        let factory = MemoryLedgerFactory::new();
        let ledger = factory.open("a", config()).await.unwrap();
        factory.delete("a").await.unwrap();
        assert!(ledger.is_closed());
        assert!(!factory.exists("a").await);
        assert!(factory.delete("a").await.is_err());
    }
}
