//! Registry of loaded topics
//!
//! Loading is single-flight per name: concurrent lookups of a topic that is
//! not loaded yet wait for the same load. The registry also remembers which
//! topics the broker has created, independently of whether they are loaded.
//!
//! An unloading topic leaves the registry before it is closed. Until the
//! close finishes the name stays marked as closing, and a new load of the
//! name waits for it, so the next instance only ever sees closed ledgers.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Notify, OnceCell};

use super::persistent::PersistentTopic;
use crate::error::Result;
use crate::naming::{NamespaceName, TopicName};

type TopicCell = Arc<OnceCell<Arc<PersistentTopic>>>;

#[derive(Default)]
pub struct TopicRegistry {
    topics: DashMap<TopicName, TopicCell>,
    closing: DashMap<TopicName, Arc<Notify>>,
    known: DashSet<TopicName>,
}

/// Keeps a topic name marked as closing until dropped
pub struct UnloadGuard<'a> {
    registry: &'a TopicRegistry,
    name: TopicName,
    done: Arc<Notify>,
}

impl Drop for UnloadGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .closing
            .remove_if(&self.name, |_, n| Arc::ptr_eq(n, &self.done));
        self.done.notify_waiters();
    }
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loaded topic `name`, loading it with `load` when absent
    pub async fn get_or_load<F, Fut>(&self, name: &TopicName, load: F) -> Result<Arc<PersistentTopic>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PersistentTopic>>,
    {
        let cell = self.topics.entry(name.clone()).or_default().clone();
        let result = cell
            .get_or_try_init(|| async move {
                self.wait_for_unload(name).await;
                load().await.map(Arc::new)
            })
            .await
            .cloned();
        if result.is_err() {
            self.topics
                .remove_if(name, |_, c| Arc::ptr_eq(c, &cell) && c.get().is_none());
        }
        result
    }

    pub fn get(&self, name: &TopicName) -> Option<Arc<PersistentTopic>> {
        self.topics.get(name).and_then(|c| c.get().cloned())
    }

    /// Whether a loaded topic is registered under `name`
    pub fn is_registered(&self, name: &TopicName) -> bool {
        self.topics.get(name).is_some_and(|c| c.get().is_some())
    }

    /// Remove `name` for unloading
    ///
    /// Returns the loaded topic and a guard; loads of `name` wait until the
    /// guard is dropped. Returns `None` while another unload of `name` is
    /// still closing it.
    pub fn begin_unload(&self, name: &TopicName) -> Option<(Arc<PersistentTopic>, UnloadGuard<'_>)> {
        let done = match self.closing.entry(name.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => slot.insert(Arc::new(Notify::new())).clone(),
        };
        let guard = UnloadGuard {
            registry: self,
            name: name.clone(),
            done,
        };
        let topic = self
            .topics
            .remove(name)
            .and_then(|(_, cell)| cell.get().cloned())?;
        Some((topic, guard))
    }

    /// Whether an unload of `name` is still closing the topic
    pub fn is_closing(&self, name: &TopicName) -> bool {
        self.closing.contains_key(name)
    }

    async fn wait_for_unload(&self, name: &TopicName) {
        loop {
            let Some(done) = self.closing.get(name).map(|e| e.value().clone()) else {
                return;
            };
            let notified = done.notified();
            let still_closing = self
                .closing
                .get(name)
                .is_some_and(|e| Arc::ptr_eq(e.value(), &done));
            if still_closing {
                notified.await;
            }
        }
    }

    /// Registered topics of `namespace`
    pub fn topics_in(&self, namespace: &NamespaceName) -> Vec<TopicName> {
        let mut names: Vec<TopicName> = self
            .topics
            .iter()
            .filter(|e| e.key().namespace() == namespace)
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<TopicName> {
        let mut names: Vec<TopicName> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Remember that the broker created `name`; false if already known
    pub fn record_created(&self, name: &TopicName) -> bool {
        self.known.insert(name.clone())
    }

    pub fn is_known(&self, name: &TopicName) -> bool {
        self.known.contains(name)
    }

    pub fn forget(&self, name: &TopicName) -> bool {
        self.known.remove(name).is_some()
    }
}
