//! Identity registry: the only thing the engine ever holds for a connection
//! is a random `ConnKey`; this map turns it back into the live connection.

use crate::conn::Connection;
use crate::logger::{self, BreadcrumbFlags};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnKey(u32);

impl ConnKey {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Default)]
pub struct ConnRegistry {
    conns: RwLock<FxHashMap<ConnKey, Arc<Connection>>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws random keys until one is free, then builds and stores the
    /// connection under it. The write lock is held throughout, so the key
    /// cannot be taken between the check and the insert.
    pub fn insert_with<F>(&self, build: F) -> Arc<Connection>
    where
        F: FnOnce(ConnKey) -> Arc<Connection>,
    {
        self.insert_with_keys(|| ConnKey(rand::random::<u32>()), build)
    }

    fn insert_with_keys<K, F>(&self, mut next_key: K, build: F) -> Arc<Connection>
    where
        K: FnMut() -> ConnKey,
        F: FnOnce(ConnKey) -> Arc<Connection>,
    {
        let mut conns = self.conns.write();
        loop {
            let key = next_key();
            if let Entry::Vacant(slot) = conns.entry(key) {
                let conn = build(key);
                slot.insert(Arc::clone(&conn));
                return conn;
            }
            logger::breadcrumb(
                BreadcrumbFlags::REGISTRY,
                format!("key {key} already live, drawing again"),
            );
        }
    }

    pub fn lookup(&self, key: ConnKey) -> Option<Arc<Connection>> {
        self.conns.read().get(&key).cloned()
    }

    /// Returns `false` if the key was not registered.
    pub fn free(&self, key: ConnKey) -> bool {
        self.conns.write().remove(&key).is_some()
    }

    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.conns.read().values().cloned().collect()
    }
}
