use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use lazy_static::lazy_static;

use crate::error::{DatabaseError, Result};
use crate::storage::block_store::{BlockStore, StoreHost};

lazy_static! {
    // One registry per process. Every MemoryStore opened on a namespace
    // shares the same map, which is what lets two handles in one process
    // behave like two tabs over one origin.
    static ref SHARED_NAMESPACES: Mutex<HashMap<String, Arc<Mutex<Namespace>>>> =
        Mutex::new(HashMap::new());
}

struct Namespace {
    entries: BTreeMap<Vec<u8>, Bytes>,
    closed: bool,
    quota_bytes: Option<u64>,
    /// Test fault hook: when set, the next put_batch fails before any pair
    /// is applied, modeling a crash ahead of durability.
    fail_puts: bool,
}

impl Namespace {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            closed: false,
            quota_bytes: None,
            fail_puts: false,
        }
    }

    fn used_bytes(&self) -> u64 {
        self.entries.values().map(|v| v.len() as u64).sum()
    }
}

/// In-process key-value store standing in for the browser object store.
///
/// All operations complete on the current task; the async surface exists
/// because real hosts are asynchronous and the rest of the core must not
/// assume otherwise.
pub struct MemoryStore {
    namespace: String,
    inner: Arc<Mutex<Namespace>>,
}

impl MemoryStore {
    /// Open (or attach to) a shared namespace.
    pub fn open(namespace: &str) -> Arc<MemoryStore> {
        let mut registry = SHARED_NAMESPACES.lock().unwrap();
        let inner = registry
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Namespace::new())))
            .clone();
        // Reopening resurrects a previously closed namespace.
        inner.lock().unwrap().closed = false;
        Arc::new(MemoryStore { namespace: namespace.to_string(), inner })
    }

    /// Remove a namespace and its contents from the process registry.
    pub fn wipe(namespace: &str) {
        SHARED_NAMESPACES.lock().unwrap().remove(namespace);
    }

    /// Limit the total payload bytes the namespace accepts.
    pub fn set_quota(&self, quota_bytes: Option<u64>) {
        self.inner.lock().unwrap().quota_bytes = quota_bytes;
    }

    /// Arm or disarm the crash hook: an armed store rejects the next
    /// `put_batch` without applying any pair.
    pub fn set_fail_puts(&self, fail: bool) {
        self.inner.lock().unwrap().fail_puts = fail;
    }

    fn guard_open(ns: &Namespace, namespace: &str) -> Result<()> {
        if ns.closed {
            return Err(DatabaseError::io(format!(
                "namespace {:?} is closed",
                namespace
            )));
        }
        Ok(())
    }
}

impl BlockStore for MemoryStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn get<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<Option<Bytes>>> {
        Box::pin(async move {
            let ns = self.inner.lock().unwrap();
            Self::guard_open(&ns, &self.namespace)?;
            Ok(ns.entries.get(key).cloned())
        })
    }

    fn put_batch<'a>(
        &'a self,
        batch: Vec<(Vec<u8>, Bytes)>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut ns = self.inner.lock().unwrap();
            Self::guard_open(&ns, &self.namespace)?;
            if ns.fail_puts {
                ns.fail_puts = false;
                return Err(DatabaseError::io(format!(
                    "write transaction aborted (namespace {:?})",
                    self.namespace
                )));
            }
            if let Some(quota) = ns.quota_bytes {
                let incoming: u64 = batch.iter().map(|(_, v)| v.len() as u64).sum();
                let replaced: u64 = batch
                    .iter()
                    .filter_map(|(k, _)| ns.entries.get(k))
                    .map(|v| v.len() as u64)
                    .sum();
                if ns.used_bytes() + incoming - replaced > quota {
                    return Err(DatabaseError::io(format!(
                        "quota exceeded (namespace {:?}, limit {} bytes)",
                        self.namespace, quota
                    )));
                }
            }
            // All pairs land under one registry lock: observers see either
            // none of the batch or all of it.
            for (key, value) in batch {
                ns.entries.insert(key, value);
            }
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut ns = self.inner.lock().unwrap();
            Self::guard_open(&ns, &self.namespace)?;
            ns.entries.remove(key);
            Ok(())
        })
    }

    fn delete_range<'a>(
        &'a self,
        start: &'a [u8],
        end: &'a [u8],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut ns = self.inner.lock().unwrap();
            Self::guard_open(&ns, &self.namespace)?;
            if start >= end {
                return Ok(());
            }
            let doomed: Vec<Vec<u8>> = ns
                .entries
                .range::<[u8], _>((std::ops::Bound::Included(start), std::ops::Bound::Excluded(end)))
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                ns.entries.remove(&key);
            }
            Ok(())
        })
    }

    fn scan<'a>(&'a self, prefix: &'a [u8]) -> BoxFuture<'a, Result<Vec<(Vec<u8>, Bytes)>>> {
        Box::pin(async move {
            let ns = self.inner.lock().unwrap();
            Self::guard_open(&ns, &self.namespace)?;
            let pairs = ns
                .entries
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(pairs)
        })
    }

    fn total_bytes<'a>(&'a self) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let ns = self.inner.lock().unwrap();
            Self::guard_open(&ns, &self.namespace)?;
            Ok(ns.used_bytes())
        })
    }

    fn clear<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut ns = self.inner.lock().unwrap();
            Self::guard_open(&ns, &self.namespace)?;
            ns.entries.clear();
            Ok(())
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.inner.lock().unwrap().closed = true;
            Ok(())
        })
    }
}

/// [`StoreHost`] handing out shared [`MemoryStore`] namespaces.
pub struct MemoryStoreHost;

impl MemoryStoreHost {
    pub fn shared() -> Arc<dyn StoreHost> {
        Arc::new(MemoryStoreHost)
    }
}

impl StoreHost for MemoryStoreHost {
    fn open_namespace<'a>(
        &'a self,
        namespace: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn BlockStore>>> {
        Box::pin(async move {
            let store: Arc<dyn BlockStore> = MemoryStore::open(namespace);
            Ok(store)
        })
    }
}
