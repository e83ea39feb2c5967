//! In-memory stand-ins for the central backend, used by unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::api::{AssetSource, RemoteStore};
use crate::db::{LocalStore, OrderIds};
use crate::error::{CoreError, Result};
use crate::model::{Category, Item};
use crate::query::{Operation, QueryResult, Table};

/// Remote store backed by a second SQLite database.
pub struct FakeRemote {
    pub store: LocalStore,
    online: AtomicBool,
    stalled: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicUsize,
    rejected: Mutex<HashSet<Table>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: LocalStore::open_in_memory_with(OrderIds::Sequential)
                .expect("open fake remote db"),
            online: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            calls: AtomicUsize::new(0),
            rejected: Mutex::new(HashSet::new()),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Never answer until un-stalled (exercises caller timeouts).
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Delay every `execute` by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Answer every operation on `table` with an HTTP 400.
    pub fn reject(&self, table: Table) {
        self.rejected.lock().unwrap().insert(table);
    }

    pub fn accept(&self, table: Table) {
        self.rejected.lock().unwrap().remove(&table);
    }

    /// Number of `execute` calls received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seed_menu(&self, categories: &[Category], items: &[Item]) {
        self.store
            .replace_reference_data(categories, items)
            .expect("seed remote menu");
    }

    async fn gate(&self) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::connectivity("connection refused"))
        }
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn ping(&self) -> Result<()> {
        self.gate().await
    }

    async fn execute(&self, op: &Operation) -> Result<QueryResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.rejected.lock().unwrap().contains(&op.table()) {
            return Err(CoreError::RemoteQuery {
                status: 400,
                message: format!("rejected {}", op.describe()),
            });
        }
        self.store.execute(op)
    }
}

/// Asset server holding bodies in memory, keyed by URL.
#[derive(Default)]
pub struct FakeAssetSource {
    files: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
    stalled: AtomicBool,
}

impl FakeAssetSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, url: &str, body: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_vec());
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetSource for FakeAssetSource {
    async fn fetch_to(&self, url: &str, sink: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let body = self.files.lock().unwrap().get(url).cloned();
        let Some(body) = body else {
            return Err(CoreError::RemoteQuery {
                status: 404,
                message: format!("no asset at {url}"),
            });
        };
        if self.stalled.load(Ordering::SeqCst) {
            // Send half the body, then hang
            sink.write_all(&body[..body.len() / 2]).await?;
            std::future::pending::<()>().await;
        }
        sink.write_all(&body).await?;
        sink.flush().await?;
        Ok(body.len() as u64)
    }
}
