//! Offline-first data layer for a point-of-sale terminal.
//!
//! Reads and writes go to the central server when it answers and to a local
//! SQLite mirror when it does not. Writes that land locally are queued and
//! replayed by the sync engine once the server is back; menu images are
//! mirrored to disk so the till keeps working without a network.
//!
//! [`PosCore`] wires the components together and is the surface the UI talks to.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zeroize::Zeroizing;

pub mod api;
pub mod assets;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod menu;
pub mod model;
pub mod network;
pub mod orders;
pub mod query;
pub mod router;
pub mod sync;
#[cfg(test)]
mod testing;

pub use api::{AssetSource, HttpRemote, RemoteStore};
pub use assets::{AssetReplicator, AssetSyncReport};
pub use auth::{AuthState, AuthenticatedAdmin};
pub use config::CoreConfig;
pub use db::LocalStore;
pub use error::{CoreError, Result};
pub use network::{ListenerId, NetworkMonitor};
pub use orders::{OrderConfirmation, OrderFilter, OrderRequest, OrderRequestLine, OrderSummary};
pub use query::{Operation, QueryResult, Row};
pub use router::{Destination, QueryRouter};
pub use sync::{CycleReport, PushReport, SyncEngine, SyncPhase, SyncTrigger};

use chrono::{DateTime, Utc};
use model::{Category, Item};
use serde_json::Value;

/// The assembled data layer.
pub struct PosCore {
    config: CoreConfig,
    local: Arc<LocalStore>,
    router: Arc<QueryRouter>,
    network: Arc<NetworkMonitor>,
    sync: Arc<SyncEngine>,
    assets: Arc<AssetReplicator>,
    auth: AuthState,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PosCore {
    /// Open the local store and connect to the configured HTTP backend.
    ///
    /// Failing to open the local store is the only fatal startup error.
    pub fn open(config: CoreConfig) -> Result<Self> {
        let http = Arc::new(HttpRemote::new(&config.remote_url, config.api_key.clone())?);
        Self::with_remote(config, http.clone(), http)
    }

    /// Assemble the components around the given remote store and image source.
    pub fn with_remote(
        config: CoreConfig,
        remote: Arc<dyn RemoteStore>,
        source: Arc<dyn AssetSource>,
    ) -> Result<Self> {
        let local = Arc::new(LocalStore::open(&config.db_path())?);
        let router = Arc::new(QueryRouter::new(
            Arc::clone(&remote),
            Arc::clone(&local),
            config.query_timeout(),
        ));
        let network = Arc::new(NetworkMonitor::new(remote, config.probe_timeout()));
        let assets = Arc::new(AssetReplicator::new(
            source,
            Arc::clone(&local),
            config.asset_dir(),
            config.manifest_path(),
            &api::normalize_base_url(&config.remote_url),
            config.asset_timeout(),
        ));
        let sync = Arc::new(SyncEngine::new(
            Arc::clone(&router),
            Arc::clone(&network),
            Arc::clone(&assets),
            config.staleness(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            data_dir = %config.data_dir.display(),
            remote = %config.remote_url,
            "POS core ready"
        );
        Ok(Self {
            config,
            local,
            router,
            network,
            sync,
            assets,
            auth: AuthState::new(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    /// Start the network poller and the sync loop. Calling it twice is a no-op.
    pub fn start_background(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if !tasks.is_empty() {
            warn!("Background tasks already running");
            return;
        }
        tasks.push(
            self.network
                .spawn_poller(self.config.probe_interval(), self.shutdown_tx.subscribe()),
        );
        tasks.push(
            self.sync
                .spawn(self.config.sync_interval(), self.shutdown_tx.subscribe()),
        );
        info!("Background tasks started");
    }

    /// Stop background tasks, wait for them and close the local store.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {e}");
            }
        }
        self.local.close()?;
        info!("POS core shut down");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn route(&self, op: &Operation) -> Result<QueryResult> {
        self.router.route(op).await
    }

    pub async fn route_sql(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.router.route_sql(sql, params).await
    }

    // -----------------------------------------------------------------------
    // Auth
    // -----------------------------------------------------------------------

    pub async fn login(
        &self,
        username: &str,
        password: Zeroizing<String>,
    ) -> Result<AuthenticatedAdmin> {
        auth::login(&self.router, &self.auth, username, password).await
    }

    pub fn logout(&self) {
        auth::logout(&self.auth);
    }

    pub fn current_admin(&self) -> Option<AuthenticatedAdmin> {
        self.auth.current_admin()
    }

    // -----------------------------------------------------------------------
    // Orders and menu
    // -----------------------------------------------------------------------

    pub async fn create_order(&self, req: &OrderRequest) -> Result<OrderConfirmation> {
        orders::create_order(&self.router, req).await
    }

    pub async fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<OrderSummary>> {
        orders::get_orders(&self.router, filter).await
    }

    pub async fn update_order_status(&self, order_id: i64, status: &str) -> Result<u64> {
        orders::update_order_status(&self.router, order_id, status).await
    }

    pub async fn get_categories(&self) -> Result<Vec<Category>> {
        menu::get_categories(&self.router).await
    }

    pub async fn get_items(&self, category_id: Option<i64>) -> Result<Vec<Item>> {
        menu::get_items(&self.router, category_id).await
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    pub async fn force_sync(&self) -> CycleReport {
        self.sync.force_sync().await
    }

    pub fn is_sync_needed(&self) -> bool {
        self.sync.is_sync_needed()
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.sync.last_sync_time()
    }

    pub fn sync_phase(&self) -> SyncPhase {
        self.sync.phase()
    }

    /// Phase changes as they happen, for a status indicator.
    pub fn watch_sync_phase(&self) -> watch::Receiver<SyncPhase> {
        self.sync.watch_phase()
    }

    pub async fn sync_pending_changes(&self) -> Result<PushReport> {
        self.sync.sync_pending_changes().await
    }

    pub async fn sync_assets(&self) -> Result<AssetSyncReport> {
        self.assets.sync_assets().await
    }

    // -----------------------------------------------------------------------
    // Network
    // -----------------------------------------------------------------------

    /// Cached status from the last probe.
    pub fn network_status(&self) -> bool {
        self.network.current_status()
    }

    /// Probe now and return the fresh status.
    pub async fn check_network(&self) -> bool {
        self.network.is_online().await
    }

    pub fn subscribe_network(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> ListenerId {
        self.network.subscribe(listener)
    }

    pub fn unsubscribe_network(&self, id: ListenerId) -> bool {
        self.network.unsubscribe(id)
    }

    pub fn network_watch(&self) -> watch::Receiver<bool> {
        self.network.watch()
    }
}
