//! Background sync engine.
//!
//! One cycle pulls reference data (categories, items, then admins), pushes
//! queued local writes in insertion order, then replicates menu images.
//! Cycles run on a timer and whenever the network comes back, and never
//! overlap. Failures are logged and reported, never propagated to callers.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::assets::{AssetReplicator, AssetSyncReport};
use crate::db::{is_local_order_id, LocalStore};
use crate::error::{CoreError, Result};
use crate::model::{from_row, Admin, Category, ChangeAction, ChangeType, Item, PendingChange};
use crate::network::NetworkMonitor;
use crate::query::{Insert, Operation, Select, Table, Update};
use crate::router::QueryRouter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    PullingReference,
    PushingPending,
    SyncingAssets,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Timer,
    Reconnect,
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub pushed: usize,
    /// Changes whose order had already reached the remote store.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub trigger: SyncTrigger,
    pub reference_synced: bool,
    pub admins_synced: bool,
    pub push: Option<PushReport>,
    pub assets: Option<AssetSyncReport>,
    /// Set when some entries or images failed but the cycle completed.
    pub degraded: bool,
    pub error: Option<String>,
}

impl CycleReport {
    fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            reference_synced: false,
            admins_synced: false,
            push: None,
            assets: None,
            degraded: false,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

enum PushOutcome {
    Pushed,
    Skipped,
}

pub struct SyncEngine {
    router: Arc<QueryRouter>,
    local: Arc<LocalStore>,
    network: Arc<NetworkMonitor>,
    assets: Arc<AssetReplicator>,
    staleness: ChronoDuration,
    phase: watch::Sender<SyncPhase>,
    cycle_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        router: Arc<QueryRouter>,
        network: Arc<NetworkMonitor>,
        assets: Arc<AssetReplicator>,
        staleness: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            local: Arc::clone(router.local()),
            router,
            network,
            assets,
            staleness: ChronoDuration::from_std(staleness).unwrap_or(ChronoDuration::hours(1)),
            phase,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase.borrow().clone()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: SyncPhase) {
        debug!(phase = ?phase, "Sync phase");
        self.phase.send_replace(phase);
    }

    // -----------------------------------------------------------------------
    // Staleness
    // -----------------------------------------------------------------------

    /// Time of the last successful reference pull.
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        match self.local.sync_status() {
            Ok(status) => status.map(|s| s.last_sync),
            Err(e) => {
                warn!("Failed to read sync status: {e}");
                None
            }
        }
    }

    pub fn is_sync_needed(&self) -> bool {
        self.is_sync_needed_at(Utc::now())
    }

    pub fn is_sync_needed_at(&self, now: DateTime<Utc>) -> bool {
        match self.last_sync_time() {
            Some(last) => now - last > self.staleness,
            None => true,
        }
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Pull categories and items and replace the local copies atomically.
    pub async fn sync_reference_data(&self) -> Result<(usize, usize)> {
        let categories: Vec<Category> = self.pull(Table::Categories).await?;
        let items: Vec<Item> = self.pull(Table::Items).await?;

        let known: HashSet<i64> = categories.iter().map(|c| c.id).collect();
        for item in items.iter().filter(|i| !known.contains(&i.category_id)) {
            warn!(
                item_id = item.id,
                category_id = item.category_id,
                "Orphaned item: category not in snapshot"
            );
        }

        self.local.replace_reference_data(&categories, &items)?;
        Ok((categories.len(), items.len()))
    }

    /// Mirror the admin accounts, only when a fresh probe says we are online.
    pub async fn sync_admins(&self) -> Result<bool> {
        if !self.network.is_online().await {
            debug!("Offline, skipping admin sync");
            return Ok(false);
        }
        let admins: Vec<Admin> = self.pull(Table::Admins).await?;
        self.local.replace_admins(&admins)?;
        Ok(true)
    }

    async fn pull<T: serde::de::DeserializeOwned>(&self, table: Table) -> Result<Vec<T>> {
        let op = Operation::Select(Select::new(table).order_by("id", false));
        let rows = self.router.remote(&op).await?.into_rows()?;
        rows.iter().map(from_row).collect()
    }

    /// Replay queued local writes against the remote store, oldest first.
    ///
    /// A rejected entry stays queued with its error recorded and the loop
    /// moves on. Losing the connection aborts the step. Waits for a running
    /// cycle so the same entry is never replayed twice.
    pub async fn sync_pending_changes(&self) -> Result<PushReport> {
        let _cycle = self.cycle_lock.lock().await;
        self.push_pending().await
    }

    /// Caller holds `cycle_lock`.
    async fn push_pending(&self) -> Result<PushReport> {
        let changes = self.local.pending_changes()?;
        let mut report = PushReport::default();
        if changes.is_empty() {
            return Ok(report);
        }
        info!(pending = changes.len(), "Pushing pending changes");

        for change in &changes {
            match self.push_change(change).await {
                Ok(PushOutcome::Pushed) => report.pushed += 1,
                Ok(PushOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(
                        change_id = change.id,
                        change_type = change.change_type.as_str(),
                        "Pending change failed: {e}"
                    );
                    self.local.record_change_failure(change.id, &e.to_string())?;
                    if e.is_connectivity() {
                        return Err(e);
                    }
                    report.failed += 1;
                }
            }
        }

        info!(
            pushed = report.pushed,
            skipped = report.skipped,
            failed = report.failed,
            "Pending changes pushed"
        );
        Ok(report)
    }

    async fn push_change(&self, change: &PendingChange) -> Result<PushOutcome> {
        let creates_order =
            change.change_type == ChangeType::Order && change.action == ChangeAction::Create;
        let local_id = change.payload.local_id;

        if creates_order {
            if let Some(local_id) = local_id {
                let already_pushed = self
                    .local
                    .order(local_id)?
                    .is_some_and(|order| order.remote_id.is_some());
                if already_pushed {
                    debug!(change_id = change.id, order_id = local_id, "Order already synced");
                    self.local.complete_change(change.id, None)?;
                    return Ok(PushOutcome::Skipped);
                }
            }
        }

        let op = self.translate_order_ids(&change.payload.operation)?;
        let result = self.router.remote(&op).await?;

        let synced_order = if creates_order {
            let remote_id = result.insert_id().ok_or_else(|| {
                CoreError::integrity("remote store did not return the new order id")
            })?;
            local_id.map(|local_id| (local_id, remote_id))
        } else {
            None
        };
        self.local.complete_change(change.id, synced_order)?;
        Ok(PushOutcome::Pushed)
    }

    /// Rewrite local order ids to their remote ids before replay. Positive
    /// ids already name remote orders and are left alone.
    fn translate_order_ids(&self, op: &Operation) -> Result<Operation> {
        match op {
            Operation::Insert(insert) if insert.table == Table::OrderItems => {
                let mut row = insert.row.clone();
                if let Some(local_id) = row.get("order_id").and_then(Value::as_i64) {
                    row.insert("order_id".into(), Value::from(self.remote_id_for(local_id)?));
                }
                Ok(Operation::Insert(Insert {
                    table: insert.table,
                    row,
                }))
            }
            Operation::Update(update) if update.table == Table::Orders => {
                let mut filters = Vec::with_capacity(update.filters.len());
                for filter in &update.filters {
                    let mut filter = filter.clone();
                    if filter.column == "id" {
                        if let Some(local_id) = filter.value.as_i64() {
                            filter.value = Value::from(self.remote_id_for(local_id)?);
                        }
                    }
                    filters.push(filter);
                }
                Ok(Operation::Update(Update {
                    table: update.table,
                    set: update.set.clone(),
                    filters,
                }))
            }
            other => Ok(other.clone()),
        }
    }

    fn remote_id_for(&self, order_id: i64) -> Result<i64> {
        if !is_local_order_id(order_id) {
            return Ok(order_id);
        }
        match self.local.order(order_id)? {
            Some(order) => order.remote_id.ok_or_else(|| {
                CoreError::integrity(format!("order {order_id} has not been synced yet"))
            }),
            None => Err(CoreError::integrity(format!(
                "local order {order_id} no longer exists"
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Cycles
    // -----------------------------------------------------------------------

    /// Run one full cycle, waiting for any cycle in progress to finish.
    pub async fn run_cycle(&self, trigger: SyncTrigger) -> CycleReport {
        let _cycle = self.cycle_lock.lock().await;
        self.run_cycle_locked(trigger).await
    }

    pub async fn force_sync(&self) -> CycleReport {
        self.run_cycle(SyncTrigger::Manual).await
    }

    /// Run a cycle unless one is already running.
    async fn try_run_cycle(&self, trigger: SyncTrigger) -> Option<CycleReport> {
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            debug!(trigger = ?trigger, "Sync cycle already running, skipping");
            return None;
        };
        Some(self.run_cycle_locked(trigger).await)
    }

    async fn run_cycle_locked(&self, trigger: SyncTrigger) -> CycleReport {
        let mut report = CycleReport::new(trigger);
        info!(trigger = ?trigger, "Sync cycle started");

        self.set_phase(SyncPhase::PullingReference);
        if let Err(e) = self.sync_reference_data().await {
            return self.fail(report, "reference pull", e);
        }
        report.reference_synced = true;
        match self.sync_admins().await {
            Ok(synced) => report.admins_synced = synced,
            Err(e) => return self.fail(report, "admin pull", e),
        }

        self.set_phase(SyncPhase::PushingPending);
        match self.push_pending().await {
            Ok(push) => {
                report.degraded |= push.failed > 0;
                report.push = Some(push);
            }
            Err(e) => return self.fail(report, "pending push", e),
        }

        self.set_phase(SyncPhase::SyncingAssets);
        match self.assets.sync_assets().await {
            Ok(assets) => {
                report.degraded |= assets.failed > 0;
                report.assets = Some(assets);
            }
            Err(e) => return self.fail(report, "image sync", e),
        }

        self.set_phase(SyncPhase::Idle);
        info!(degraded = report.degraded, "Sync cycle complete");
        report
    }

    fn fail(&self, mut report: CycleReport, step: &str, err: CoreError) -> CycleReport {
        let reason = format!("{step} failed: {err}");
        warn!("Sync cycle aborted: {reason}");
        self.set_phase(SyncPhase::Failed(reason.clone()));
        report.error = Some(reason);
        report
    }

    /// Run a cycle on every tick and on every offline-to-online transition
    /// until `shutdown` fires.
    pub fn spawn(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut online_rx = engine.network.watch();
        tokio::spawn(async move {
            info!("Sync loop started (interval: {}s)", interval.as_secs());
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut was_online = *online_rx.borrow_and_update();

            loop {
                let trigger = tokio::select! {
                    _ = ticker.tick() => SyncTrigger::Timer,
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *online_rx.borrow_and_update();
                        let reconnected = online && !was_online;
                        was_online = online;
                        if !reconnected {
                            continue;
                        }
                        info!("Network restored; resuming queued sync");
                        SyncTrigger::Reconnect
                    }
                    _ = shutdown.changed() => break,
                };
                engine.try_run_cycle(trigger).await;
            }
            info!("Sync loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangePayload, NewOrder, OrderLine, OrderStatus};
    use crate::query::Filter;
    use crate::router::Destination;
    use crate::testing::{FakeAssetSource, FakeRemote};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        remote: Arc<FakeRemote>,
        local: Arc<LocalStore>,
        router: Arc<QueryRouter>,
        network: Arc<NetworkMonitor>,
        engine: Arc<SyncEngine>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = FakeRemote::new();
        let source = FakeAssetSource::new();
        let local = Arc::new(LocalStore::open_in_memory().expect("local store"));
        let router = Arc::new(QueryRouter::new(
            remote.clone(),
            local.clone(),
            Duration::from_millis(200),
        ));
        let network = Arc::new(NetworkMonitor::new(remote.clone(), Duration::from_millis(200)));
        let assets = Arc::new(AssetReplicator::new(
            source,
            local.clone(),
            dir.path().join("uploads"),
            dir.path().join("image-sync.json"),
            "http://pos.test",
            Duration::from_millis(200),
        ));
        let engine = Arc::new(SyncEngine::new(
            router.clone(),
            network.clone(),
            assets,
            Duration::from_secs(3600),
        ));
        Fixture {
            _dir: dir,
            remote,
            local,
            router,
            network,
            engine,
        }
    }

    fn seed_remote(remote: &FakeRemote) {
        remote.seed_menu(
            &[Category {
                id: 1,
                name: "Coffee".into(),
                image: None,
            }],
            &[
                Item {
                    id: 7,
                    name: "Espresso".into(),
                    category_id: 1,
                    price: 5.0,
                    image: None,
                },
                Item {
                    id: 8,
                    name: "Orphan".into(),
                    category_id: 42,
                    price: 2.0,
                    image: None,
                },
            ],
        );
    }

    fn order(client_ref: &str) -> NewOrder {
        NewOrder {
            client_ref: client_ref.into(),
            table_number: Some(4),
            total: 10.0,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            lines: vec![OrderLine {
                item_id: 7,
                quantity: 2,
                unit_price: 5.0,
            }],
        }
    }

    fn remote_count(remote: &FakeRemote, table: Table) -> usize {
        remote
            .store
            .execute(&Operation::Select(Select::new(table)))
            .expect("select")
            .into_rows()
            .expect("rows")
            .len()
    }

    #[tokio::test]
    async fn reference_pull_mirrors_and_stamps() {
        let f = fixture();
        seed_remote(&f.remote);
        assert!(f.engine.is_sync_needed());

        let (cats, items) = f.engine.sync_reference_data().await.expect("pull");
        assert_eq!((cats, items), (1, 2));
        assert!(!f.engine.is_sync_needed());
        assert!(f.engine.last_sync_time().is_some());

        let local_items = f
            .local
            .execute(&Operation::Select(Select::new(Table::Items)))
            .expect("select")
            .into_rows()
            .expect("rows");
        assert_eq!(local_items.len(), 2);
    }

    #[tokio::test]
    async fn staleness_threshold() {
        let f = fixture();
        f.local
            .set_sync_status("reference", Utc::now() - ChronoDuration::hours(2))
            .expect("stamp");
        assert!(f.engine.is_sync_needed());

        let last = f.engine.last_sync_time().expect("last sync");
        assert!(!f.engine.is_sync_needed_at(last + ChronoDuration::minutes(59)));
        assert!(f.engine.is_sync_needed_at(last + ChronoDuration::minutes(61)));
    }

    #[tokio::test]
    async fn failed_pull_keeps_previous_snapshot() {
        let f = fixture();
        seed_remote(&f.remote);
        f.engine.sync_reference_data().await.expect("pull");
        let before = f.engine.last_sync_time();

        f.remote.set_online(false);
        assert!(f.engine.sync_reference_data().await.is_err());
        assert_eq!(f.engine.last_sync_time(), before);
        assert_eq!(
            f.local
                .execute(&Operation::Select(Select::new(Table::Categories)))
                .expect("select")
                .into_rows()
                .expect("rows")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn offline_order_is_pushed_once() {
        let f = fixture();
        f.remote.set_online(false);
        let (dest, result) = f
            .router
            .route_traced(&Operation::CreateOrder(order("ref-1")))
            .await
            .expect("route");
        assert_eq!(dest, Destination::Local);
        let local_id = result.insert_id().expect("local id");

        f.remote.set_online(true);
        let report = f.engine.sync_pending_changes().await.expect("push");
        assert_eq!(report, PushReport { pushed: 1, skipped: 0, failed: 0 });

        let stored = f.local.order(local_id).expect("read").expect("order");
        assert_eq!(stored.status, OrderStatus::Synced);
        assert!(stored.remote_id.is_some());
        assert_eq!(remote_count(&f.remote, Table::Orders), 1);
        assert_eq!(remote_count(&f.remote, Table::OrderItems), 1);

        // Second run has nothing left to do
        let report = f.engine.sync_pending_changes().await.expect("push again");
        assert_eq!(report, PushReport::default());

        // A replayed entry for an order that already reached the remote is skipped
        let payload = ChangePayload {
            operation: Operation::CreateOrder(order("ref-1")),
            local_id: Some(local_id),
        };
        f.local
            .enqueue_change(ChangeType::Order, ChangeAction::Create, &payload, "replay-1")
            .expect("enqueue");
        let report = f.engine.sync_pending_changes().await.expect("replay");
        assert_eq!(report.skipped, 1);
        assert_eq!(remote_count(&f.remote, Table::Orders), 1);
        assert_eq!(f.local.pending_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn order_item_ids_are_translated() {
        let f = fixture();
        f.remote
            .store
            .execute(&Operation::CreateOrder(order("remote-only")))
            .expect("remote order");

        f.remote.set_online(false);
        let local_id = f
            .router
            .route_sql(
                "INSERT INTO orders (table_number, total) VALUES (?, ?)",
                &[json!(2), json!(3.5)],
            )
            .await
            .expect("order")
            .insert_id()
            .expect("id");
        f.router
            .route_sql(
                "INSERT INTO order_items (order_id, item_id, quantity, price) VALUES (?, 9, 1, 3.5)",
                &[json!(local_id)],
            )
            .await
            .expect("line");
        f.router
            .route_sql(
                "UPDATE orders SET status = 'cancelled' WHERE id = ?",
                &[json!(local_id)],
            )
            .await
            .expect("cancel");

        f.remote.set_online(true);
        let report = f.engine.sync_pending_changes().await.expect("push");
        assert_eq!(report.pushed, 3);

        let remote_id = f.local.remote_order_id(local_id).expect("read").expect("remote id");
        assert!(local_id < 0);
        assert_eq!(remote_id, 2);
        let lines = f
            .remote
            .store
            .execute(&Operation::Select(
                Select::new(Table::OrderItems).filter("item_id", 9),
            ))
            .expect("select")
            .into_rows()
            .expect("rows");
        assert_eq!(lines[0]["order_id"], json!(remote_id));
        let remote_order = f
            .remote
            .store
            .execute(&Operation::Select(
                Select::new(Table::Orders).filter("id", remote_id),
            ))
            .expect("select")
            .into_rows()
            .expect("rows");
        assert_eq!(remote_order[0]["status"], json!("cancelled"));

        // The local order stays cancelled but records its remote id
        let stored = f.local.order(local_id).expect("read").expect("order");
        assert_eq!(stored.status, OrderStatus::Cancelled);
    }

    fn remote_status(remote: &FakeRemote, id: i64) -> String {
        let rows = remote
            .store
            .execute(&Operation::Select(Select::new(Table::Orders).filter("id", id)))
            .expect("select")
            .into_rows()
            .expect("rows");
        rows[0]["status"].as_str().expect("status").to_string()
    }

    #[tokio::test]
    async fn offline_update_of_remote_order_hits_that_order() {
        let f = fixture();
        let (dest, result) = f
            .router
            .route_traced(&Operation::CreateOrder(order("ref-online")))
            .await
            .expect("online order");
        assert_eq!(dest, Destination::Remote);
        let online_id = result.insert_id().expect("remote id");

        f.remote.set_online(false);
        let offline_id = f
            .router
            .route(&Operation::CreateOrder(order("ref-offline")))
            .await
            .expect("offline order")
            .insert_id()
            .expect("local id");
        assert_ne!(offline_id, online_id);
        f.remote.set_online(true);
        f.engine.sync_pending_changes().await.expect("push order");
        let pushed_id = f.local.remote_order_id(offline_id).expect("read").expect("remote id");

        // The id comes from an online listing, so it names the remote order
        f.remote.set_online(false);
        crate::orders::update_order_status(&f.router, online_id, "cancelled")
            .await
            .expect("queue cancel");
        f.remote.set_online(true);
        let report = f.engine.sync_pending_changes().await.expect("push cancel");
        assert_eq!(report.pushed, 1);

        assert_eq!(remote_status(&f.remote, online_id), "cancelled");
        assert_eq!(remote_status(&f.remote, pushed_id), "pending");
        let local = f.local.order(offline_id).expect("read").expect("order");
        assert_eq!(local.status, OrderStatus::Synced);
    }

    #[tokio::test]
    async fn concurrent_pushes_replay_each_entry_once() {
        let f = fixture();
        f.remote.set_online(false);
        let local_id = f
            .router
            .route(&Operation::CreateOrder(order("ref-race")))
            .await
            .expect("order")
            .insert_id()
            .expect("id");
        f.router
            .route_sql(
                "INSERT INTO order_items (order_id, item_id, quantity, price) VALUES (?, 9, 1, 3.5)",
                &[json!(local_id)],
            )
            .await
            .expect("line");

        f.remote.set_online(true);
        f.remote.set_latency(Duration::from_millis(20));
        let (a, b) = tokio::join!(
            f.engine.sync_pending_changes(),
            f.engine.sync_pending_changes()
        );
        let (a, b) = (a.expect("first push"), b.expect("second push"));
        assert_eq!(a.pushed + b.pushed, 2);
        assert_eq!(remote_count(&f.remote, Table::Orders), 1);
        assert_eq!(remote_count(&f.remote, Table::OrderItems), 2);
        assert_eq!(f.local.pending_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn order_insert_replayed_after_lost_reply_completes() {
        let f = fixture();
        f.remote.set_online(false);
        let local_id = f
            .router
            .route_sql(
                "INSERT INTO orders (table_number, total) VALUES (?, ?)",
                &[json!(5), json!(12.0)],
            )
            .await
            .expect("order")
            .insert_id()
            .expect("id");
        let change = f.local.pending_changes().expect("pending").remove(0);

        // The remote committed the insert but the reply never arrived
        let committed = f
            .remote
            .store
            .execute(&change.payload.operation)
            .expect("remote commit")
            .insert_id()
            .expect("remote id");

        f.remote.set_online(true);
        let report = f.engine.sync_pending_changes().await.expect("replay");
        assert_eq!(report, PushReport { pushed: 1, skipped: 0, failed: 0 });
        assert_eq!(remote_count(&f.remote, Table::Orders), 1);
        assert_eq!(
            f.local.remote_order_id(local_id).expect("read"),
            Some(committed)
        );
        assert_eq!(f.local.pending_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn rejected_entry_stays_queued_and_loop_continues() {
        let f = fixture();
        f.remote.set_online(false);
        f.router
            .route(&Operation::CreateOrder(order("ref-a")))
            .await
            .expect("order a");
        let mut set = crate::query::Row::new();
        set.insert("price".into(), json!(6.0));
        f.router
            .route(&Operation::Update(Update {
                table: Table::Items,
                set,
                filters: vec![Filter {
                    column: "id".into(),
                    value: json!(7),
                }],
            }))
            .await
            .expect("menu update");
        f.router
            .route(&Operation::CreateOrder(order("ref-b")))
            .await
            .expect("order b");

        f.remote.set_online(true);
        f.remote.reject(Table::Items);
        let report = f.engine.sync_pending_changes().await.expect("push");
        assert_eq!(report, PushReport { pushed: 2, skipped: 0, failed: 1 });

        let left = f.local.pending_changes().expect("pending");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].change_type, ChangeType::MenuUpdate);
        assert_eq!(left[0].retry_count, 1);
        assert!(left[0].last_error.as_deref().unwrap_or("").contains("rejected"));

        f.remote.accept(Table::Items);
        let report = f.engine.sync_pending_changes().await.expect("retry");
        assert_eq!(report.pushed, 1);
        assert_eq!(f.local.pending_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn connectivity_loss_fails_the_push() {
        let f = fixture();
        f.remote.set_online(false);
        f.router
            .route(&Operation::CreateOrder(order("ref-c")))
            .await
            .expect("order");
        let err = f.engine.sync_pending_changes().await.unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(f.local.pending_count().expect("count"), 1);
    }

    #[tokio::test]
    async fn admins_only_sync_when_online() {
        let f = fixture();
        f.remote
            .store
            .replace_admins(&[Admin {
                id: 1,
                username: "manager".into(),
                password: bcrypt::hash("1234", 4).expect("hash"),
                photo: None,
            }])
            .expect("seed admins");

        f.remote.set_online(false);
        assert!(!f.engine.sync_admins().await.expect("offline"));
        f.remote.set_online(true);
        assert!(f.engine.sync_admins().await.expect("online"));

        let rows = f
            .local
            .execute(&Operation::Select(Select::new(Table::Admins)))
            .expect("select")
            .into_rows()
            .expect("rows");
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn full_cycle_reports_each_step() {
        let f = fixture();
        seed_remote(&f.remote);
        let mut phases = f.engine.watch_phase();
        let report = f.engine.force_sync().await;
        assert!(phases.has_changed().expect("sender alive"));
        assert!(report.succeeded(), "{report:?}");
        assert!(report.reference_synced);
        assert!(report.admins_synced);
        assert_eq!(report.push, Some(PushReport::default()));
        assert_eq!(f.engine.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn offline_cycle_fails_without_touching_queue() {
        let f = fixture();
        f.remote.set_online(false);
        f.router
            .route(&Operation::CreateOrder(order("ref-d")))
            .await
            .expect("order");
        let report = f.engine.run_cycle(SyncTrigger::Timer).await;
        assert!(!report.succeeded());
        assert!(report.push.is_none());
        assert!(matches!(f.engine.phase(), SyncPhase::Failed(_)));
        assert_eq!(f.local.pending_count().expect("count"), 1);
    }

    #[tokio::test]
    async fn reconnect_triggers_a_cycle() {
        let f = fixture();
        seed_remote(&f.remote);
        f.remote.set_online(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = f.engine.spawn(Duration::from_secs(3600), shutdown_rx);

        // Let the immediate first tick run (and fail) while offline
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.engine.last_sync_time().is_none());

        f.remote.set_online(true);
        assert!(f.network.is_online().await);

        let mirrored = tokio::time::timeout(Duration::from_secs(5), async {
            while f.engine.last_sync_time().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(mirrored.is_ok(), "reconnect did not trigger a sync");

        shutdown_tx.send(true).expect("shutdown");
        handle.await.expect("join");
    }

    #[test]
    fn phase_serializes_with_reason() {
        let value = serde_json::to_value(SyncPhase::Failed("boom".into())).expect("json");
        assert_eq!(value, json!({ "state": "failed", "reason": "boom" }));
        let value = serde_json::to_value(SyncPhase::Idle).expect("json");
        assert_eq!(value, json!({ "state": "idle" }));
    }
}
