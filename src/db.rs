//! Local SQLite store for the offline POS core.
//!
//! Uses rusqlite with WAL mode. Holds the mirrored reference data, locally
//! created orders, the pending-change log and sync bookkeeping, and
//! interprets the typed statement vocabulary when the remote store is
//! unreachable.

use chrono::{DateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::model::{
    Admin, Category, ChangeAction, ChangePayload, ChangeType, Item, NewOrder, Order, OrderLine,
    OrderStatus, PendingChange, SyncStatus,
};
use crate::query::{Filter, Insert, Operation, QueryResult, Row, Select, Table, Update};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// `sync_type` recorded by a successful reference pull.
pub const REFERENCE_SYNC: &str = "reference";

/// How the store picks ids for new order rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderIds {
    /// Negative ids, so a locally created order never shares an id with a
    /// remote one.
    Local,
    /// SQLite's own ascending rowids, as the central store hands out.
    Sequential,
}

/// True for ids minted by a store in [`OrderIds::Local`] mode.
pub fn is_local_order_id(id: i64) -> bool {
    id < 0
}

/// Durable on-device store. All access is serialised through one connection.
pub struct LocalStore {
    conn: Mutex<Option<Connection>>,
    db_path: Option<PathBuf>,
    order_ids: OrderIds,
}

impl LocalStore {
    /// Open the store at `path`, creating the parent directory if needed.
    ///
    /// On corruption or open failure, deletes the file and retries once.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        info!("Opening local store at {}", path.display());

        let conn = match open_and_configure(path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!(
                    "Local store open failed ({}), deleting and retrying once",
                    first_err
                );
                if path.exists() {
                    let _ = fs::remove_file(path);
                    // Also remove WAL/SHM files if present
                    let _ = fs::remove_file(sidecar(path, "-wal"));
                    let _ = fs::remove_file(sidecar(path, "-shm"));
                }
                open_and_configure(path).map_err(|e| {
                    error!("Local store open failed after retry: {e}");
                    e
                })?
            }
        };

        run_migrations(&conn)?;
        info!("Local store initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            db_path: Some(path.to_path_buf()),
            order_ids: OrderIds::Local,
        })
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(OrderIds::Local)
    }

    /// Open a private in-memory store with the given order id scheme.
    pub fn open_in_memory_with(order_ids: OrderIds) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            db_path: None,
            order_ids,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let conn = guard.as_mut().ok_or(CoreError::StoreClosed)?;
        f(conn)
    }

    /// Close the SQLite handle once in-flight operations finish.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| CoreError::Storage(e))?;
            info!("Local store closed");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statement interpreter
    // -----------------------------------------------------------------------

    /// Run one operation of the typed vocabulary.
    pub fn execute(&self, op: &Operation) -> Result<QueryResult> {
        let op = op.normalized();
        op.check_columns()?;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let result = run_operation(&tx, &op, self.order_ids)?;
            tx.commit()?;
            Ok(result)
        })
    }

    /// Run a write and append its pending change in one transaction.
    pub fn execute_and_enqueue(
        &self,
        op: &Operation,
        change_type: ChangeType,
    ) -> Result<QueryResult> {
        let action = match op {
            Operation::Select(_) => {
                return Err(CoreError::unsupported("a read cannot be queued for sync"))
            }
            Operation::Update(_) => ChangeAction::Update,
            Operation::Insert(_) | Operation::CreateOrder(_) => ChangeAction::Create,
        };
        let op = op.normalized();
        op.check_columns()?;
        let key = idempotency_key(&op, change_type);

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let result = run_operation(&tx, &op, self.order_ids)?;
            let payload = ChangePayload {
                operation: op.clone(),
                local_id: result.insert_id(),
            };
            insert_pending(&tx, change_type, action, &payload, &key)?;
            tx.commit()?;
            debug!(
                change_type = change_type.as_str(),
                action = action.as_str(),
                "Queued pending change"
            );
            Ok(result)
        })
    }

    // -----------------------------------------------------------------------
    // Pending-change log
    // -----------------------------------------------------------------------

    /// Append a change to the log on its own. Returns `false` when an entry
    /// with the same idempotency key is already queued.
    pub fn enqueue_change(
        &self,
        change_type: ChangeType,
        action: ChangeAction,
        payload: &ChangePayload,
        idempotency_key: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| insert_pending(conn, change_type, action, payload, idempotency_key))
    }

    /// Every queued change, oldest first. Undecodable entries are skipped.
    pub fn pending_changes(&self) -> Result<Vec<PendingChange>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, change_type, action, payload, idempotency_key, created_at,
                        retry_count, last_error
                 FROM pending_changes ORDER BY id",
            )?;
            let raw = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut changes = Vec::with_capacity(raw.len());
            for (id, ty, action, payload, key, created_at, retry_count, last_error) in raw {
                let decoded = ChangeType::parse(&ty)
                    .zip(ChangeAction::parse(&action))
                    .ok_or_else(|| CoreError::integrity(format!("unknown change {ty}/{action}")))
                    .and_then(|(change_type, action)| {
                        let payload: ChangePayload = serde_json::from_str(&payload)
                            .map_err(|e| CoreError::integrity(format!("malformed payload: {e}")))?;
                        Ok((change_type, action, payload))
                    });
                match decoded {
                    Ok((change_type, action, payload)) => changes.push(PendingChange {
                        id,
                        change_type,
                        action,
                        payload,
                        idempotency_key: key,
                        created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
                        retry_count,
                        last_error,
                    }),
                    Err(e) => warn!(change_id = id, "Skipping pending change: {e}"),
                }
            }
            Ok(changes)
        })
    }

    pub fn pending_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM pending_changes", [], |r| r.get(0))?)
        })
    }

    /// Remove a change after its remote commit. When `synced_order` is given
    /// as `(local_id, remote_id)`, the order records its remote id in the
    /// same transaction and moves from pending to synced.
    pub fn complete_change(&self, change_id: i64, synced_order: Option<(i64, i64)>) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if let Some((local_id, remote_id)) = synced_order {
                tx.execute(
                    "UPDATE orders
                     SET remote_id = ?2,
                         status = CASE WHEN status = 'pending' THEN 'synced' ELSE status END
                     WHERE id = ?1",
                    params![local_id, remote_id],
                )?;
            }
            tx.execute("DELETE FROM pending_changes WHERE id = ?1", [change_id])?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn record_change_failure(&self, change_id: i64, reason: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pending_changes SET retry_count = retry_count + 1, last_error = ?2
                 WHERE id = ?1",
                params![change_id, reason],
            )?;
            Ok(())
        })
    }

    /// Drop every queued change. Returns how many were removed.
    pub fn clear_pending_changes(&self) -> Result<usize> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM pending_changes", [])?))
    }

    // -----------------------------------------------------------------------
    // Reference data and admins
    // -----------------------------------------------------------------------

    /// Replace categories and items wholesale and stamp the sync status.
    pub fn replace_reference_data(&self, categories: &[Category], items: &[Item]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM items", [])?;
            tx.execute("DELETE FROM categories", [])?;
            {
                let mut insert_cat =
                    tx.prepare("INSERT INTO categories (id, name, image) VALUES (?1, ?2, ?3)")?;
                for c in categories {
                    insert_cat.execute(params![c.id, c.name, c.image])?;
                }
                let mut insert_item = tx.prepare(
                    "INSERT INTO items (id, name, category_id, price, image)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for i in items {
                    insert_item.execute(params![i.id, i.name, i.category_id, i.price, i.image])?;
                }
            }
            stamp_sync_status(&tx, REFERENCE_SYNC, Utc::now())?;
            tx.commit()?;
            info!(
                categories = categories.len(),
                items = items.len(),
                "Reference data replaced"
            );
            Ok(())
        })
    }

    pub fn replace_admins(&self, admins: &[Admin]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM admins", [])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO admins (id, username, password, photo) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for a in admins {
                    stmt.execute(params![a.id, a.username, a.password, a.photo])?;
                }
            }
            tx.commit()?;
            info!(admins = admins.len(), "Admin accounts replaced");
            Ok(())
        })
    }

    pub fn sync_status(&self) -> Result<Option<SyncStatus>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT last_sync, sync_type FROM sync_status WHERE id = 1",
                    [],
                    |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
                )
                .optional()?;
            Ok(row.and_then(|(last_sync, sync_type)| {
                parse_timestamp(&last_sync).map(|last_sync| SyncStatus {
                    last_sync,
                    sync_type,
                })
            }))
        })
    }

    /// Overwrite the sync status row.
    pub fn set_sync_status(&self, sync_type: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| stamp_sync_status(conn, sync_type, at))
    }

    /// Distinct non-empty image references of categories and items.
    pub fn image_references(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT image FROM categories WHERE image IS NOT NULL AND image != ''
                 UNION
                 SELECT image FROM items WHERE image IS NOT NULL AND image != ''",
            )?;
            let refs = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(refs)
        })
    }

    // -----------------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------------

    pub fn order(&self, local_id: i64) -> Result<Option<Order>> {
        self.with_conn(|conn| {
            let head = conn
                .query_row(
                    "SELECT id, client_ref, remote_id, table_number, total, status, created_at
                     FROM orders WHERE id = ?1",
                    [local_id],
                    |r| {
                        Ok((
                            r.get::<_, i64>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, Option<i64>>(2)?,
                            r.get::<_, Option<u32>>(3)?,
                            r.get::<_, f64>(4)?,
                            r.get::<_, String>(5)?,
                            r.get::<_, String>(6)?,
                        ))
                    },
                )
                .optional()?;
            let Some((id, client_ref, remote_id, table_number, total, status, created_at)) = head
            else {
                return Ok(None);
            };
            let status = OrderStatus::parse(&status)
                .ok_or_else(|| CoreError::integrity(format!("unknown order status `{status}`")))?;

            let mut stmt = conn.prepare(
                "SELECT item_id, quantity, price FROM order_items
                 WHERE order_id = ?1 ORDER BY position, id",
            )?;
            let lines = stmt
                .query_map([id], |r| {
                    Ok(OrderLine {
                        item_id: r.get(0)?,
                        quantity: r.get(1)?,
                        unit_price: r.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(Some(Order {
                id,
                client_ref,
                remote_id,
                table_number,
                total,
                status,
                created_at,
                lines,
            }))
        })
    }

    /// Remote id assigned to a local order, once it has been pushed.
    pub fn remote_order_id(&self, local_id: i64) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let id = conn
                .query_row(
                    "SELECT remote_id FROM orders WHERE id = ?1",
                    [local_id],
                    |r| r.get::<_, Option<i64>>(0),
                )
                .optional()?;
            Ok(id.flatten())
        })
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        debug!("Local schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating local store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: mirrored reference data and orders.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            image TEXT
        );

        -- category_id is not a foreign key: orphaned items are tolerated
        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            category_id INTEGER NOT NULL,
            price REAL NOT NULL DEFAULT 0 CHECK (price >= 0),
            image TEXT
        );

        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            client_ref TEXT NOT NULL UNIQUE,
            remote_id INTEGER,
            table_number INTEGER,
            total REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'synced', 'cancelled')),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS order_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id INTEGER NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            position INTEGER NOT NULL DEFAULT 0,
            item_id INTEGER NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity >= 1),
            price REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS admins (
            id INTEGER PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password TEXT NOT NULL,
            photo TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_items_category ON items(category_id);
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        CoreError::Storage(e)
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: pending-change log and sync bookkeeping.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pending_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            change_type TEXT NOT NULL,
            action TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );

        CREATE TABLE IF NOT EXISTS sync_status (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_sync TEXT NOT NULL,
            sync_type TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        CoreError::Storage(e)
    })?;

    info!("Applied migration v2");
    Ok(())
}

// ---------------------------------------------------------------------------
// Interpreter internals
// ---------------------------------------------------------------------------

fn idempotency_key(op: &Operation, change_type: ChangeType) -> String {
    let client_ref = match op {
        Operation::CreateOrder(order) => Some(order.client_ref.as_str()),
        Operation::Insert(insert) if insert.table == Table::Orders => {
            insert.row.get("client_ref").and_then(Value::as_str)
        }
        _ => None,
    };
    match client_ref {
        Some(client_ref) => format!("{}:create:{client_ref}", change_type.as_str()),
        None => format!("{}:{}", change_type.as_str(), uuid::Uuid::new_v4()),
    }
}

fn insert_pending(
    conn: &Connection,
    change_type: ChangeType,
    action: ChangeAction,
    payload: &ChangePayload,
    idempotency_key: &str,
) -> Result<bool> {
    let payload = serde_json::to_string(payload)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO pending_changes
            (change_type, action, payload, idempotency_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            change_type.as_str(),
            action.as_str(),
            payload,
            idempotency_key,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(inserted > 0)
}

fn stamp_sync_status(conn: &Connection, sync_type: &str, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_status (id, last_sync, sync_type) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET last_sync = excluded.last_sync,
                                       sync_type = excluded.sync_type",
        params![at.to_rfc3339(), sync_type],
    )?;
    Ok(())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn run_operation(conn: &Connection, op: &Operation, ids: OrderIds) -> Result<QueryResult> {
    match op {
        Operation::Select(select) => run_select(conn, select).map(QueryResult::Rows),
        Operation::Insert(insert) => run_insert(conn, insert, ids),
        Operation::Update(update) => run_update(conn, update),
        Operation::CreateOrder(order) => {
            insert_new_order(conn, order, ids).map(|insert_id| QueryResult::Inserted { insert_id })
        }
    }
}

fn order_id_by_client_ref(conn: &Connection, client_ref: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM orders WHERE client_ref = ?1",
            [client_ref],
            |r| r.get(0),
        )
        .optional()?)
}

/// Next id for a new order row, or `None` to let SQLite assign it.
fn next_order_id(conn: &Connection, ids: OrderIds) -> Result<Option<i64>> {
    match ids {
        OrderIds::Sequential => Ok(None),
        OrderIds::Local => {
            let id = conn.query_row(
                "SELECT min(COALESCE(MIN(id), 0), 0) - 1 FROM orders",
                [],
                |r| r.get(0),
            )?;
            Ok(Some(id))
        }
    }
}

fn where_clause(
    filters: &[Filter],
    first_param: usize,
    sql: &mut String,
    values: &mut Vec<SqlValue>,
) {
    for (i, filter) in filters.iter().enumerate() {
        sql.push_str(if i == 0 { " WHERE " } else { " AND " });
        if filter.value.is_null() {
            sql.push_str(&format!("{} IS NULL", filter.column));
        } else {
            sql.push_str(&format!("{} = ?{}", filter.column, first_param + values.len()));
            values.push(to_sql(&filter.value));
        }
    }
}

fn run_select(conn: &Connection, select: &Select) -> Result<Vec<Row>> {
    let columns = if select.columns.is_empty() {
        "*".to_string()
    } else {
        select.columns.join(", ")
    };
    let mut sql = format!("SELECT {columns} FROM {}", select.table.name());
    let mut values = Vec::new();
    where_clause(&select.filters, 1, &mut sql, &mut values);
    if let Some(order) = &select.order_by {
        let dir = if order.descending { "DESC" } else { "ASC" };
        sql.push_str(&format!(" ORDER BY {} {dir}", order.column));
    }
    if let Some(limit) = select.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let rows = stmt
        .query_map(params_from_iter(values.iter()), |r| {
            let mut row = Row::new();
            for (i, name) in names.iter().enumerate() {
                row.insert(name.clone(), from_sql(r.get_ref(i)?));
            }
            Ok(row)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn run_insert(conn: &Connection, insert: &Insert, ids: OrderIds) -> Result<QueryResult> {
    if insert.row.is_empty() {
        return Err(CoreError::unsupported("INSERT without columns"));
    }
    let mut row = insert.row.clone();
    if insert.table == Table::Orders {
        if let Some(client_ref) = row.get("client_ref").and_then(Value::as_str) {
            if let Some(id) = order_id_by_client_ref(conn, client_ref)? {
                debug!(order_id = id, "Order already stored, skipping insert");
                return Ok(QueryResult::Inserted { insert_id: id });
            }
        }
        if !row.contains_key("id") {
            if let Some(id) = next_order_id(conn, ids)? {
                row.insert("id".into(), Value::from(id));
            }
        }
    }

    let columns: Vec<&str> = row.keys().map(String::as_str).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        insert.table.name(),
        columns.join(", "),
        placeholders.join(", ")
    );
    let values: Vec<SqlValue> = row.values().map(to_sql).collect();
    conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(QueryResult::Inserted {
        insert_id: conn.last_insert_rowid(),
    })
}

fn run_update(conn: &Connection, update: &Update) -> Result<QueryResult> {
    if update.set.is_empty() || update.filters.is_empty() {
        return Err(CoreError::unsupported("UPDATE needs SET columns and a WHERE clause"));
    }
    let mut values: Vec<SqlValue> = Vec::new();
    let assignments: Vec<String> = update
        .set
        .iter()
        .map(|(column, value)| {
            values.push(to_sql(value));
            format!("{column} = ?{}", values.len())
        })
        .collect();
    let mut sql = format!("UPDATE {} SET {}", update.table.name(), assignments.join(", "));
    where_clause(&update.filters, 1, &mut sql, &mut values);
    let affected = conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(QueryResult::Updated {
        affected: affected as u64,
    })
}

/// Insert an order and its lines. Idempotent on `client_ref`: an existing
/// order with the same reference is returned as-is.
fn insert_new_order(conn: &Connection, order: &NewOrder, ids: OrderIds) -> Result<i64> {
    if let Some(id) = order_id_by_client_ref(conn, &order.client_ref)? {
        debug!(order_id = id, "Order already stored, skipping insert");
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO orders (id, client_ref, table_number, total, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            next_order_id(conn, ids)?,
            order.client_ref,
            order.table_number,
            order.total,
            order.status.as_str(),
            order.created_at.to_rfc3339()
        ],
    )?;
    let order_id = conn.last_insert_rowid();

    let mut stmt = conn.prepare(
        "INSERT INTO order_items (order_id, position, item_id, quantity, price)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (position, line) in order.lines.iter().enumerate() {
        stmt.execute(params![
            order_id,
            position as i64,
            line.item_id,
            line.quantity,
            line.unit_price
        ])?;
    }
    Ok(order_id)
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            Value::String(String::from_utf8_lossy(t).into_owned())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
