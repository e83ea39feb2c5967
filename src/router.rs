//! Remote-first routing with local fallback.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info};

use crate::api::RemoteStore;
use crate::db::LocalStore;
use crate::error::{CoreError, Result};
use crate::query::{parse_statement, Operation, QueryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Remote,
    Local,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

pub struct QueryRouter {
    remote: Arc<dyn RemoteStore>,
    local: Arc<LocalStore>,
    query_timeout: Duration,
}

impl QueryRouter {
    pub fn new(remote: Arc<dyn RemoteStore>, local: Arc<LocalStore>, query_timeout: Duration) -> Self {
        Self {
            remote,
            local,
            query_timeout,
        }
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub async fn route(&self, op: &Operation) -> Result<QueryResult> {
        self.route_traced(op).await.map(|(_, result)| result)
    }

    /// Route an operation, also reporting where it ran.
    ///
    /// The remote store is always tried first, whatever the cached network
    /// status says. Any remote failure falls back to the local store; a
    /// write that lands locally is queued for replay in the same transaction.
    pub async fn route_traced(&self, op: &Operation) -> Result<(Destination, QueryResult)> {
        let op = op.normalized();
        let description = op.describe();

        match self.remote(&op).await {
            Ok(result) => {
                debug!(op = %description, destination = "remote", "Routed operation");
                Ok((Destination::Remote, result))
            }
            Err(e) if e.is_remote_failure() => {
                info!(
                    op = %description,
                    destination = "local",
                    reason = %e,
                    "Remote store failed, falling back to local store"
                );
                let result = match op.fallback_change()? {
                    None => self.local.execute(&op)?,
                    Some((change_type, _)) => self.local.execute_and_enqueue(&op, change_type)?,
                };
                Ok((Destination::Local, result))
            }
            Err(e) => Err(e),
        }
    }

    /// Parse a statement of the supported vocabulary and route it.
    pub async fn route_sql(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let op = parse_statement(sql, params)?;
        self.route(&op).await
    }

    /// Remote-only execution under the query timeout.
    pub async fn remote(&self, op: &Operation) -> Result<QueryResult> {
        match time::timeout(self.query_timeout, self.remote.execute(op)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::connectivity(format!(
                "remote query timed out after {} ms",
                self.query_timeout.as_millis()
            ))),
        }
    }
}
