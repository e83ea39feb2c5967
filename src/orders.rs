//! Order placement and lookup.
//!
//! Every call goes through the router, so an order taken while the central
//! server is down lands in the local store and is replayed later.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::model::{
    de_lenient_f64, from_row, round_money, NewOrder, OrderLine, OrderStatus, MONEY_TOLERANCE,
};
use crate::query::{Filter, Operation, QueryResult, Select, Table, Update};
use crate::router::QueryRouter;

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequestLine {
    pub item_id: i64,
    pub quantity: u32,
    #[serde(alias = "item_price", alias = "price")]
    pub unit_price: f64,
}

/// An order as submitted by the till.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub items: Vec<OrderRequestLine>,
    #[serde(default)]
    pub table_number: Option<u32>,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderConfirmation {
    pub order_id: i64,
    pub status: String,
}

/// Optional filters for [`get_orders`]. Date bounds are inclusive; a bare
/// `date_to` date covers that whole day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderFilter {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub date_from: Option<String>,
    #[serde(default)]
    pub date_to: Option<String>,
}

/// Order header row, from whichever store answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: i64,
    #[serde(default)]
    pub table_number: Option<i64>,
    #[serde(deserialize_with = "de_lenient_f64")]
    pub total: f64,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(req: &OrderRequest) -> Result<()> {
    if req.items.is_empty() {
        return Err(CoreError::validation("An order needs at least one item"));
    }
    for line in &req.items {
        if line.quantity == 0 {
            return Err(CoreError::validation(format!(
                "Item {} has a zero quantity",
                line.item_id
            )));
        }
        if !line.unit_price.is_finite() || line.unit_price < 0.0 {
            return Err(CoreError::validation(format!(
                "Item {} has an invalid price",
                line.item_id
            )));
        }
    }
    if req.table_number == Some(0) {
        return Err(CoreError::validation("Table number must be positive"));
    }
    if !req.total.is_finite() {
        return Err(CoreError::validation("Order total is not a number"));
    }

    let lines_total: f64 = req
        .items
        .iter()
        .map(|l| l.unit_price * f64::from(l.quantity))
        .sum();
    if (req.total - lines_total).abs() > MONEY_TOLERANCE + f64::EPSILON {
        return Err(CoreError::validation(format!(
            "Order total {:.2} does not match its items ({:.2})",
            req.total, lines_total
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Validate and place an order. The order and its lines are written as one
/// unit, to the remote store when reachable and locally otherwise.
pub async fn create_order(router: &QueryRouter, req: &OrderRequest) -> Result<OrderConfirmation> {
    validate(req)?;

    let order = NewOrder {
        client_ref: uuid::Uuid::new_v4().to_string(),
        table_number: req.table_number,
        total: round_money(req.total),
        status: OrderStatus::Pending,
        created_at: Utc::now(),
        lines: req
            .items
            .iter()
            .map(|l| OrderLine {
                item_id: l.item_id,
                quantity: l.quantity,
                unit_price: round_money(l.unit_price),
            })
            .collect(),
    };
    let client_ref = order.client_ref.clone();

    let (destination, result) = router.route_traced(&Operation::CreateOrder(order)).await?;
    let order_id = result
        .insert_id()
        .ok_or_else(|| CoreError::integrity("order insert returned no id"))?;

    info!(
        order_id,
        client_ref = %client_ref,
        destination = destination.as_str(),
        lines = req.items.len(),
        "Order created"
    );
    Ok(OrderConfirmation {
        order_id,
        status: "success".to_string(),
    })
}

/// List orders, newest first.
pub async fn get_orders(router: &QueryRouter, filter: &OrderFilter) -> Result<Vec<OrderSummary>> {
    let from = filter
        .date_from
        .as_deref()
        .map(|raw| parse_bound(raw, false))
        .transpose()?;
    let to = filter
        .date_to
        .as_deref()
        .map(|raw| parse_bound(raw, true))
        .transpose()?;

    let mut select = Select::new(Table::Orders).order_by("created_at", true);
    if let Some(status) = filter.status.as_deref().filter(|s| !s.trim().is_empty()) {
        select = select.filter("status", status.trim());
    }

    let rows = router.route(&Operation::Select(select)).await?.into_rows()?;
    let mut orders = Vec::with_capacity(rows.len());
    for row in &rows {
        let summary: OrderSummary = match from_row(row) {
            Ok(s) => s,
            Err(e) => {
                warn!("Skipping malformed order row: {e}");
                continue;
            }
        };
        if from.is_some() || to.is_some() {
            let Some(at) = summary.created_at.as_deref().and_then(parse_timestamp) else {
                continue;
            };
            if from.is_some_and(|f| at < f) || to.is_some_and(|t| at > t) {
                continue;
            }
        }
        orders.push(summary);
    }
    Ok(orders)
}

/// Change an order's status. Returns the number of rows touched.
///
/// `synced` is owned by the sync engine and cannot be set from here.
pub async fn update_order_status(router: &QueryRouter, order_id: i64, status: &str) -> Result<u64> {
    let status = OrderStatus::parse(status)
        .ok_or_else(|| CoreError::validation(format!("Unknown order status '{status}'")))?;
    if status == OrderStatus::Synced {
        return Err(CoreError::validation("Orders cannot be marked synced by hand"));
    }

    let mut set = serde_json::Map::new();
    set.insert("status".into(), status.as_str().into());
    let update = Update {
        table: Table::Orders,
        set,
        filters: vec![Filter {
            column: "id".into(),
            value: order_id.into(),
        }],
    };

    match router.route(&Operation::Update(update)).await? {
        QueryResult::Updated { affected } => {
            info!(order_id, status = %status, affected, "Order status updated");
            Ok(affected)
        }
        other => Err(CoreError::integrity(format!(
            "unexpected update result {other:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

fn parse_bound(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if end_of_day {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            if let Some(end) = date.and_hms_opt(23, 59, 59) {
                return Ok(end.and_utc());
            }
        }
    }
    parse_timestamp(trimmed).ok_or_else(|| CoreError::validation(format!("Invalid date '{raw}'")))
}
