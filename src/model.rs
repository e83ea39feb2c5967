//! Domain records shared by the store, router and sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::query::{Operation, Row};

/// Tolerance used when comparing money amounts.
pub const MONEY_TOLERANCE: f64 = 0.01;

/// Round an amount to cents.
pub fn round_money(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Decode a typed record from a result row.
pub fn from_row<T: serde::de::DeserializeOwned>(row: &Row) -> Result<T> {
    serde_json::from_value(Value::Object(row.clone()))
        .map_err(|e| CoreError::integrity(format!("malformed row: {e}")))
}

/// Remote drivers hand back DECIMAL columns as strings ("5.00").
pub(crate) fn de_lenient_f64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<f64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| serde::de::Error::custom(format!("expected a decimal, got {value}")))
}

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub name: String,
    pub category_id: i64,
    #[serde(deserialize_with = "de_lenient_f64")]
    pub price: f64,
    #[serde(default)]
    pub image: Option<String>,
}

/// Admin account as mirrored from the remote store. `password` is a bcrypt hash.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Admin {
    pub id: i64,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub photo: Option<String>,
}

impl std::fmt::Debug for Admin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admin")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("photo", &self.photo)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Synced,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "synced" => Some(Self::Synced),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub item_id: i64,
    pub quantity: u32,
    #[serde(deserialize_with = "de_lenient_f64")]
    pub unit_price: f64,
}

/// An order ready to be written, with its lines, as one unit.
///
/// `client_ref` is minted once at creation and identifies the order in both
/// stores; replays of the same order are deduplicated on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub client_ref: String,
    #[serde(default)]
    pub table_number: Option<u32>,
    pub total: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub lines: Vec<OrderLine>,
}

/// An order as stored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    pub client_ref: String,
    pub remote_id: Option<i64>,
    pub table_number: Option<u32>,
    pub total: f64,
    pub status: OrderStatus,
    pub created_at: String,
    pub lines: Vec<OrderLine>,
}

// ---------------------------------------------------------------------------
// Pending changes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeType {
    Order,
    OrderItem,
    MenuUpdate,
    AdminUpdate,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::OrderItem => "order-item",
            Self::MenuUpdate => "menu-update",
            Self::AdminUpdate => "admin-update",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "order" => Some(Self::Order),
            "order-item" | "order_item" => Some(Self::OrderItem),
            "menu-update" | "menu" => Some(Self::MenuUpdate),
            "admin-update" | "admin" => Some(Self::AdminUpdate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" | "insert" => Some(Self::Create),
            "update" => Some(Self::Update),
            _ => None,
        }
    }
}

/// What a pending change replays: the normalised operation that ran
/// locally, and the local row id it produced (for inserts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePayload {
    pub operation: Operation,
    #[serde(default)]
    pub local_id: Option<i64>,
}

/// One entry of the append-only pending-change log.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub id: i64,
    pub change_type: ChangeType,
    pub action: ChangeAction,
    pub payload: ChangePayload,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: i64,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Sync bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub last_sync: DateTime<Utc>,
    pub sync_type: String,
}

/// Cached image metadata, keyed by filename in the asset manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub url: String,
    pub hash: String,
    pub size: u64,
    pub last_sync: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    #[test]
    fn item_accepts_decimal_strings() {
        let item: Item = from_row(&row(json!({
            "id": 7,
            "name": "Espresso",
            "category_id": 2,
            "price": "5.00",
            "image": null
        })))
        .expect("decode item");
        assert_eq!(item.price, 5.0);
        assert_eq!(item.image, None);
    }

    #[test]
    fn malformed_row_is_an_integrity_error() {
        let err = from_row::<Category>(&row(json!({ "name": "Drinks" }))).unwrap_err();
        assert!(matches!(err, CoreError::Integrity(_)));
    }

    #[test]
    fn admin_debug_redacts_hash() {
        let admin = Admin {
            id: 1,
            username: "root".into(),
            password: "$2b$04$secret".into(),
            photo: None,
        };
        assert!(!format!("{admin:?}").contains("secret"));
    }

    #[test]
    fn change_type_names_round_trip() {
        for ty in [
            ChangeType::Order,
            ChangeType::OrderItem,
            ChangeType::MenuUpdate,
            ChangeType::AdminUpdate,
        ] {
            assert_eq!(ChangeType::parse(ty.as_str()), Some(ty));
        }
    }
}
