//! Menu readers.
//!
//! Categories and items come from the remote store when reachable and from
//! the mirrored reference data otherwise. Rows that do not decode are
//! skipped rather than failing the whole menu.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::Result;
use crate::model::{from_row, Category, Item};
use crate::query::{Operation, Row, Select, Table};
use crate::router::QueryRouter;

fn decode_rows<T: DeserializeOwned>(table: Table, rows: &[Row]) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match from_row(row) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("{table}: skipping malformed row: {e}");
                None
            }
        })
        .collect()
}

/// All categories, ordered by id.
pub async fn get_categories(router: &QueryRouter) -> Result<Vec<Category>> {
    let op = Operation::Select(Select::new(Table::Categories).order_by("id", false));
    let rows = router.route(&op).await?.into_rows()?;
    Ok(decode_rows(Table::Categories, &rows))
}

/// Items ordered by name, optionally limited to one category.
pub async fn get_items(router: &QueryRouter, category_id: Option<i64>) -> Result<Vec<Item>> {
    let mut select = Select::new(Table::Items).order_by("name", false);
    if let Some(category_id) = category_id {
        select = select.filter("category_id", category_id);
    }
    let rows = router.route(&Operation::Select(select)).await?.into_rows()?;
    Ok(decode_rows(Table::Items, &rows))
}
