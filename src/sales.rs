//! Sale and refund item recording.
//!
//! Item rows and their stock adjustments land in one transaction: a sale
//! line that cannot adjust stock does not get recorded, and a recorded
//! line always has its stock movement applied. Sales decrement, refunds
//! increment, both through the stock service.

use chrono::Utc;
use rusqlite::params;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::stock::{self, StockDirection};

/// One line of a sale.
#[derive(Debug, Clone, Deserialize)]
pub struct SaleItemInput {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub quantity: i64,
    pub unit_price: f64,
}

/// One line of a refund, optionally pointing back at the sale line.
#[derive(Debug, Clone, Deserialize)]
pub struct RefundItemInput {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub quantity: i64,
    pub sale_item_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Record sale items
// ---------------------------------------------------------------------------

/// Record the item lines of a sale and decrement the affected stock.
///
/// Inserts into `sale_items`, adjusts product (and variant) stock per
/// line, and enqueues one sync entry for the batch. All of it commits or
/// rolls back together.
pub fn record_sale_items(
    db: &DbState,
    sale_id: &str,
    items: &[SaleItemInput],
) -> Result<Value, String> {
    if items.is_empty() {
        return Err("No items to record".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let batch_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        for item in items {
            conn.execute(
                "INSERT INTO sale_items (id, sale_id, product_id, variant_id, quantity, unit_price, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    sale_id,
                    item.product_id,
                    item.variant_id,
                    item.quantity,
                    item.unit_price,
                    now,
                ],
            )
            .map_err(|e| format!("insert sale item: {e}"))?;

            stock::adjust_stock(
                &conn,
                &item.product_id,
                item.variant_id.as_deref(),
                item.quantity,
                StockDirection::Sale,
            )
            .map_err(|e| e.to_string())?;
        }

        let idempotency_key = format!("sale_items:{batch_id}");
        let sync_payload = serde_json::json!({
            "saleId": sale_id,
            "items": items
                .iter()
                .map(|i| {
                    serde_json::json!({
                        "productId": i.product_id,
                        "variantId": i.variant_id,
                        "quantity": i.quantity,
                        "unitPrice": i.unit_price,
                    })
                })
                .collect::<Vec<_>>(),
        })
        .to_string();
        conn.execute(
            "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('sale_items', ?1, 'insert', ?2, ?3)",
            params![sale_id, sync_payload, idempotency_key],
        )
        .map_err(|e| format!("enqueue sale items sync: {e}"))?;

        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    info!(sale_id = %sale_id, items = items.len(), "Sale items recorded");

    Ok(serde_json::json!({
        "success": true,
        "saleId": sale_id,
        "itemCount": items.len(),
        "message": format!("Recorded {} sale item(s)", items.len()),
    }))
}

// ---------------------------------------------------------------------------
// Record refund items
// ---------------------------------------------------------------------------

/// Record the item lines of a refund and put the stock back.
pub fn record_refund_items(
    db: &DbState,
    refund_id: &str,
    items: &[RefundItemInput],
) -> Result<Value, String> {
    if items.is_empty() {
        return Err("No items to record".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let batch_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        for item in items {
            conn.execute(
                "INSERT INTO refund_items (id, refund_id, sale_item_id, product_id, variant_id, quantity, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    refund_id,
                    item.sale_item_id,
                    item.product_id,
                    item.variant_id,
                    item.quantity,
                    now,
                ],
            )
            .map_err(|e| format!("insert refund item: {e}"))?;

            stock::adjust_stock(
                &conn,
                &item.product_id,
                item.variant_id.as_deref(),
                item.quantity,
                StockDirection::Refund,
            )
            .map_err(|e| e.to_string())?;
        }

        let idempotency_key = format!("refund_items:{batch_id}");
        let sync_payload = serde_json::json!({
            "refundId": refund_id,
            "items": items
                .iter()
                .map(|i| {
                    serde_json::json!({
                        "productId": i.product_id,
                        "variantId": i.variant_id,
                        "quantity": i.quantity,
                        "saleItemId": i.sale_item_id,
                    })
                })
                .collect::<Vec<_>>(),
        })
        .to_string();
        conn.execute(
            "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('refund_items', ?1, 'insert', ?2, ?3)",
            params![refund_id, sync_payload, idempotency_key],
        )
        .map_err(|e| format!("enqueue refund items sync: {e}"))?;

        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    info!(refund_id = %refund_id, items = items.len(), "Refund items recorded");

    Ok(serde_json::json!({
        "success": true,
        "refundId": refund_id,
        "itemCount": items.len(),
        "message": format!("Recorded {} refund item(s)", items.len()),
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
