//! Stock adjustment service.
//!
//! Product and variant stock counts move whenever sale or refund items are
//! recorded, and operators can apply manual corrections through the same
//! paths. The two counters are independent tallies: a variant-only
//! correction never cascades into its parent product, and a product's
//! stock_quantity is not the sum of its variants. All arithmetic happens
//! inside SQL so concurrent writers cannot lose updates.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::db::DbState;

/// Failure modes of a single stock adjustment. Callers building batch
/// reports need to tell a missing product from a missing variant, so these
/// stay distinct instead of collapsing into one message.
#[derive(Debug, Error)]
pub enum StockError {
    #[error("Product not found: {0}")]
    ProductNotFound(String),
    #[error("Variant not found: {0}")]
    VariantNotFound(String),
    #[error("Invalid quantity {0}: must be positive")]
    InvalidQuantity(i64),
    #[error("stock update: {0}")]
    Db(#[from] rusqlite::Error),
}

/// Direction of a stock movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockDirection {
    /// Sale items leave the shelf.
    Sale,
    /// Refund items come back.
    Refund,
}

impl StockDirection {
    fn signed(self, quantity: i64) -> i64 {
        match self {
            StockDirection::Sale => -quantity,
            StockDirection::Refund => quantity,
        }
    }
}

/// One product (and optionally variant) stock movement.
#[derive(Debug, Clone, Deserialize)]
pub struct StockAdjustment {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub quantity: i64,
}

/// Result shape for bulk adjustments. External callers parse these exact
/// field names.
#[derive(Debug, Serialize)]
pub struct BulkAdjustResult {
    pub success: bool,
    pub updated_count: i64,
    pub errors: Vec<String>,
    pub message: String,
}

/// Apply one stock movement on the caller's connection.
///
/// The product row is always adjusted; the variant row is adjusted
/// additionally when `variant_id` is set. A missing product or variant is
/// a hard error so inventory drift never hides behind a silent no-op.
/// Runs inside whatever transaction the caller holds; on an error after
/// the product update, the caller's rollback undoes the partial write.
pub fn adjust_stock(
    conn: &Connection,
    product_id: &str,
    variant_id: Option<&str>,
    quantity: i64,
    direction: StockDirection,
) -> Result<(), StockError> {
    if quantity <= 0 {
        return Err(StockError::InvalidQuantity(quantity));
    }
    let delta = direction.signed(quantity);
    let now = chrono::Utc::now().to_rfc3339();

    let updated = conn.execute(
        "UPDATE products
         SET stock_quantity = stock_quantity + ?1, updated_at = ?2
         WHERE id = ?3",
        params![delta, now, product_id],
    )?;
    if updated == 0 {
        return Err(StockError::ProductNotFound(product_id.to_string()));
    }
    warn_if_negative(conn, "products", product_id);

    if let Some(vid) = variant_id {
        let updated = conn.execute(
            "UPDATE product_variants
             SET stock_quantity = stock_quantity + ?1, updated_at = ?2
             WHERE id = ?3",
            params![delta, now, vid],
        )?;
        if updated == 0 {
            return Err(StockError::VariantNotFound(vid.to_string()));
        }
        warn_if_negative(conn, "product_variants", vid);
    }

    Ok(())
}

/// Adjust a single variant's stock without touching the parent product.
/// Used for manual corrections where only the variant tally is wrong.
pub fn adjust_variant_stock(
    conn: &Connection,
    variant_id: &str,
    quantity: i64,
    direction: StockDirection,
) -> Result<(), StockError> {
    if quantity <= 0 {
        return Err(StockError::InvalidQuantity(quantity));
    }
    let delta = direction.signed(quantity);
    let now = chrono::Utc::now().to_rfc3339();

    let updated = conn.execute(
        "UPDATE product_variants
         SET stock_quantity = stock_quantity + ?1, updated_at = ?2
         WHERE id = ?3",
        params![delta, now, variant_id],
    )?;
    if updated == 0 {
        return Err(StockError::VariantNotFound(variant_id.to_string()));
    }
    warn_if_negative(conn, "product_variants", variant_id);

    Ok(())
}

/// An oversell is recorded, not blocked; it just gets flagged.
fn warn_if_negative(conn: &Connection, table: &str, id: &str) {
    let sql = format!("SELECT stock_quantity FROM {table} WHERE id = ?1");
    if let Ok(stock) = conn.query_row(&sql, params![id], |row| row.get::<_, i64>(0)) {
        if stock < 0 {
            warn!(table = %table, id = %id, stock = stock, "Stock went negative");
        }
    }
}

/// Apply a batch of stock movements, one transaction per entry.
///
/// Each entry succeeds or fails on its own: a missing product in one line
/// never aborts the rest, and a failed entry leaves none of its own writes
/// behind. Not for use inside an already-open transaction.
pub fn apply_bulk(
    db: &DbState,
    entries: &[StockAdjustment],
    direction: StockDirection,
) -> Result<BulkAdjustResult, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut updated_count: i64 = 0;
    let mut errors: Vec<String> = Vec::new();

    for entry in entries {
        match apply_one(&conn, entry, direction) {
            Ok(()) => updated_count += 1,
            Err(e) => {
                warn!(product_id = %entry.product_id, error = %e, "Stock adjustment failed");
                errors.push(e.to_string());
            }
        }
    }

    let success = errors.is_empty();
    let message = if success {
        format!("Adjusted stock for {updated_count} item(s)")
    } else {
        format!(
            "Adjusted stock for {updated_count} of {} item(s), {} failed",
            entries.len(),
            errors.len()
        )
    };

    info!(
        updated = updated_count,
        failed = errors.len(),
        "Bulk stock adjustment finished"
    );

    Ok(BulkAdjustResult {
        success,
        updated_count,
        errors,
        message,
    })
}

/// Apply a variant-only correction and report it in the bulk result shape.
pub fn apply_variant_only(
    db: &DbState,
    variant_id: &str,
    quantity: i64,
    direction: StockDirection,
) -> Result<BulkAdjustResult, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    match adjust_variant_stock(&conn, variant_id, quantity, direction) {
        Ok(()) => Ok(BulkAdjustResult {
            success: true,
            updated_count: 1,
            errors: Vec::new(),
            message: format!("Adjusted stock for variant {variant_id}"),
        }),
        Err(e) => Ok(BulkAdjustResult {
            success: false,
            updated_count: 0,
            errors: vec![e.to_string()],
            message: "Variant adjustment failed".to_string(),
        }),
    }
}

fn apply_one(
    conn: &Connection,
    entry: &StockAdjustment,
    direction: StockDirection,
) -> Result<(), StockError> {
    conn.execute_batch("BEGIN IMMEDIATE").map_err(StockError::Db)?;

    let result = adjust_stock(
        conn,
        &entry.product_id,
        entry.variant_id.as_deref(),
        entry.quantity,
        direction,
    );

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT").map_err(StockError::Db)?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA foreign_keys = ON;").expect("pragmas");
        db::run_migrations_for_test(&conn);
        conn
    }

    fn test_state(conn: Connection) -> DbState {
        DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }
    }

    fn seed_product(conn: &Connection, id: &str, stock: i64) {
        conn.execute(
            "INSERT INTO products (id, name, stock_quantity) VALUES (?1, ?2, ?3)",
            params![id, format!("Product {id}"), stock],
        )
        .expect("seed product");
    }

    fn seed_variant(conn: &Connection, id: &str, product_id: &str, stock: i64) {
        conn.execute(
            "INSERT INTO product_variants (id, product_id, name, stock_quantity)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, product_id, format!("Variant {id}"), stock],
        )
        .expect("seed variant");
    }

    fn product_stock(conn: &Connection, id: &str) -> i64 {
        conn.query_row(
            "SELECT stock_quantity FROM products WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .expect("product stock")
    }

    fn variant_stock(conn: &Connection, id: &str) -> i64 {
        conn.query_row(
            "SELECT stock_quantity FROM product_variants WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .expect("variant stock")
    }

    // ------------------------------------------------------------------
    // Single adjustments
    // ------------------------------------------------------------------

    #[test]
    fn test_sale_decrements_product_stock() {
        let conn = test_db();
        seed_product(&conn, "prod-1", 10);

        adjust_stock(&conn, "prod-1", None, 3, StockDirection::Sale).expect("adjust");
        assert_eq!(product_stock(&conn, "prod-1"), 7);
    }

    #[test]
    fn test_refund_increments_product_stock() {
        let conn = test_db();
        seed_product(&conn, "prod-1", 10);

        adjust_stock(&conn, "prod-1", None, 4, StockDirection::Refund).expect("adjust");
        assert_eq!(product_stock(&conn, "prod-1"), 14);
    }

    #[test]
    fn test_variant_sale_adjusts_both_counters() {
        let conn = test_db();
        seed_product(&conn, "prod-1", 10);
        seed_variant(&conn, "var-1", "prod-1", 5);

        adjust_stock(&conn, "prod-1", Some("var-1"), 2, StockDirection::Sale).expect("adjust");
        assert_eq!(product_stock(&conn, "prod-1"), 8);
        assert_eq!(variant_stock(&conn, "var-1"), 3);
    }

    #[test]
    fn test_variant_only_adjustment_leaves_parent_untouched() {
        let conn = test_db();
        seed_product(&conn, "prod-1", 10);
        seed_variant(&conn, "var-1", "prod-1", 5);
        seed_variant(&conn, "var-2", "prod-1", 7);

        adjust_variant_stock(&conn, "var-1", 2, StockDirection::Sale).expect("adjust");

        assert_eq!(variant_stock(&conn, "var-1"), 3);
        assert_eq!(variant_stock(&conn, "var-2"), 7);
        assert_eq!(product_stock(&conn, "prod-1"), 10, "parent must not move");
    }

    #[test]
    fn test_missing_product_is_a_hard_error() {
        let conn = test_db();

        let err = adjust_stock(&conn, "prod-missing", None, 1, StockDirection::Sale)
            .expect_err("should fail");
        assert!(matches!(err, StockError::ProductNotFound(_)));
        assert!(err.to_string().contains("prod-missing"));
    }

    #[test]
    fn test_missing_variant_is_a_hard_error() {
        let conn = test_db();
        seed_product(&conn, "prod-1", 10);

        let err = adjust_stock(&conn, "prod-1", Some("var-missing"), 1, StockDirection::Sale)
            .expect_err("should fail");
        assert!(matches!(err, StockError::VariantNotFound(_)));
        assert!(err.to_string().contains("var-missing"));
    }

    #[test]
    fn test_non_positive_quantity_is_rejected() {
        let conn = test_db();
        seed_product(&conn, "prod-1", 10);

        let err =
            adjust_stock(&conn, "prod-1", None, 0, StockDirection::Sale).expect_err("zero qty");
        assert!(matches!(err, StockError::InvalidQuantity(0)));

        let err =
            adjust_stock(&conn, "prod-1", None, -5, StockDirection::Sale).expect_err("neg qty");
        assert!(matches!(err, StockError::InvalidQuantity(-5)));
    }

    #[test]
    fn test_stock_may_go_negative() {
        let conn = test_db();
        seed_product(&conn, "prod-1", 2);

        adjust_stock(&conn, "prod-1", None, 5, StockDirection::Sale).expect("oversell recorded");
        assert_eq!(product_stock(&conn, "prod-1"), -3);
    }

    // ------------------------------------------------------------------
    // Bulk adjustments
    // ------------------------------------------------------------------

    #[test]
    fn test_bulk_applies_all_entries() {
        let conn = test_db();
        seed_product(&conn, "prod-1", 10);
        seed_product(&conn, "prod-2", 20);
        let db = test_state(conn);

        let entries = vec![
            StockAdjustment {
                product_id: "prod-1".into(),
                variant_id: None,
                quantity: 1,
            },
            StockAdjustment {
                product_id: "prod-2".into(),
                variant_id: None,
                quantity: 2,
            },
        ];

        let result = apply_bulk(&db, &entries, StockDirection::Sale).expect("bulk");
        assert!(result.success);
        assert_eq!(result.updated_count, 2);
        assert!(result.errors.is_empty());

        let conn = db.conn.lock().unwrap();
        assert_eq!(product_stock(&conn, "prod-1"), 9);
        assert_eq!(product_stock(&conn, "prod-2"), 18);
    }

    #[test]
    fn test_bulk_isolates_a_bad_entry() {
        let conn = test_db();
        seed_product(&conn, "prod-1", 10);
        seed_product(&conn, "prod-3", 30);
        let db = test_state(conn);

        let entries = vec![
            StockAdjustment {
                product_id: "prod-1".into(),
                variant_id: None,
                quantity: 1,
            },
            StockAdjustment {
                product_id: "prod-ghost".into(),
                variant_id: None,
                quantity: 1,
            },
            StockAdjustment {
                product_id: "prod-3".into(),
                variant_id: None,
                quantity: 3,
            },
        ];

        let result = apply_bulk(&db, &entries, StockDirection::Sale).expect("bulk");
        assert!(!result.success);
        assert_eq!(result.updated_count, 2);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("prod-ghost"));

        // Entries around the bad one still landed
        let conn = db.conn.lock().unwrap();
        assert_eq!(product_stock(&conn, "prod-1"), 9);
        assert_eq!(product_stock(&conn, "prod-3"), 27);
    }

    #[test]
    fn test_bulk_rolls_back_a_half_applied_entry() {
        let conn = test_db();
        seed_product(&conn, "prod-1", 10);
        let db = test_state(conn);

        // Product exists but the variant does not; the product update must
        // not survive on its own.
        let entries = vec![StockAdjustment {
            product_id: "prod-1".into(),
            variant_id: Some("var-ghost".into()),
            quantity: 2,
        }];

        let result = apply_bulk(&db, &entries, StockDirection::Sale).expect("bulk");
        assert!(!result.success);
        assert_eq!(result.updated_count, 0);
        assert!(result.errors[0].contains("var-ghost"));

        let conn = db.conn.lock().unwrap();
        assert_eq!(product_stock(&conn, "prod-1"), 10, "rolled back");
    }

    #[test]
    fn test_variant_only_wrapper_reports_bulk_shape() {
        let conn = test_db();
        seed_product(&conn, "prod-1", 10);
        seed_variant(&conn, "var-1", "prod-1", 5);
        let db = test_state(conn);

        let result =
            apply_variant_only(&db, "var-1", 1, StockDirection::Refund).expect("variant only");
        assert!(result.success);
        assert_eq!(result.updated_count, 1);

        let conn = db.conn.lock().unwrap();
        assert_eq!(variant_stock(&conn, "var-1"), 6);
        assert_eq!(product_stock(&conn, "prod-1"), 10);
    }
}
