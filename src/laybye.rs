//! Laybye (layaway) ledger and balance reconciliation.
//!
//! A laybye order reserves goods against a deposit; the customer then pays
//! the rest in instalments recorded as append-only `laybye_payments` rows.
//! The outstanding balance is always derivable from the ledger:
//!
//! ```text
//! remaining = max(0, total_amount - deposit_amount - sum(payments))
//! ```
//!
//! `laybye_orders.remaining_balance` stores that value so list queries stay
//! cheap, and `status` follows it (`completed` exactly when nothing is left
//! to pay). Other writers share this database and have historically left
//! the stored balance out of step with the ledger, so `reconcile_balances`
//! recomputes and repairs the drift. Serialized order payloads also carry
//! `remainingAmount`, a read-only alias of the same value kept for older
//! report consumers.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::invoice;

/// Stored balances within one cent of the ledger are left alone.
pub const BALANCE_TOLERANCE: f64 = 0.01;

/// Scope and mode of a reconciliation run.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Restrict the run to a single order.
    pub laybye_id: Option<String>,
    /// Only orders created at or after this timestamp.
    pub since: Option<String>,
    /// Only orders created at or before this timestamp.
    pub until: Option<String>,
    /// Compute and report fixes without writing anything.
    pub dry_run: bool,
}

/// Outcome of a reconciliation run. In a dry run `fixedCount` counts the
/// orders that would have been corrected.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub fixed_count: i64,
    pub error_count: i64,
    pub total_processed: i64,
    pub dry_run: bool,
    /// One corrected order, post-fix, for spot verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<Value>,
}

struct OrderRow {
    id: String,
    order_number: Option<String>,
    total_amount: f64,
    deposit_amount: f64,
    remaining_balance: f64,
}

impl OrderRow {
    fn label(&self) -> &str {
        self.order_number.as_deref().unwrap_or(&self.id)
    }
}

/// The one formula everything else derives from.
pub fn correct_balance(total: f64, deposit: f64, payments: f64) -> f64 {
    (total - deposit - payments).max(0.0)
}

/// Status follows the balance.
pub fn status_for(balance: f64) -> &'static str {
    if balance <= 0.0 {
        "completed"
    } else {
        "active"
    }
}

// ---------------------------------------------------------------------------
// Create laybye order
// ---------------------------------------------------------------------------

/// Create a laybye order.
///
/// Validates the amounts, assigns the next invoice number as the order
/// number, computes the opening balance from the deposit, and enqueues a
/// sync entry. Everything lands in one transaction.
pub fn create_laybye_order(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let customer_name =
        str_field(payload, "customerName").or_else(|| str_field(payload, "customer_name"));
    let customer_phone =
        str_field(payload, "customerPhone").or_else(|| str_field(payload, "customer_phone"));
    let notes = str_field(payload, "notes");
    let total_amount = num_field(payload, "totalAmount")
        .or_else(|| num_field(payload, "total_amount"))
        .ok_or("Missing totalAmount")?;
    if total_amount < 0.0 {
        return Err("totalAmount must not be negative".into());
    }
    let deposit_amount = num_field(payload, "depositAmount")
        .or_else(|| num_field(payload, "deposit_amount"))
        .unwrap_or(0.0);
    if deposit_amount < 0.0 || deposit_amount > total_amount {
        return Err("depositAmount must be between 0 and totalAmount".into());
    }

    let laybye_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let balance = correct_balance(total_amount, deposit_amount, 0.0);
    let status = status_for(balance);

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<String, String> {
        // The invoice counter update joins this transaction, so an order
        // number is never burned by a failed insert.
        let order_number = invoice::next_invoice_number_in_tx(&conn)?;

        conn.execute(
            "INSERT INTO laybye_orders (
                id, order_number, customer_name, customer_phone,
                total_amount, deposit_amount, remaining_balance,
                status, notes, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                laybye_id,
                order_number,
                customer_name,
                customer_phone,
                total_amount,
                deposit_amount,
                balance,
                status,
                notes,
                now,
            ],
        )
        .map_err(|e| format!("insert laybye order: {e}"))?;

        let idempotency_key = format!("laybye_order:{laybye_id}");
        let sync_payload = serde_json::json!({
            "laybyeId": laybye_id,
            "orderNumber": order_number,
            "customerName": customer_name,
            "customerPhone": customer_phone,
            "totalAmount": total_amount,
            "depositAmount": deposit_amount,
            "remainingBalance": balance,
            "remainingAmount": balance,
            "status": status,
            "createdAt": now,
        })
        .to_string();
        conn.execute(
            "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('laybye_order', ?1, 'insert', ?2, ?3)",
            params![laybye_id, sync_payload, idempotency_key],
        )
        .map_err(|e| format!("enqueue laybye order sync: {e}"))?;

        Ok(order_number)
    })();

    let order_number = match result {
        Ok(n) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            n
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    info!(
        laybye_id = %laybye_id,
        order_number = %order_number,
        total = total_amount,
        deposit = deposit_amount,
        "Laybye order created"
    );

    Ok(serde_json::json!({
        "success": true,
        "laybyeId": laybye_id,
        "orderNumber": order_number,
        "remainingBalance": balance,
        "remainingAmount": balance,
        "status": status,
    }))
}

// ---------------------------------------------------------------------------
// Record laybye payment
// ---------------------------------------------------------------------------

/// Record an instalment against a laybye order.
///
/// Inserts the payment row, recomputes the balance from the full ledger
/// (never by subtracting from the stored value, which may already be
/// stale), updates the order, and enqueues a sync entry, all in one
/// transaction. Overpayment is accepted and clamps the balance at zero.
pub fn record_laybye_payment(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let laybye_id = str_field(payload, "laybyeId")
        .or_else(|| str_field(payload, "laybye_id"))
        .ok_or("Missing laybyeId")?;
    let amount = num_field(payload, "amount").ok_or("Missing amount")?;
    if amount <= 0.0 {
        return Err("Amount must be positive".into());
    }
    let method = str_field(payload, "method").unwrap_or_else(|| "cash".to_string());
    if !matches!(method.as_str(), "cash" | "card" | "transfer" | "other") {
        return Err(format!(
            "Invalid method: {method}. Must be cash, card, transfer, or other"
        ));
    }
    let reference = str_field(payload, "reference");

    let payment_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(f64, &'static str), String> {
        let (total_amount, deposit_amount): (f64, f64) = conn
            .query_row(
                "SELECT total_amount, deposit_amount FROM laybye_orders WHERE id = ?1",
                params![laybye_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|_| format!("Laybye order not found: {laybye_id}"))?;

        conn.execute(
            "INSERT INTO laybye_payments (id, laybye_id, amount, method, reference, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![payment_id, laybye_id, amount, method, reference, now],
        )
        .map_err(|e| format!("insert laybye payment: {e}"))?;

        let paid = ledger_total(&conn, &laybye_id)?;
        let balance = correct_balance(total_amount, deposit_amount, paid);
        let status = status_for(balance);

        conn.execute(
            "UPDATE laybye_orders
             SET remaining_balance = ?1, status = ?2, updated_at = ?3
             WHERE id = ?4",
            params![balance, status, now, laybye_id],
        )
        .map_err(|e| format!("update laybye balance: {e}"))?;

        let idempotency_key = format!("laybye_payment:{payment_id}");
        let sync_payload = serde_json::json!({
            "paymentId": payment_id,
            "laybyeId": laybye_id,
            "amount": amount,
            "method": method,
            "reference": reference,
            "remainingBalance": balance,
            "remainingAmount": balance,
            "status": status,
        })
        .to_string();
        conn.execute(
            "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('laybye_payment', ?1, 'insert', ?2, ?3)",
            params![payment_id, sync_payload, idempotency_key],
        )
        .map_err(|e| format!("enqueue laybye payment sync: {e}"))?;

        Ok((balance, status))
    })();

    let (balance, status) = match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            v
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    info!(
        payment_id = %payment_id,
        laybye_id = %laybye_id,
        amount = %amount,
        balance = %balance,
        "Laybye payment recorded"
    );

    Ok(serde_json::json!({
        "success": true,
        "paymentId": payment_id,
        "laybyeId": laybye_id,
        "remainingBalance": balance,
        "remainingAmount": balance,
        "status": status,
        "message": format!("Payment of {:.2} recorded", amount),
    }))
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Get one laybye order with its payment history.
pub fn get_laybye_order(db: &DbState, laybye_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut order = order_json(&conn, laybye_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, amount, method, reference, created_at
             FROM laybye_payments
             WHERE laybye_id = ?1
             ORDER BY created_at ASC",
        )
        .map_err(|e| e.to_string())?;
    let payments: Vec<Value> = stmt
        .query_map(params![laybye_id], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "amount": row.get::<_, f64>(1)?,
                "method": row.get::<_, String>(2)?,
                "reference": row.get::<_, Option<String>>(3)?,
                "createdAt": row.get::<_, String>(4)?,
            }))
        })
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();

    if let Value::Object(ref mut map) = order {
        map.insert("payments".into(), Value::Array(payments));
    }

    Ok(order)
}

// ---------------------------------------------------------------------------
// Balance check (read-only)
// ---------------------------------------------------------------------------

/// Report orders whose stored balance disagrees with the ledger, without
/// writing anything. The read-only sibling of [`reconcile_balances`],
/// with the same per-order error handling: a failure reading one order's
/// ledger is counted and skipped, never aborting the scan.
pub fn check_balances(db: &DbState, options: &ReconcileOptions) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let orders = load_candidate_orders(&conn, options)?;

    let mut drifted: Vec<Value> = Vec::new();
    let mut error_count = 0i64;
    for order in &orders {
        let paid = match ledger_total(&conn, &order.id) {
            Ok(paid) => paid,
            Err(e) => {
                error_count += 1;
                warn!(order = %order.label(), error = %e, "Skipping laybye order after error");
                continue;
            }
        };
        let correct = correct_balance(order.total_amount, order.deposit_amount, paid);
        if (correct - order.remaining_balance).abs() > BALANCE_TOLERANCE {
            drifted.push(serde_json::json!({
                "laybyeId": order.id,
                "orderNumber": order.order_number,
                "storedBalance": order.remaining_balance,
                "correctBalance": correct,
                "difference": correct - order.remaining_balance,
                "correctStatus": status_for(correct),
            }));
        }
    }

    info!(
        scanned = orders.len(),
        drifted = drifted.len(),
        errors = error_count,
        "Laybye balance check finished"
    );

    Ok(serde_json::json!({
        "success": true,
        "scanned": orders.len(),
        "driftedCount": drifted.len(),
        "errorCount": error_count,
        "drifted": drifted,
    }))
}

// ---------------------------------------------------------------------------
// Balance reconciliation
// ---------------------------------------------------------------------------

/// Recompute every candidate order's balance from its payment ledger and
/// repair the stored value where it drifted by more than one cent.
///
/// Each order is corrected inside its own transaction; a failure on one
/// order is logged and counted but never halts the batch, and nothing is
/// retried. Corrections re-derive `status`, stamp `updated_at`, and
/// enqueue a sync entry so the till software pushes the fix upstream.
pub fn reconcile_balances(
    db: &DbState,
    options: &ReconcileOptions,
) -> Result<ReconcileSummary, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let orders = load_candidate_orders(&conn, options)?;
    info!(
        candidates = orders.len(),
        dry_run = options.dry_run,
        "Laybye balance reconciliation started"
    );

    let mut summary = ReconcileSummary {
        fixed_count: 0,
        error_count: 0,
        total_processed: 0,
        dry_run: options.dry_run,
        sample: None,
    };
    let mut sample_id: Option<String> = None;

    for order in &orders {
        summary.total_processed += 1;
        match reconcile_one(&conn, &order.id, options.dry_run) {
            Ok(Some((stored, correct))) => {
                summary.fixed_count += 1;
                if sample_id.is_none() {
                    sample_id = Some(order.id.clone());
                }
                if options.dry_run {
                    info!(
                        order = %order.label(),
                        stored = stored,
                        correct = correct,
                        "Laybye balance drift found (dry run)"
                    );
                } else {
                    info!(
                        order = %order.label(),
                        stored = stored,
                        correct = correct,
                        "Corrected laybye balance"
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                summary.error_count += 1;
                warn!(order = %order.label(), error = %e, "Skipping laybye order after error");
            }
        }
    }

    if !options.dry_run {
        db::set_setting(&conn, "maintenance", "last_reconcile_at", &Utc::now().to_rfc3339())?;
        if let Some(ref id) = sample_id {
            summary.sample = order_json(&conn, id).ok();
        }
    }

    info!(
        fixed = summary.fixed_count,
        errors = summary.error_count,
        processed = summary.total_processed,
        "Laybye balance reconciliation finished"
    );

    Ok(summary)
}

/// Reconcile a single order. Returns `Some((stored, correct))` when the
/// balance was (or, in a dry run, would be) rewritten.
fn reconcile_one(
    conn: &Connection,
    laybye_id: &str,
    dry_run: bool,
) -> Result<Option<(f64, f64)>, String> {
    if dry_run {
        let (total, deposit, stored) = read_order_amounts(conn, laybye_id)?;
        let paid = ledger_total(conn, laybye_id)?;
        let correct = correct_balance(total, deposit, paid);
        if (correct - stored).abs() > BALANCE_TOLERANCE {
            return Ok(Some((stored, correct)));
        }
        return Ok(None);
    }

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<Option<(f64, f64)>, String> {
        // Re-read inside the transaction; the stored balance may have
        // moved since the candidate scan.
        let (total, deposit, stored) = read_order_amounts(conn, laybye_id)?;
        let paid = ledger_total(conn, laybye_id)?;
        let correct = correct_balance(total, deposit, paid);

        if (correct - stored).abs() <= BALANCE_TOLERANCE {
            return Ok(None);
        }

        let status = status_for(correct);
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE laybye_orders
             SET remaining_balance = ?1, status = ?2, updated_at = ?3
             WHERE id = ?4",
            params![correct, status, now, laybye_id],
        )
        .map_err(|e| format!("update laybye balance: {e}"))?;

        let idempotency_key = format!("laybye_balance:{laybye_id}:{now}");
        let sync_payload = serde_json::json!({
            "laybyeId": laybye_id,
            "remainingBalance": correct,
            "remainingAmount": correct,
            "status": status,
            "correctedAt": now,
        })
        .to_string();
        conn.execute(
            "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('laybye_order', ?1, 'update', ?2, ?3)",
            params![laybye_id, sync_payload, idempotency_key],
        )
        .map_err(|e| format!("enqueue balance correction: {e}"))?;

        Ok(Some((stored, correct)))
    })();

    match result {
        Ok(outcome) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            Ok(outcome)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_candidate_orders(
    conn: &Connection,
    options: &ReconcileOptions,
) -> Result<Vec<OrderRow>, String> {
    let mut sql = String::from(
        "SELECT id, order_number, total_amount, deposit_amount, remaining_balance
         FROM laybye_orders",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut filters: Vec<String> = Vec::new();

    if let Some(ref id) = options.laybye_id {
        clauses.push("id = ?");
        filters.push(id.clone());
    }
    if let Some(ref since) = options.since {
        clauses.push("created_at >= ?");
        filters.push(since.clone());
    }
    if let Some(ref until) = options.until {
        clauses.push("created_at <= ?");
        filters.push(until.clone());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at ASC");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| format!("prepare candidate scan: {e}"))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(filters.iter()), |row| {
            Ok(OrderRow {
                id: row.get(0)?,
                order_number: row.get(1)?,
                total_amount: row.get(2)?,
                deposit_amount: row.get(3)?,
                remaining_balance: row.get(4)?,
            })
        })
        .map_err(|e| format!("scan laybye orders: {e}"))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(rows)
}

fn read_order_amounts(conn: &Connection, laybye_id: &str) -> Result<(f64, f64, f64), String> {
    conn.query_row(
        "SELECT total_amount, deposit_amount, remaining_balance
         FROM laybye_orders WHERE id = ?1",
        params![laybye_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
    .map_err(|_| format!("Laybye order not found: {laybye_id}"))
}

fn ledger_total(conn: &Connection, laybye_id: &str) -> Result<f64, String> {
    conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM laybye_payments WHERE laybye_id = ?1",
        params![laybye_id],
        |row| row.get(0),
    )
    .map_err(|e| format!("sum laybye payments: {e}"))
}

fn order_json(conn: &Connection, laybye_id: &str) -> Result<Value, String> {
    conn.query_row(
        "SELECT id, order_number, customer_name, customer_phone, total_amount,
                deposit_amount, remaining_balance, status, notes, created_at, updated_at
         FROM laybye_orders WHERE id = ?1",
        params![laybye_id],
        |row| {
            let balance: f64 = row.get(6)?;
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "orderNumber": row.get::<_, Option<String>>(1)?,
                "customerName": row.get::<_, Option<String>>(2)?,
                "customerPhone": row.get::<_, Option<String>>(3)?,
                "totalAmount": row.get::<_, f64>(4)?,
                "depositAmount": row.get::<_, f64>(5)?,
                "remainingBalance": balance,
                "remainingAmount": balance,
                "status": row.get::<_, String>(7)?,
                "notes": row.get::<_, Option<String>>(8)?,
                "createdAt": row.get::<_, String>(9)?,
                "updatedAt": row.get::<_, String>(10)?,
            }))
        },
    )
    .map_err(|_| format!("Laybye order not found: {laybye_id}"))
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(String::from)
}

fn num_field(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

// ===========================================================================
// Tests
// ===========================================================================
