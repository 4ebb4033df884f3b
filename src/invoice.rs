//! Invoice number generation.
//!
//! Invoice numbers are positional: a fixed 5-character prefix, the issue
//! date as DDMMYY, then a zero-padded daily sequence. `KQSPD12052601` is
//! the first invoice of 12 May 2026. Receipt printouts and the reporting
//! exports parse these strings by position, so the layout is a
//! compatibility contract: prefix width 5, date width 6, sequence width 2
//! (the sequence grows to 3 digits past 99).

use chrono::{Local, NaiveDate};
use rusqlite::Connection;
use tracing::debug;

use crate::db;

pub const INVOICE_PREFIX: &str = "KQSPD";

const SETTING_CATEGORY: &str = "invoicing";
const SETTING_KEY: &str = "last_invoice_number";

/// Generate the invoice number that follows `last_number` on `date`.
///
/// The sequence continues only when `last_number` is well-formed and its
/// date part matches `date`; anything else (first invoice ever, a new
/// day, a malformed value) restarts the sequence at 01. An unparseable
/// sequence tail counts as 0, so the next number is 01.
pub fn generate_invoice_number(last_number: Option<&str>, date: NaiveDate) -> String {
    let date_part = date.format("%d%m%y").to_string();

    let next_seq = last_number
        .filter(|last| last.len() >= 12)
        .filter(|last| last.get(5..11) == Some(date_part.as_str()))
        .map(|last| {
            // Only the trailing two characters feed the sequence.
            let tail = last.get(last.len() - 2..).unwrap_or("");
            tail.parse::<u32>().unwrap_or(0) + 1
        })
        .unwrap_or(1);

    format!("{INVOICE_PREFIX}{date_part}{next_seq:02}")
}

/// Mint the next invoice number and persist it as the new high-water mark.
///
/// Reads `invoicing/last_invoice_number` from settings, generates the
/// successor for today's local date, and writes it back inside one
/// `BEGIN IMMEDIATE` bracket. A second connection minting against the
/// same store file blocks until the commit and then continues from the
/// committed number instead of reissuing it.
pub fn next_invoice_number(conn: &Connection) -> Result<String, String> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    match next_invoice_number_in_tx(conn) {
        Ok(number) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            Ok(number)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Mint inside a transaction the caller already holds, so the counter
/// update commits or rolls back together with the caller's writes.
/// Laybye order creation assigns order numbers this way.
pub fn next_invoice_number_in_tx(conn: &Connection) -> Result<String, String> {
    let last = db::get_setting(conn, SETTING_CATEGORY, SETTING_KEY);
    let number = generate_invoice_number(last.as_deref(), Local::now().date_naive());
    db::set_setting(conn, SETTING_CATEGORY, SETTING_KEY, &number)?;
    debug!(invoice_number = %number, "Minted invoice number");
    Ok(number)
}

/// Preview the next invoice number without persisting it.
pub fn peek_invoice_number(conn: &Connection) -> String {
    let last = db::get_setting(conn, SETTING_CATEGORY, SETTING_KEY);
    generate_invoice_number(last.as_deref(), Local::now().date_naive())
}

// ===========================================================================
// Tests
// ===========================================================================
