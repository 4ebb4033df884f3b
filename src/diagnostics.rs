//! Diagnostics for the KQS POS maintenance tools.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: schema version, row counts, laybye drift, sync backlog
//! - **Diagnostics export**: packages about/health, the laybye drift report,
//!   sync backlog and recent sync errors, settings, and log files into a
//!   zip bundle for support.
//! - **Log rotation helpers**: used by `main.rs` to configure rolling log files.

use crate::db::{self, DbState};
use crate::laybye;
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use tracing::warn;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Maximum size per log file in bytes (5 MB).
pub const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsExportOptions {
    pub include_logs: bool,
    pub redact_sensitive: bool,
}

impl Default for DiagnosticsExportOptions {
    fn default() -> Self {
        Self {
            include_logs: true,
            redact_sensitive: false,
        }
    }
}

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

/// Collects system health status: schema version, row counts, sync
/// backlog, laybye drift, and database size.
pub fn get_system_health(db: &DbState) -> Result<Value, String> {
    // Collect all connection-based queries in a scoped block so the lock
    // is released before calling check_balances (which acquires its own
    // lock; std::sync::Mutex is not reentrant).
    let (
        schema_version,
        row_counts,
        sync_backlog,
        last_sync_times,
        pending_sync,
        last_reconcile_at,
        last_invoice_number,
        db_size,
    ) = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;

        let schema_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        let row_counts = get_row_counts(&conn);
        let sync_backlog = get_sync_backlog(&conn);
        let last_sync_times = get_last_sync_times(&conn);

        let pending_sync: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE status IN ('pending', 'syncing')",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        let last_reconcile_at = db::get_setting(&conn, "maintenance", "last_reconcile_at");
        let last_invoice_number = db::get_setting(&conn, "invoicing", "last_invoice_number");

        let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

        (
            schema_version,
            row_counts,
            sync_backlog,
            last_sync_times,
            pending_sync,
            last_reconcile_at,
            last_invoice_number,
            db_size,
        )
    }; // lock released here

    // Drift scan acquires its own lock
    let drift = laybye::check_balances(db, &laybye::ReconcileOptions::default())?;

    Ok(json!({
        "schemaVersion": schema_version,
        "rowCounts": row_counts,
        "laybyeDrift": {
            "scanned": drift["scanned"],
            "driftedCount": drift["driftedCount"],
        },
        "syncBacklog": sync_backlog,
        "lastSyncTimes": last_sync_times,
        "pendingSync": pending_sync,
        "lastReconcileAt": last_reconcile_at,
        "lastInvoiceNumber": last_invoice_number,
        "dbSizeBytes": db_size,
    }))
}

fn get_row_counts(conn: &Connection) -> Value {
    let laybye_active: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM laybye_orders WHERE status = 'active'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    let laybye_completed: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM laybye_orders WHERE status = 'completed'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    json!({
        "products": count_rows(conn, "products"),
        "productVariants": count_rows(conn, "product_variants"),
        "laybyeOrders": {
            "active": laybye_active,
            "completed": laybye_completed,
        },
        "laybyePayments": count_rows(conn, "laybye_payments"),
        "saleItems": count_rows(conn, "sale_items"),
        "refundItems": count_rows(conn, "refund_items"),
    })
}

fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })
    .unwrap_or(0)
}

fn get_sync_backlog(conn: &Connection) -> Value {
    // Counts from sync_queue
    let mut result = json!({});
    if let Ok(mut stmt) = conn.prepare(
        "SELECT entity_type, status, COUNT(*) FROM sync_queue GROUP BY entity_type, status",
    ) {
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .ok();
        if let Some(rows) = rows {
            for row in rows.flatten() {
                let (entity_type, status, count) = row;
                let entry = result
                    .as_object_mut()
                    .unwrap()
                    .entry(&entity_type)
                    .or_insert_with(|| json!({}));
                entry[&status] = json!(count);
            }
        }
    }
    result
}

fn get_last_sync_times(conn: &Connection) -> Value {
    let mut result = json!({});
    if let Ok(mut stmt) = conn.prepare(
        "SELECT entity_type, MAX(updated_at) FROM sync_queue WHERE status = 'synced' GROUP BY entity_type",
    ) {
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                ))
            })
            .ok();
        if let Some(rows) = rows {
            for row in rows.flatten() {
                let (entity_type, ts) = row;
                result[entity_type] = json!(ts);
            }
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Diagnostics export (zip bundle)
// ---------------------------------------------------------------------------

/// Collects diagnostics data and writes a zip file to the given directory.
/// Returns the path to the zip file.
pub fn export_diagnostics(db: &DbState, output_dir: &Path) -> Result<String, String> {
    export_diagnostics_with_options(db, output_dir, DiagnosticsExportOptions::default())
}

/// Collects diagnostics data and writes a zip file to the given directory.
/// Returns the path to the zip file.
pub fn export_diagnostics_with_options(
    db: &DbState,
    output_dir: &Path,
    export_options: DiagnosticsExportOptions,
) -> Result<String, String> {
    // Health and the drift report take their own locks; collect them
    // before holding the connection.
    let health = get_system_health(db)?;
    let drift = laybye::check_balances(db, &laybye::ReconcileOptions::default())?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let zip_name = format!("kqs-pos-diagnostics-{timestamp}.zip");
    let zip_path = output_dir.join(&zip_name);

    let file = fs::File::create(&zip_path)
        .map_err(|e| format!("Failed to create diagnostics zip: {e}"))?;
    let mut zip = zip::ZipWriter::new(file);

    let zip_options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    // 1. About info
    let about = redact_value_for_export(get_about_info(), export_options.redact_sensitive);
    zip.start_file("about.json", zip_options)
        .map_err(|e| e.to_string())?;
    zip.write_all(serde_json::to_string_pretty(&about).unwrap().as_bytes())
        .map_err(|e| e.to_string())?;

    // 2. System health
    let health = redact_value_for_export(health, export_options.redact_sensitive);
    zip.start_file("system_health.json", zip_options)
        .map_err(|e| e.to_string())?;
    zip.write_all(serde_json::to_string_pretty(&health).unwrap().as_bytes())
        .map_err(|e| e.to_string())?;

    // 3. Laybye drift report (read-only reconciler scan)
    let drift = redact_value_for_export(drift, export_options.redact_sensitive);
    zip.start_file("laybye_drift.json", zip_options)
        .map_err(|e| e.to_string())?;
    zip.write_all(serde_json::to_string_pretty(&drift).unwrap().as_bytes())
        .map_err(|e| e.to_string())?;

    // 4. Pending sync counts by entity type
    let backlog = redact_value_for_export(get_sync_backlog(&conn), export_options.redact_sensitive);
    zip.start_file("sync_backlog.json", zip_options)
        .map_err(|e| e.to_string())?;
    zip.write_all(serde_json::to_string_pretty(&backlog).unwrap().as_bytes())
        .map_err(|e| e.to_string())?;

    // 5. Last 20 sync errors
    let errors = redact_value_for_export(
        json!(get_recent_sync_errors(&conn, 20)),
        export_options.redact_sensitive,
    );
    zip.start_file("sync_errors.json", zip_options)
        .map_err(|e| e.to_string())?;
    zip.write_all(serde_json::to_string_pretty(&errors).unwrap().as_bytes())
        .map_err(|e| e.to_string())?;

    // 6. Local settings
    let settings =
        redact_value_for_export(db::get_all_settings(&conn), export_options.redact_sensitive);
    zip.start_file("settings.json", zip_options)
        .map_err(|e| e.to_string())?;
    zip.write_all(
        serde_json::to_string_pretty(&settings).unwrap().as_bytes(),
    )
    .map_err(|e| e.to_string())?;

    // 7. Include log files
    let data_dir = db
        .db_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let logs = log_dir(&data_dir);
    if export_options.include_logs && !export_options.redact_sensitive && logs.exists() {
        if let Ok(entries) = fs::read_dir(&logs) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("log")
                    || path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("kqs-pos."))
                {
                    let fname = path
                        .file_name()
                        .unwrap_or_default()
                        .to_string_lossy()
                        .to_string();
                    let zip_entry = format!("logs/{fname}");
                    if zip.start_file(&zip_entry, zip_options).is_ok() {
                        if let Ok(f) = fs::File::open(&path) {
                            let mut buf = Vec::new();
                            // Cap at 5MB per file to keep zip manageable
                            let _ = f.take(MAX_LOG_SIZE).read_to_end(&mut buf);
                            let _ = zip.write_all(&buf);
                        }
                    }
                }
            }
        }
    }

    zip.finish().map_err(|e| e.to_string())?;

    Ok(zip_path.to_string_lossy().to_string())
}

fn redact_value_for_export(value: Value, enabled: bool) -> Value {
    if !enabled {
        return value;
    }
    redact_sensitive_fields(value)
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                if should_redact_key(&key) {
                    redacted.insert(key, Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key, redact_sensitive_fields(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    // "phone" covers customer phone numbers in drift samples and settings.
    let sensitive_markers = [
        "api_key",
        "apikey",
        "secret",
        "password",
        "token",
        "authorization",
        "cookie",
        "phone",
    ];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
}

fn get_recent_sync_errors(conn: &Connection, limit: i64) -> Vec<Value> {
    let mut errors = Vec::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT id, entity_type, status, last_error, retry_count, created_at, updated_at
         FROM sync_queue
         WHERE last_error IS NOT NULL AND last_error != ''
         ORDER BY updated_at DESC LIMIT ?1",
    ) {
        if let Ok(rows) = stmt.query_map(params![limit], |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "entityType": row.get::<_, String>(1)?,
                "status": row.get::<_, String>(2)?,
                "lastError": row.get::<_, String>(3)?,
                "retryCount": row.get::<_, i64>(4)?,
                "createdAt": row.get::<_, String>(5)?,
                "updatedAt": row.get::<_, Option<String>>(6)?,
            }))
        }) {
            for row in rows.flatten() {
                errors.push(row);
            }
        }
    }
    errors
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Returns the log directory: `KQS_POS_LOG_DIR` when set, otherwise
/// `{data_dir}/logs`.
pub fn log_dir(data_dir: &Path) -> PathBuf {
    std::env::var("KQS_POS_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("logs"))
}

/// Prune old log files in `dir`, keeping only the most recent
/// `MAX_LOG_FILES`.
pub fn prune_old_logs(dir: &Path) {
    if !dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if name.starts_with("kqs-pos.") {
                        let modified = entry
                            .metadata()
                            .ok()
                            .and_then(|m| m.modified().ok())
                            .unwrap_or(std::time::UNIX_EPOCH);
                        log_files.push((path, modified));
                    }
                }
            }
        }
    }

    // Sort newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    // Remove files beyond the limit
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        assert!(info.get("version").is_some());
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
        assert!(info.get("arch").is_some());
    }

    #[test]
    #[serial]
    fn test_log_dir_env_override() {
        std::env::remove_var("KQS_POS_LOG_DIR");
        let data_dir = PathBuf::from("/tmp/kqs-store");
        assert_eq!(log_dir(&data_dir), data_dir.join("logs"));

        std::env::set_var("KQS_POS_LOG_DIR", "/var/log/kqs");
        assert_eq!(log_dir(&data_dir), PathBuf::from("/var/log/kqs"));
        std::env::remove_var("KQS_POS_LOG_DIR");
    }

    #[test]
    fn test_system_health_with_empty_db() {
        let dir = std::env::temp_dir().join(format!("diag_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let db_state = crate::db::init(&dir).unwrap();
        let health = get_system_health(&db_state).unwrap();
        assert_eq!(health["schemaVersion"], 3);
        assert_eq!(health["rowCounts"]["products"], 0);
        assert_eq!(health["laybyeDrift"]["driftedCount"], 0);
        assert!(health.get("dbSizeBytes").is_some());
        // Cleanup
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    #[serial]
    fn test_export_diagnostics_creates_zip() {
        std::env::remove_var("KQS_POS_LOG_DIR");
        let dir = std::env::temp_dir().join(format!("diag_export_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let db_state = crate::db::init(&dir).unwrap();
        let result = export_diagnostics(&db_state, &dir);
        assert!(result.is_ok());
        let zip_path = result.unwrap();
        assert!(std::path::Path::new(&zip_path).exists());
        // Verify it's a valid zip
        let file = std::fs::File::open(&zip_path).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        assert!(archive.len() >= 6); // about, health, drift, backlog, errors, settings
                                     // Cleanup
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_should_redact_key_matches_sensitive_markers() {
        assert!(should_redact_key("api_key"));
        assert!(should_redact_key("Authorization"));
        assert!(should_redact_key("customerPhone"));
        assert!(!should_redact_key("status"));
        assert!(!should_redact_key("remainingBalance"));
    }

    #[test]
    fn test_redact_sensitive_fields_recurses_through_objects() {
        let value = json!({
            "token": "tk-val",
            "nested": {
                "api_key": "key-value",
                "status": "ok"
            },
            "items": [
                { "customerPhone": "+27 82 000 0000" },
                { "name": "safe" }
            ]
        });

        let redacted = redact_sensitive_fields(value);
        assert_eq!(redacted["token"], json!("[REDACTED]"));
        assert_eq!(redacted["nested"]["api_key"], json!("[REDACTED]"));
        assert_eq!(redacted["nested"]["status"], json!("ok"));
        assert_eq!(redacted["items"][0]["customerPhone"], json!("[REDACTED]"));
        assert_eq!(redacted["items"][1]["name"], json!("safe"));
    }

    #[test]
    fn test_prune_old_logs_keeps_newest_files() {
        let dir = std::env::temp_dir().join(format!("prune_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        for i in 0..13 {
            let name = format!("kqs-pos.2026-01-{:02}", i + 1);
            std::fs::write(dir.join(name), b"log line\n").unwrap();
        }
        // A file without the prefix is never pruned
        std::fs::write(dir.join("unrelated.txt"), b"keep me\n").unwrap();

        prune_old_logs(&dir);

        let remaining: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("kqs-pos.")
            })
            .collect();
        assert_eq!(remaining.len(), MAX_LOG_FILES);
        assert!(dir.join("unrelated.txt").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
