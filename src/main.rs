//! Command-line entry point for the KQS POS maintenance tools.
//!
//! Operates directly on a store's local SQLite database. Every command
//! is attempt-once: it runs, prints its result as JSON (or a plain
//! value) on stdout, and exits. Logs go to stderr and, unless
//! `--no-log-file` is given, to a daily-rolling file under the data
//! directory.

use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kqs_pos_tools::{db, diagnostics, invoice, laybye, stock};

#[derive(Parser, Debug)]
#[command(
    name = "kqs-pos-tools",
    version,
    about = "KQS POS back-office maintenance tools"
)]
struct Cli {
    /// Store data directory holding kqs-pos.db and logs/.
    #[arg(long, env = "KQS_POS_DATA_DIR")]
    data_dir: PathBuf,

    /// Log to stderr only, skipping the rolling log file.
    #[arg(long)]
    no_log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Laybye order maintenance.
    Laybye {
        #[command(subcommand)]
        command: LaybyeCommand,
    },
    /// Invoice number sequence.
    Invoice {
        #[command(subcommand)]
        command: InvoiceCommand,
    },
    /// Stock level corrections.
    Stock {
        #[command(subcommand)]
        command: StockCommand,
    },
    /// Print schema version, row counts, and store health numbers.
    Stats,
    /// Package diagnostics into a zip bundle under the data directory.
    ExportDiagnostics {
        /// Leave log files out of the bundle.
        #[arg(long)]
        no_logs: bool,
        /// Replace sensitive values (keys, tokens, phone numbers).
        #[arg(long)]
        redact: bool,
    },
}

#[derive(Subcommand, Debug)]
enum LaybyeCommand {
    /// Report balance drift without changing anything.
    Check(ScanArgs),
    /// Recompute and persist drifted balances.
    Fix(FixArgs),
    /// Print one order with its payment history.
    Show { laybye_id: String },
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Restrict the run to one laybye order id.
    #[arg(long)]
    laybye_id: Option<String>,

    /// Only orders created at or after this timestamp.
    #[arg(long)]
    since: Option<String>,

    /// Only orders created at or before this timestamp.
    #[arg(long)]
    until: Option<String>,
}

impl ScanArgs {
    fn into_options(self, dry_run: bool) -> laybye::ReconcileOptions {
        laybye::ReconcileOptions {
            laybye_id: self.laybye_id,
            since: self.since,
            until: self.until,
            dry_run,
        }
    }
}

#[derive(Args, Debug)]
struct FixArgs {
    #[command(flatten)]
    scan: ScanArgs,

    /// Compute and log corrections without writing them.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum InvoiceCommand {
    /// Mint the next invoice number, advancing the stored sequence.
    Next {
        /// Show the next number without advancing the sequence.
        #[arg(long)]
        peek: bool,
    },
}

#[derive(Subcommand, Debug)]
enum StockCommand {
    /// Apply one manual stock movement.
    Adjust {
        /// Product to adjust. At least one of --product-id/--variant-id
        /// is required.
        #[arg(long)]
        product_id: Option<String>,

        /// Variant to adjust alongside (or instead of) the product.
        #[arg(long)]
        variant_id: Option<String>,

        /// Unit count, always positive; the direction decides the sign.
        #[arg(long)]
        quantity: i64,

        /// Movement direction.
        #[arg(value_enum)]
        direction: Direction,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Direction {
    /// Stock leaves the shelf.
    Sale,
    /// Stock comes back.
    Refund,
}

impl From<Direction> for stock::StockDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Sale => stock::StockDirection::Sale,
            Direction::Refund => stock::StockDirection::Refund,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.data_dir, cli.no_log_file);
    info!("Starting kqs-pos-tools v{}", env!("CARGO_PKG_VERSION"));

    let db_state = db::init(&cli.data_dir).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Laybye { command } => match command {
            LaybyeCommand::Check(scan) => {
                let report = laybye::check_balances(&db_state, &scan.into_options(false))
                    .map_err(anyhow::Error::msg)?;
                print_json(&report)?;
            }
            LaybyeCommand::Fix(args) => {
                let dry_run = args.dry_run;
                run_laybye_fix(&db_state, args.scan.into_options(dry_run))?;
            }
            LaybyeCommand::Show { laybye_id } => {
                let order = laybye::get_laybye_order(&db_state, &laybye_id)
                    .map_err(anyhow::Error::msg)?;
                print_json(&order)?;
            }
        },
        Commands::Invoice { command } => match command {
            InvoiceCommand::Next { peek } => {
                let conn = db_state
                    .conn
                    .lock()
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                let number = if peek {
                    invoice::peek_invoice_number(&conn)
                } else {
                    invoice::next_invoice_number(&conn).map_err(anyhow::Error::msg)?
                };
                println!("{number}");
            }
        },
        Commands::Stock { command } => match command {
            StockCommand::Adjust {
                product_id,
                variant_id,
                quantity,
                direction,
            } => {
                let result = match (product_id, variant_id) {
                    (Some(product_id), variant_id) => stock::apply_bulk(
                        &db_state,
                        &[stock::StockAdjustment {
                            product_id,
                            variant_id,
                            quantity,
                        }],
                        direction.into(),
                    ),
                    (None, Some(variant_id)) => stock::apply_variant_only(
                        &db_state,
                        &variant_id,
                        quantity,
                        direction.into(),
                    ),
                    (None, None) => bail!("provide --product-id or --variant-id"),
                }
                .map_err(anyhow::Error::msg)?;
                let success = result.success;
                print_json(&result)?;
                if !success {
                    bail!("stock adjustment failed");
                }
            }
        },
        Commands::Stats => {
            let health =
                diagnostics::get_system_health(&db_state).map_err(anyhow::Error::msg)?;
            print_json(&health)?;
        }
        Commands::ExportDiagnostics { no_logs, redact } => {
            let options = diagnostics::DiagnosticsExportOptions {
                include_logs: !no_logs,
                redact_sensitive: redact,
            };
            let path =
                diagnostics::export_diagnostics_with_options(&db_state, &cli.data_dir, options)
                    .map_err(anyhow::Error::msg)?;
            println!("{path}");
        }
    }

    Ok(())
}

/// Run `laybye fix`: print the summary, then fail the process when any
/// order could not be reconciled, so scripted runs see a nonzero exit.
fn run_laybye_fix(
    db_state: &db::DbState,
    options: laybye::ReconcileOptions,
) -> anyhow::Result<()> {
    let summary = laybye::reconcile_balances(db_state, &options).map_err(anyhow::Error::msg)?;
    let error_count = summary.error_count;
    print_json(&summary)?;
    if error_count > 0 {
        bail!("{error_count} laybye order(s) failed to reconcile");
    }
    Ok(())
}

/// Initialize structured logging: stderr always, plus a daily-rolling
/// file under the log directory unless disabled.
fn init_logging(data_dir: &Path, no_log_file: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kqs_pos_tools=debug"));

    // JSON results go to stdout; keeping logs on stderr leaves piped
    // output parseable.
    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    if no_log_file {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        return;
    }

    // Prune old log files before setting up the appender
    let log_dir = diagnostics::log_dir(data_dir);
    std::fs::create_dir_all(&log_dir).ok();
    diagnostics::prune_old_logs(&log_dir);

    let file_appender = tracing_appender::rolling::daily(&log_dir, "kqs-pos");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Dropping the guard flushes buffered log lines; keep it for the
    // lifetime of the process.
    std::mem::forget(guard);
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_cli_parses_laybye_fix_flags() {
        let cli = Cli::try_parse_from([
            "kqs-pos-tools",
            "--data-dir",
            "/tmp/store",
            "laybye",
            "fix",
            "--laybye-id",
            "lb-1",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/store"));
        match cli.command {
            Commands::Laybye {
                command: LaybyeCommand::Fix(args),
            } => {
                assert_eq!(args.scan.laybye_id.as_deref(), Some("lb-1"));
                assert!(args.dry_run);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_laybye_check_date_range() {
        let cli = Cli::try_parse_from([
            "kqs-pos-tools",
            "--data-dir",
            "/tmp/store",
            "laybye",
            "check",
            "--since",
            "2026-01-01",
            "--until",
            "2026-06-30",
        ])
        .unwrap();
        match cli.command {
            Commands::Laybye {
                command: LaybyeCommand::Check(scan),
            } => {
                assert_eq!(scan.since.as_deref(), Some("2026-01-01"));
                assert_eq!(scan.until.as_deref(), Some("2026-06-30"));
                assert!(scan.laybye_id.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_stock_adjust_direction() {
        let cli = Cli::try_parse_from([
            "kqs-pos-tools",
            "--data-dir",
            "/tmp/store",
            "stock",
            "adjust",
            "--product-id",
            "prod-1",
            "--quantity",
            "3",
            "refund",
        ])
        .unwrap();
        match cli.command {
            Commands::Stock {
                command:
                    StockCommand::Adjust {
                        product_id,
                        variant_id,
                        quantity,
                        direction,
                    },
            } => {
                assert_eq!(product_id.as_deref(), Some("prod-1"));
                assert!(variant_id.is_none());
                assert_eq!(quantity, 3);
                assert!(matches!(direction, Direction::Refund));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_cli_reads_data_dir_from_env() {
        std::env::set_var("KQS_POS_DATA_DIR", "/tmp/env-store");
        let cli = Cli::try_parse_from(["kqs-pos-tools", "stats"]).unwrap();
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/env-store"));
        std::env::remove_var("KQS_POS_DATA_DIR");
    }

    #[test]
    #[serial]
    fn test_cli_rejects_missing_data_dir() {
        std::env::remove_var("KQS_POS_DATA_DIR");
        assert!(Cli::try_parse_from(["kqs-pos-tools", "stats"]).is_err());
    }

    #[test]
    fn test_cli_rejects_unknown_direction() {
        let result = Cli::try_parse_from([
            "kqs-pos-tools",
            "--data-dir",
            "/tmp/store",
            "stock",
            "adjust",
            "--product-id",
            "prod-1",
            "--quantity",
            "3",
            "void",
        ]);
        assert!(result.is_err());
    }

    // ------------------------------------------------------------------
    // Run paths
    // ------------------------------------------------------------------

    #[test]
    fn test_laybye_fix_run_fails_on_reconcile_errors() {
        let dir = std::env::temp_dir().join(format!("cli_fix_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let db_state = db::init(&dir).expect("init store");
        for total in [100.0, 250.0] {
            laybye::create_laybye_order(&db_state, &serde_json::json!({ "totalAmount": total }))
                .expect("create laybye order");
        }

        // A healthy store reconciles without failing the run
        run_laybye_fix(&db_state, laybye::ReconcileOptions::default()).expect("clean run");

        {
            let conn = db_state.conn.lock().unwrap();
            conn.execute_batch("DROP TABLE laybye_payments")
                .expect("drop payment ledger");
        }

        let err = run_laybye_fix(&db_state, laybye::ReconcileOptions::default())
            .expect_err("ledger failures must fail the run");
        assert!(err.to_string().contains("failed to reconcile"));

        // Cleanup
        let _ = std::fs::remove_dir_all(&dir);
    }
}
