//! KQS POS - Back-office maintenance tools
//!
//! Library behind the `kqs-pos-tools` binary. One module per concern of
//! the store database: schema and settings (`db`), invoice numbering
//! (`invoice`), the laybye ledger and its balance reconciler (`laybye`),
//! stock movements (`stock`), sale/refund item recording (`sales`), and
//! health/export diagnostics (`diagnostics`).

pub mod db;
pub mod diagnostics;
pub mod invoice;
pub mod laybye;
pub mod sales;
pub mod stock;
