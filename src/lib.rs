// lib.rs
//! # RESQL
//!
//! Crawler-to-SQL loading library for MSSQL warehouses. Crawlers hand over
//! whatever shape they scraped (a table, a matrix, a flat row, a mapping)
//! and `resql` materializes it, diffs it against stored history, and writes
//! only the rows that actually changed, with duplicate removal, audit
//! monitoring and database-mail notifications around every load.
//!
//! ## `table_utils`
//!
//! - **Purpose**: Materialize heterogeneous crawler payloads into a uniform rectangular table.
//! - **Features**:
//!   - **Table**: A named-column string grid with CSV load/save, previews and HTML rendering.
//!   - **DataSource**: The four accepted payload shapes, decided once at the boundary.
//!   - **normalize**: Shape classification, rejection of unrecognisable payloads, and uniform ingestion-timestamp stamping.
//!   - **Type inference**: Best-effort per-column scalar kinds (text, integer, float, timestamp) driving generated DDL.
//!
//! ## `sql_utils`
//!
//! - **Purpose**: Talk to SQL Server and generate every statement the pipeline needs.
//! - **Features**:
//!   - **SqlConnection**: A tiberius-backed session with fail-fast connect, query-to-table streaming and chunked writes.
//!   - **SqlSession**: The adapter contract the pipeline runs against, so loads are testable without a server.
//!   - **SQL builders**: Windowed CTE duplicate delete, rn = 1 history select, HOLDLOCK MERGE upsert, and CREATE/INSERT generation. All identifiers are allow-listed, never spliced raw.
//!   - **Monitoring**: Append-only audit rows in `Info.MonitoringTable` after every load attempt.
//!
//! ## `diff_utils`
//!
//! - **Purpose**: Compute the minimal set of new or changed rows for a load.
//! - **Features**:
//!   - Outer join of incoming rows against the canonical stored row per identity partition.
//!   - Rounding-based numeric comparison at a configurable precision, never exact float equality.
//!   - A 50-row preview projection (identity + old value + new value) for notification emails.
//!
//! ## `loader_utils`
//!
//! - **Purpose**: Orchestrate the whole load: normalize, diff, write, dedupe, monitor, notify.
//! - **Features**:
//!   - **SqlLoader::load**: The change-only load pipeline with schema creation and rollback.
//!   - **upsert / truncate_and_upload / upload**: Direct MERGE, full-replace and plain-append loading modes.
//!   - **remove_duplicates**: Standalone duplicate resolution with a replace/keep-old policy.
//!   - **LoadConfig**: Explicit per-load configuration (value columns, crawl-date column, varchar width, keep policy), JSON round-trippable.
//!
//! ## `mail_utils`
//!
//! - **Purpose**: Tell humans what happened without ever breaking the pipeline.
//! - **Features**:
//!   - **Notifier**: Process-wide enable flag, recipient list, swallowed transport failures.
//!   - **DbMail**: Delivery through `msdb.dbo.sp_send_dbmail` on the warehouse itself.
//!   - Event subjects matching the crawler conventions ("New data added to ...", "Crawler Error").
//!
//! ## `error_utils`
//!
//! - **Purpose**: The error taxonomy of the pipeline.
//! - **Features**: Connection, query, schema-mismatch, shape, value-column, deduplication, identifier and configuration failures. All fatal, none retried.
//!
//! ## License
//!
//! This project is licensed under the MIT License.

pub mod diff_utils;
pub mod error_utils;
pub mod loader_utils;
pub mod mail_utils;
pub mod sql_utils;
pub mod table_utils;
