// loader_utils.rs
use crate::diff_utils::{compute_change_set, old_value_column, ChangeSet, PREVIEW_ROWS};
use crate::error_utils::LoadError;
use crate::mail_utils::{Notifier, NotifyEvent};
use crate::sql_utils::{
    quote_ident, table_spec, write_monitoring, KeepPolicy, MonitoringRecord, SqlColumn,
    SqlSession, WriteMode,
};
use crate::table_utils::{infer_column_kinds, normalize, DataSource, Table};
use serde::{Deserialize, Serialize};

fn default_value_columns() -> Vec<String> {
    vec!["Value".to_string()]
}

fn default_crawldate_column() -> String {
    "CrawlDate".to_string()
}

fn default_keep_policy() -> KeepPolicy {
    KeepPolicy::KeepOldest
}

fn default_precision() -> u32 {
    3
}

fn default_max_varchar() -> usize {
    255
}

/// Everything one load operation needs to know about its target, passed in
/// explicitly rather than held as process-wide state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    pub schema_name: String,
    pub table_name: String,
    /// Column names for payload shapes that carry none of their own.
    #[serde(default)]
    pub column_names: Vec<String>,
    /// Measurement columns, excluded from identity comparison. The first one
    /// is the column the diff engine compares.
    #[serde(default = "default_value_columns")]
    pub value_columns: Vec<String>,
    #[serde(default = "default_crawldate_column")]
    pub crawldate_column: String,
    #[serde(default = "default_keep_policy")]
    pub keep_policy: KeepPolicy,
    /// True skips the duplicate resolution pass entirely.
    #[serde(default)]
    pub skip_duplicates_check: bool,
    /// Decimal places at which two values count as equal.
    #[serde(default = "default_precision")]
    pub precision: u32,
    /// Width of generated NVARCHAR columns, hard ceiling 1023.
    #[serde(default = "default_max_varchar")]
    pub max_varchar: usize,
}

impl LoadConfig {
    pub fn new(schema_name: &str, table_name: &str) -> Self {
        LoadConfig {
            schema_name: schema_name.to_string(),
            table_name: table_name.to_string(),
            column_names: Vec::new(),
            value_columns: default_value_columns(),
            crawldate_column: default_crawldate_column(),
            keep_policy: default_keep_policy(),
            skip_duplicates_check: false,
            precision: default_precision(),
            max_varchar: default_max_varchar(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, LoadError> {
        serde_json::from_str(raw).map_err(|e| LoadError::Config(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, LoadError> {
        serde_json::to_string_pretty(self).map_err(|e| LoadError::Config(e.to_string()))
    }

    /// Checks identifier and varchar bounds before anything touches the
    /// database.
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.max_varchar == 0 || self.max_varchar > 1023 {
            return Err(LoadError::VarcharSize(self.max_varchar));
        }
        quote_ident(&self.schema_name)?;
        quote_ident(&self.table_name)?;
        quote_ident(&self.crawldate_column)?;
        for name in self.column_names.iter().chain(self.value_columns.iter()) {
            quote_ident(name)?;
        }
        Ok(())
    }
}

/// Outcome of one load operation.
#[derive(Debug, Clone)]
pub struct LoadResult {
    /// Net row delta observed at the target table.
    pub rows_added: i64,
    /// Columns added to the destination to fit the payload.
    pub new_columns: Vec<String>,
    /// The change-set preview (identity columns + old and new value), capped
    /// at 50 rows.
    pub change_preview: Table,
}

/// Drives the load pipeline: normalize, diff, change-only write, duplicate
/// resolution, monitoring and notification. One loader per target table;
/// loads against the same table must be serialized by the caller.
pub struct SqlLoader {
    config: LoadConfig,
    notifier: Notifier,
}

impl SqlLoader {
    pub fn new(config: LoadConfig, notifier: Notifier) -> Self {
        SqlLoader { config, notifier }
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Loads a payload into the target table, writing only rows whose value
    /// actually changed against stored history.
    ///
    /// On any fatal error this rolls back a schema created within this
    /// operation, records a failed monitoring row, notifies the recipients
    /// and re-raises. An empty change set is a success with `rows_added == 0`
    /// and no upload notification.
    pub async fn load<S: SqlSession>(
        &self,
        session: &mut S,
        source: DataSource,
    ) -> Result<LoadResult, LoadError> {
        self.config.validate()?;
        let mut schema_created = false;
        let outcome = self.run_load(session, source, &mut schema_created).await;
        match outcome {
            Ok(result) => Ok(result),
            Err(error) => {
                if schema_created {
                    self.rollback_schema(session).await;
                }
                self.report_failure(session, &error).await;
                Err(error)
            }
        }
    }

    async fn run_load<S: SqlSession>(
        &self,
        session: &mut S,
        source: DataSource,
        schema_created: &mut bool,
    ) -> Result<LoadResult, LoadError> {
        let cfg = &self.config;

        let incoming = normalize(source, &cfg.column_names, &cfg.crawldate_column)?;

        let existing = session
            .table_columns(&cfg.schema_name, &cfg.table_name)
            .await?;
        let total_columns = existing.len().max(incoming.headers().len());
        if cfg.value_columns.len() >= total_columns {
            return Err(LoadError::InvalidValueColumns {
                value_columns: cfg.value_columns.len(),
                total_columns,
            });
        }

        if !session.schema_exists(&cfg.schema_name).await? {
            session.create_schema(&cfg.schema_name).await?;
            *schema_created = true;
            tracing::info!(schema = %cfg.schema_name, "created new schema in DB");
            self.notifier
                .notify(
                    NotifyEvent::SchemaCreated,
                    &cfg.schema_name,
                    &format!(
                        "<p>Schema {} was created for table {}.</p>",
                        cfg.schema_name, cfg.table_name
                    ),
                )
                .await;
        }

        let table_exists = !existing.is_empty();
        let before = session.row_count(&cfg.schema_name, &cfg.table_name).await?;

        let identity_columns: Vec<String> = incoming
            .headers()
            .iter()
            .filter(|h| !cfg.value_columns.contains(*h) && **h != cfg.crawldate_column)
            .cloned()
            .collect();

        let change = self
            .diff_against_history(session, &incoming, &identity_columns, before)
            .await?;

        if change.is_empty() {
            tracing::info!(table = %cfg.table_name, "no new data");
            write_monitoring(
                session,
                &MonitoringRecord::new(&cfg.schema_name, &cfg.table_name, 0, true),
            )
            .await?;
            return Ok(LoadResult {
                rows_added: 0,
                new_columns: Vec::new(),
                change_preview: change.preview,
            });
        }

        let mut new_columns = Vec::new();
        if !table_exists {
            session
                .table_to_sql(
                    &change.rows,
                    &cfg.schema_name,
                    &cfg.table_name,
                    WriteMode::Replace,
                    cfg.max_varchar,
                )
                .await?;
        } else {
            let kinds = infer_column_kinds(&change.rows);
            for (i, header) in change.rows.headers().iter().enumerate() {
                if !existing.iter().any(|c| &c.name == header) {
                    session
                        .add_column(
                            &cfg.schema_name,
                            &cfg.table_name,
                            header,
                            &kinds[i].sql_type(cfg.max_varchar),
                        )
                        .await?;
                    new_columns.push(header.clone());
                }
            }
            session
                .table_to_sql(
                    &change.rows,
                    &cfg.schema_name,
                    &cfg.table_name,
                    WriteMode::Append,
                    cfg.max_varchar,
                )
                .await?;
        }

        if !cfg.skip_duplicates_check {
            let partition = self.partition_columns(session).await?;
            session
                .dedupe(
                    &cfg.schema_name,
                    &cfg.table_name,
                    &partition,
                    &cfg.crawldate_column,
                    cfg.keep_policy,
                )
                .await?;
        }

        let after = session.row_count(&cfg.schema_name, &cfg.table_name).await?;
        let rows_added = after as i64 - before as i64;
        write_monitoring(
            session,
            &MonitoringRecord::new(&cfg.schema_name, &cfg.table_name, rows_added, true),
        )
        .await?;

        let mut text = format!(
            "{} rows added to: {}. Before: {} rows, after: {} rows.",
            rows_added, cfg.table_name, before, after
        );
        if !new_columns.is_empty() {
            text.push_str(&format!(
                " Also added following new columns: {}",
                new_columns.join(", ")
            ));
        }
        tracing::info!(table = %cfg.table_name, rows_added, "{}", text);

        if rows_added != 0 {
            let body = format!("{}<br><br>{}", text, change.preview.to_html(PREVIEW_ROWS));
            self.notifier
                .notify(NotifyEvent::UploadSucceeded, &cfg.table_name, &body)
                .await;
        }

        Ok(LoadResult {
            rows_added,
            new_columns,
            change_preview: change.preview,
        })
    }

    /// Computes the change set for the incoming rows. With no prior rows (or
    /// no declared value column) everything is new.
    async fn diff_against_history<S: SqlSession>(
        &self,
        session: &mut S,
        incoming: &Table,
        identity_columns: &[String],
        stored_rows: u64,
    ) -> Result<ChangeSet, LoadError> {
        let cfg = &self.config;
        let value_column = match cfg.value_columns.first() {
            Some(c) => c,
            None => {
                return Ok(ChangeSet {
                    rows: incoming.clone(),
                    preview: incoming.head(PREVIEW_ROWS),
                })
            }
        };

        let old = if stored_rows > 0 && !identity_columns.is_empty() {
            session
                .latest_rows(
                    &cfg.schema_name,
                    &cfg.table_name,
                    identity_columns,
                    value_column,
                    &cfg.crawldate_column,
                    cfg.keep_policy,
                )
                .await?
        } else {
            let mut headers = identity_columns.to_vec();
            headers.push(old_value_column(value_column));
            Table::from_raw_data(headers, Vec::new())
        };

        compute_change_set(incoming, &old, identity_columns, value_column, cfg.precision)
    }

    /// Identity columns of the stored table: everything except the declared
    /// value columns and the ingestion timestamp. Fails when no identity
    /// column would remain.
    async fn partition_columns<S: SqlSession>(
        &self,
        session: &mut S,
    ) -> Result<Vec<String>, LoadError> {
        let cfg = &self.config;
        let columns = session
            .table_columns(&cfg.schema_name, &cfg.table_name)
            .await?;
        if columns.len() <= cfg.value_columns.len() {
            return Err(LoadError::InvalidValueColumns {
                value_columns: cfg.value_columns.len(),
                total_columns: columns.len(),
            });
        }
        Ok(columns
            .into_iter()
            .map(|c| c.name)
            .filter(|n| !cfg.value_columns.contains(n) && n != &cfg.crawldate_column)
            .collect())
    }

    /// Standalone duplicate resolution over the target table: partitions on
    /// the identity columns and keeps exactly one row per partition according
    /// to the keep policy, in a single atomic windowed delete.
    pub async fn remove_duplicates<S: SqlSession>(
        &self,
        session: &mut S,
    ) -> Result<u64, LoadError> {
        let cfg = &self.config;
        let partition = self.partition_columns(session).await?;
        session
            .dedupe(
                &cfg.schema_name,
                &cfg.table_name,
                &partition,
                &cfg.crawldate_column,
                cfg.keep_policy,
            )
            .await
    }

    /// Upserts a table directly through a generated MERGE, without the
    /// numeric comparison. Useful for data not based on numbers.
    pub async fn upsert<S: SqlSession>(
        &self,
        session: &mut S,
        table: &Table,
        match_columns: &[String],
    ) -> Result<LoadResult, LoadError> {
        self.config.validate()?;
        let cfg = &self.config;
        let before = session.row_count(&cfg.schema_name, &cfg.table_name).await?;

        let merged = session
            .merge_upsert(
                table,
                &cfg.schema_name,
                &cfg.table_name,
                match_columns,
                cfg.max_varchar,
            )
            .await;
        if let Err(error) = merged {
            self.report_failure(session, &error).await;
            return Err(error);
        }

        let after = session.row_count(&cfg.schema_name, &cfg.table_name).await?;
        let rows_added = after as i64 - before as i64;
        write_monitoring(
            session,
            &MonitoringRecord::new(&cfg.schema_name, &cfg.table_name, rows_added, true),
        )
        .await?;
        tracing::info!(rows = table.row_count(), table = %cfg.table_name, "data points upserted to sql");

        if rows_added != 0 {
            self.notifier
                .notify(
                    NotifyEvent::UploadSucceeded,
                    &cfg.table_name,
                    &table.head(PREVIEW_ROWS).to_html(PREVIEW_ROWS),
                )
                .await;
        }

        Ok(LoadResult {
            rows_added,
            new_columns: Vec::new(),
            change_preview: table.head(PREVIEW_ROWS),
        })
    }

    /// Truncates the target table and replaces its content with `table`.
    pub async fn truncate_and_upload<S: SqlSession>(
        &self,
        session: &mut S,
        table: &Table,
    ) -> Result<LoadResult, LoadError> {
        self.config.validate()?;
        let cfg = &self.config;

        let run = async {
            tracing::info!(table = %cfg.table_name, "truncating table");
            session.truncate(&cfg.schema_name, &cfg.table_name).await?;
            tracing::info!(rows = table.row_count(), "uploading data");
            session
                .table_to_sql(
                    table,
                    &cfg.schema_name,
                    &cfg.table_name,
                    WriteMode::Append,
                    cfg.max_varchar,
                )
                .await?;
            session.row_count(&cfg.schema_name, &cfg.table_name).await
        };

        let outcome = run.await;
        match outcome {
            Ok(after) => {
                write_monitoring(
                    session,
                    &MonitoringRecord::new(&cfg.schema_name, &cfg.table_name, after as i64, true),
                )
                .await?;
                if after > 0 {
                    self.notifier
                        .notify(
                            NotifyEvent::UploadSucceeded,
                            &cfg.table_name,
                            &table.head(PREVIEW_ROWS).to_html(PREVIEW_ROWS),
                        )
                        .await;
                }
                Ok(LoadResult {
                    rows_added: after as i64,
                    new_columns: Vec::new(),
                    change_preview: table.head(PREVIEW_ROWS),
                })
            }
            Err(error) => {
                self.report_failure(session, &error).await;
                Err(error)
            }
        }
    }

    /// Plain append of a table with no comparison and no truncation, creating
    /// the destination when it does not exist yet.
    pub async fn upload<S: SqlSession>(
        &self,
        session: &mut S,
        table: &Table,
    ) -> Result<LoadResult, LoadError> {
        self.config.validate()?;
        let cfg = &self.config;

        let run = async {
            let before = session.row_count(&cfg.schema_name, &cfg.table_name).await?;
            let existing = session
                .table_columns(&cfg.schema_name, &cfg.table_name)
                .await?;
            let mode = if existing.is_empty() {
                WriteMode::Replace
            } else {
                WriteMode::Append
            };
            session
                .table_to_sql(table, &cfg.schema_name, &cfg.table_name, mode, cfg.max_varchar)
                .await?;
            let after = session.row_count(&cfg.schema_name, &cfg.table_name).await?;
            Ok::<i64, LoadError>(after as i64 - before as i64)
        };

        let outcome = run.await;
        match outcome {
            Ok(rows_added) => {
                write_monitoring(
                    session,
                    &MonitoringRecord::new(&cfg.schema_name, &cfg.table_name, rows_added, true),
                )
                .await?;
                tracing::info!(rows = table.row_count(), "data points uploaded to sql");
                if rows_added != 0 {
                    self.notifier
                        .notify(
                            NotifyEvent::UploadSucceeded,
                            &cfg.table_name,
                            &table.head(PREVIEW_ROWS).to_html(PREVIEW_ROWS),
                        )
                        .await;
                }
                Ok(LoadResult {
                    rows_added,
                    new_columns: Vec::new(),
                    change_preview: table.head(PREVIEW_ROWS),
                })
            }
            Err(error) => {
                self.report_failure(session, &error).await;
                Err(error)
            }
        }
    }

    async fn rollback_schema<S: SqlSession>(&self, session: &mut S) {
        let cfg = &self.config;
        match session.drop_schema(&cfg.schema_name).await {
            Ok(()) => {
                tracing::info!(schema = %cfg.schema_name, "schema and subtables dropped after failed load");
                self.notifier
                    .notify(
                        NotifyEvent::SchemaDropped,
                        &cfg.schema_name,
                        &format!(
                            "<p>Schema {} was rolled back after a failed load.</p>",
                            cfg.schema_name
                        ),
                    )
                    .await;
            }
            Err(e) => {
                tracing::error!(schema = %cfg.schema_name, error = %e, "schema rollback failed");
            }
        }
    }

    async fn report_failure<S: SqlSession>(&self, session: &mut S, error: &LoadError) {
        let cfg = &self.config;
        if let Err(e) = write_monitoring(
            session,
            &MonitoringRecord::new(&cfg.schema_name, &cfg.table_name, 0, false),
        )
        .await
        {
            tracing::error!(error = %e, "failed to write monitoring record");
        }
        let body = format!(
            "Adding to {}.{} failed. The following error occured: {}",
            cfg.schema_name, cfg.table_name, error
        );
        self.notifier
            .notify(NotifyEvent::UploadFailed, &cfg.table_name, &body)
            .await;
    }
}

fn format_banner(text: &str) -> String {
    let line = "-------------------------------------------------------";
    format!("{}\n{}\n{}\n", line, text, line)
}

/// Prints and returns the column set and row count of a table.
pub async fn table_info<S: SqlSession>(
    session: &mut S,
    schema_name: &str,
    table_name: &str,
) -> Result<(Vec<SqlColumn>, u64), LoadError> {
    let columns = session.table_columns(schema_name, table_name).await?;
    let rows = session.row_count(schema_name, table_name).await?;
    let listing = columns
        .iter()
        .map(|c| format!("{}  {}", c.name, c.data_type))
        .collect::<Vec<String>>()
        .join("\n");
    println!("{}", format_banner(&format!("{}\n{}", table_name, listing)));
    println!("number of rows in {}: {}", table_name, rows);
    Ok((columns, rows))
}

/// Prints and returns the first rows of a table.
pub async fn preview_table<S: SqlSession>(
    session: &mut S,
    schema_name: &str,
    table_name: &str,
    nr_of_lines: usize,
) -> Result<Table, LoadError> {
    let sql = format!(
        "SELECT TOP {} * FROM {}",
        nr_of_lines,
        table_spec(schema_name, table_name)?
    );
    let table = session.query_to_table(&sql).await?;
    table.print_table(nr_of_lines);
    Ok(table)
}

/// Prints and returns every table in the connected database.
pub async fn all_tables<S: SqlSession>(session: &mut S) -> Result<Table, LoadError> {
    let table = session
        .query_to_table("SELECT TABLE_SCHEMA, TABLE_NAME FROM INFORMATION_SCHEMA.TABLES")
        .await?;
    table.print_table(table.row_count());
    Ok(table)
}
