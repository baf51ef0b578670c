// sql_utils.rs
use crate::error_utils::LoadError;
use crate::table_utils::{infer_column_kinds, parse_timestamp, ColumnKind, Table};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use futures::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tiberius::{error::Error, AuthMethod, Client, ColumnType, Config, QueryItem, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use uuid::Uuid;

/// Schema holding the append-only crawler audit table.
pub const MONITORING_SCHEMA: &str = "Info";
/// Audit table written after every load attempt regardless of outcome.
pub const MONITORING_TABLE: &str = "MonitoringTable";

lazy_static! {
    static ref IDENT_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_+\-. ]{0,127}$").unwrap();
}

/// Decides which row survives when several rows share an identity partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeepPolicy {
    /// The earliest row by ingestion timestamp is kept, later arrivals are
    /// discarded.
    KeepOldest,
    /// The latest row by ingestion timestamp replaces older ones.
    ReplaceWithNewest,
}

impl KeepPolicy {
    /// ORDER BY direction that ranks the surviving row first.
    pub fn order_keyword(&self) -> &'static str {
        match self {
            KeepPolicy::KeepOldest => "Asc",
            KeepPolicy::ReplaceWithNewest => "Desc",
        }
    }
}

/// Write disposition for `table_to_sql`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Destination must exist; fails with `SchemaMismatch` when a pushed
    /// column is absent (the caller widens the schema first).
    Append,
    /// Drops and recreates the destination with inferred column types.
    Replace,
}

/// One introspected column of a target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlColumn {
    pub name: String,
    pub data_type: String,
}

/// Validates `name` against the identifier allow-list and wraps it in
/// brackets. Every schema, table and column name supplied by a caller goes
/// through here before it is embedded in generated SQL.
///
/// ```
/// use resql::sql_utils::quote_ident;
///
/// assert_eq!(quote_ident("CrawlDate").unwrap(), "[CrawlDate]");
/// assert_eq!(quote_ident("EU27+UK").unwrap(), "[EU27+UK]");
/// assert!(quote_ident("x]; DROP TABLE y; --").is_err());
/// assert!(quote_ident("").is_err());
/// ```
pub fn quote_ident(name: &str) -> Result<String, LoadError> {
    if IDENT_RE.is_match(name) {
        Ok(format!("[{}]", name))
    } else {
        Err(LoadError::InvalidIdentifier(name.to_string()))
    }
}

/// Renders a string as an N'...' literal with embedded quotes doubled.
pub fn quote_str(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

/// `[schema].[table]`, both parts validated.
pub fn table_spec(schema_name: &str, table_name: &str) -> Result<String, LoadError> {
    Ok(format!("{}.{}", quote_ident(schema_name)?, quote_ident(table_name)?))
}

/// `[database].[schema].[table]`, all parts validated.
pub fn qualified_table_spec(
    database_name: &str,
    schema_name: &str,
    table_name: &str,
) -> Result<String, LoadError> {
    Ok(format!(
        "{}.{}.{}",
        quote_ident(database_name)?,
        quote_ident(schema_name)?,
        quote_ident(table_name)?
    ))
}

/// Renders one cell as a SQL literal. Empty cells become NULL except in text
/// columns, numeric cells that parse go in bare, everything else is quoted.
fn render_literal(value: &str, kind: ColumnKind) -> String {
    if value.is_empty() {
        return match kind {
            ColumnKind::Text => quote_str(value),
            _ => "NULL".to_string(),
        };
    }
    match kind {
        ColumnKind::Integer | ColumnKind::Float => {
            if value.parse::<f64>().is_ok() {
                value.to_string()
            } else {
                quote_str(value)
            }
        }
        _ => quote_str(value),
    }
}

fn column_defs(
    headers: &[String],
    kinds: &[ColumnKind],
    max_varchar: usize,
) -> Result<String, LoadError> {
    let defs = headers
        .iter()
        .zip(kinds.iter())
        .map(|(h, k)| Ok(format!("{} {}", quote_ident(h)?, k.sql_type(max_varchar))))
        .collect::<Result<Vec<String>, LoadError>>()?;
    Ok(defs.join(", "))
}

/// CREATE TABLE statement for `spec` with one column per header, typed by
/// inference.
pub fn build_create_table_sql(
    spec: &str,
    headers: &[String],
    kinds: &[ColumnKind],
    max_varchar: usize,
) -> Result<String, LoadError> {
    Ok(format!(
        "CREATE TABLE {} ({})",
        spec,
        column_defs(headers, kinds, max_varchar)?
    ))
}

/// Multi-row INSERT statement for one chunk of rows.
pub fn build_insert_sql(
    spec: &str,
    headers: &[String],
    rows: &[Vec<String>],
    kinds: &[ColumnKind],
) -> Result<String, LoadError> {
    let columns = headers
        .iter()
        .map(|h| quote_ident(h))
        .collect::<Result<Vec<String>, LoadError>>()?
        .join(", ");

    let values = rows
        .iter()
        .map(|row| {
            let rendered = headers
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    let cell = row.get(i).map(|s| s.as_str()).unwrap_or("");
                    render_literal(cell, kinds[i])
                })
                .collect::<Vec<String>>()
                .join(", ");
            format!("({})", rendered)
        })
        .collect::<Vec<String>>()
        .join(", ");

    Ok(format!("INSERT INTO {} ({}) VALUES {}", spec, columns, values))
}

/// Rows per INSERT statement, derived from the 2100-parameter budget of the
/// TDS protocol.
pub fn insert_chunk_rows(column_count: usize) -> usize {
    (2100 / column_count.max(1)).saturating_sub(1).clamp(1, 1000)
}

/// Single set-based windowed delete that removes every row ranked behind the
/// surviving one within its identity partition. Atomic at the database: an
/// interrupted statement leaves the table unmodified.
///
/// ```
/// use resql::sql_utils::{build_dedupe_sql, KeepPolicy};
///
/// let sql = build_dedupe_sql(
///     "RECrawlers",
///     "crawlertest",
///     "testtable",
///     &["Country".to_string(), "Date".to_string()],
///     "CrawlDate",
///     KeepPolicy::KeepOldest,
/// )
/// .unwrap();
/// assert!(sql.contains("PARTITION BY [Country], [Date]"));
/// assert!(sql.contains("order by [CrawlDate] Asc"));
/// assert!(sql.contains("DELETE FROM CTE WHERE RN <> 1"));
/// ```
pub fn build_dedupe_sql(
    database_name: &str,
    schema_name: &str,
    table_name: &str,
    partition_columns: &[String],
    crawldate_column: &str,
    policy: KeepPolicy,
) -> Result<String, LoadError> {
    if partition_columns.is_empty() {
        return Err(LoadError::Config(
            "no identity columns to partition on".to_string(),
        ));
    }
    let partition = partition_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<String>, LoadError>>()?
        .join(", ");
    Ok(format!(
        "BEGIN WITH CTE AS (SELECT *, ROW_NUMBER() OVER (PARTITION BY {} order by {} {}) AS RN FROM {}) DELETE FROM CTE WHERE RN <> 1 END",
        partition,
        quote_ident(crawldate_column)?,
        policy.order_keyword(),
        qualified_table_spec(database_name, schema_name, table_name)?
    ))
}

/// Windowed rn = 1 select returning the canonical stored row per identity
/// partition, value column aliased to `old_<value_column>`.
pub fn build_latest_rows_sql(
    database_name: &str,
    schema_name: &str,
    table_name: &str,
    identity_columns: &[String],
    value_column: &str,
    crawldate_column: &str,
    policy: KeepPolicy,
) -> Result<String, LoadError> {
    if identity_columns.is_empty() {
        return Err(LoadError::Config(
            "no identity columns to partition on".to_string(),
        ));
    }
    let identity = identity_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<String>, LoadError>>()?
        .join(", ");
    Ok(format!(
        "SELECT {}, {} AS {} FROM (SELECT *, ROW_NUMBER() OVER (PARTITION BY {} ORDER BY {} {}) rn FROM {}) X WHERE rn = 1",
        identity,
        quote_ident(value_column)?,
        quote_ident(&format!("old_{}", value_column))?,
        identity,
        quote_ident(crawldate_column)?,
        policy.order_keyword(),
        qualified_table_spec(database_name, schema_name, table_name)?
    ))
}

/// T-SQL MERGE from a staged temp table into the target, matching on
/// `match_columns`, updating the rest on match and inserting on no match.
pub fn build_merge_sql(
    schema_name: &str,
    table_name: &str,
    temp_table: &str,
    columns: &[String],
    match_columns: &[String],
) -> Result<String, LoadError> {
    if match_columns.is_empty() {
        return Err(LoadError::Config("no match columns for upsert".to_string()));
    }
    for m in match_columns {
        if !columns.contains(m) {
            return Err(LoadError::SchemaMismatch {
                table: format!("{}.{}", schema_name, table_name),
                column: m.clone(),
            });
        }
    }

    let quoted = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<String>, LoadError>>()?;
    let select_list = quoted.join(", ");

    let mut stmt = format!(
        "MERGE {} WITH (HOLDLOCK) AS main\nUSING (SELECT {} FROM [{}]) AS temp\n",
        table_spec(schema_name, table_name)?,
        select_list,
        temp_table
    );

    let join_condition = match_columns
        .iter()
        .map(|c| Ok(format!("main.{q} = temp.{q}", q = quote_ident(c)?)))
        .collect::<Result<Vec<String>, LoadError>>()?
        .join(" AND ");
    stmt.push_str(&format!("ON ({})", join_condition));

    let columns_to_update: Vec<&String> =
        columns.iter().filter(|c| !match_columns.contains(c)).collect();
    if !columns_to_update.is_empty() {
        let update_list = columns_to_update
            .iter()
            .map(|c| Ok(format!("{q} = temp.{q}", q = quote_ident(c)?)))
            .collect::<Result<Vec<String>, LoadError>>()?
            .join(", ");
        stmt.push_str(&format!("\nWHEN MATCHED THEN\n  UPDATE SET {}", update_list));
    }

    let insert_vals = quoted
        .iter()
        .map(|q| format!("temp.{}", q))
        .collect::<Vec<String>>()
        .join(", ");
    stmt.push_str(&format!(
        "\nWHEN NOT MATCHED THEN\n  INSERT ({}) VALUES ({});",
        select_list, insert_vals
    ));

    Ok(stmt)
}

/// Append-only audit row recording the outcome of one load attempt.
#[derive(Debug, Clone)]
pub struct MonitoringRecord {
    pub schema_name: String,
    pub table_name: String,
    pub rows_delta: i64,
    pub successful: bool,
    pub timestamp: String,
}

impl MonitoringRecord {
    pub fn new(schema_name: &str, table_name: &str, rows_delta: i64, successful: bool) -> Self {
        MonitoringRecord {
            schema_name: schema_name.to_string(),
            table_name: table_name.to_string(),
            rows_delta,
            successful,
            timestamp: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    pub fn to_table(&self) -> Table {
        Table::from_raw_data(
            vec![
                "Schema".to_string(),
                "Table".to_string(),
                "Nr_of_rows".to_string(),
                "Upload successful".to_string(),
                "Timestamp".to_string(),
            ],
            vec![vec![
                self.schema_name.clone(),
                self.table_name.clone(),
                self.rows_delta.to_string(),
                if self.successful { "True" } else { "False" }.to_string(),
                self.timestamp.clone(),
            ]],
        )
    }
}

/// The adapter contract every load runs against. Implemented by the tiberius
/// backed `SqlConnection` for production and by an in-memory store in tests.
#[async_trait]
pub trait SqlSession: Send {
    /// Executes a read query and returns the result set as a `Table`.
    async fn query_to_table(&mut self, sql: &str) -> Result<Table, LoadError>;

    /// Executes DDL/DML with no result set, returns rows affected.
    async fn execute(&mut self, sql: &str) -> Result<u64, LoadError>;

    /// Ordered (name, type) list for a table; empty when it does not exist.
    async fn table_columns(
        &mut self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Vec<SqlColumn>, LoadError>;

    /// Row count, 0 (not an error) when the table does not exist.
    async fn row_count(&mut self, schema_name: &str, table_name: &str) -> Result<u64, LoadError>;

    async fn schema_exists(&mut self, schema_name: &str) -> Result<bool, LoadError>;

    async fn create_schema(&mut self, schema_name: &str) -> Result<(), LoadError>;

    /// Drops a schema together with all its tables.
    async fn drop_schema(&mut self, schema_name: &str) -> Result<(), LoadError>;

    /// Writes a table to the destination per `mode` semantics.
    async fn table_to_sql(
        &mut self,
        table: &Table,
        schema_name: &str,
        table_name: &str,
        mode: WriteMode,
        max_varchar: usize,
    ) -> Result<(), LoadError>;

    /// ALTER TABLE ADD for one column.
    async fn add_column(
        &mut self,
        schema_name: &str,
        table_name: &str,
        column_name: &str,
        sql_type: &str,
    ) -> Result<(), LoadError>;

    /// Canonical stored row per identity partition, value column aliased to
    /// `old_<value_column>`.
    async fn latest_rows(
        &mut self,
        schema_name: &str,
        table_name: &str,
        identity_columns: &[String],
        value_column: &str,
        crawldate_column: &str,
        policy: KeepPolicy,
    ) -> Result<Table, LoadError>;

    /// Removes every row ranked behind the surviving one within its identity
    /// partition, in a single atomic statement. Returns rows deleted.
    async fn dedupe(
        &mut self,
        schema_name: &str,
        table_name: &str,
        partition_columns: &[String],
        crawldate_column: &str,
        policy: KeepPolicy,
    ) -> Result<u64, LoadError>;

    /// Stages `table` into a temp table and MERGEs it into the target on
    /// `match_columns`.
    async fn merge_upsert(
        &mut self,
        table: &Table,
        schema_name: &str,
        table_name: &str,
        match_columns: &[String],
        max_varchar: usize,
    ) -> Result<(), LoadError>;

    async fn truncate(&mut self, schema_name: &str, table_name: &str) -> Result<(), LoadError>;

    /// DELETE with a caller-supplied WHERE clause, returns rows deleted.
    async fn delete_where(
        &mut self,
        schema_name: &str,
        table_name: &str,
        conditions: &str,
    ) -> Result<u64, LoadError>;

    /// Newest value of a date column, `None` when the table is missing or
    /// empty.
    async fn newest_date(
        &mut self,
        schema_name: &str,
        table_name: &str,
        column_name: &str,
    ) -> Result<Option<NaiveDateTime>, LoadError>;
}

/// A session against one (server, database) pair over TDS. Opening is a
/// single attempt, fail fast, no retry.
pub struct SqlConnection {
    client: Client<Compat<TcpStream>>,
    server: String,
    database: String,
}

impl SqlConnection {
    /// Opens a connection to `server`/`database` with SQL Server
    /// authentication.
    pub async fn connect(
        username: &str,
        password: &str,
        server: &str,
        database: &str,
    ) -> Result<Self, LoadError> {
        let conn_err = |detail: String| LoadError::Connection {
            server: server.to_string(),
            database: database.to_string(),
            detail,
        };

        let mut config = Config::new();
        config.host(server);
        config.database(database);
        config.port(1433);
        config.authentication(AuthMethod::sql_server(username, password));
        config.trust_cert();

        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| conn_err(e.to_string()))?;
        tcp.set_nodelay(true).map_err(|e| conn_err(e.to_string()))?;

        let client = match Client::connect(config, tcp.compat_write()).await {
            Ok(client) => client,
            Err(Error::Routing { host, port }) => {
                let mut config = Config::new();
                config.host(&host);
                config.port(port);
                config.database(database);
                config.authentication(AuthMethod::sql_server(username, password));
                config.trust_cert();

                let tcp = TcpStream::connect(config.get_addr())
                    .await
                    .map_err(|e| conn_err(e.to_string()))?;
                tcp.set_nodelay(true).map_err(|e| conn_err(e.to_string()))?;

                Client::connect(config, tcp.compat_write())
                    .await
                    .map_err(|e| conn_err(e.to_string()))?
            }
            Err(e) => return Err(conn_err(e.to_string())),
        };

        Ok(SqlConnection {
            client,
            server: server.to_string(),
            database: database.to_string(),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    fn query_err(sql: &str, detail: String) -> LoadError {
        LoadError::Query {
            context: sql.chars().take(120).collect(),
            detail,
        }
    }
}

fn extract_column_names(row: &Row) -> Vec<String> {
    row.columns().iter().map(|col| col.name().to_string()).collect()
}

fn extract_row_values(row: &Row) -> Vec<String> {
    fn opt_to_string<T: ToString>(value: Result<Option<T>, Error>) -> String {
        match value {
            Ok(Some(v)) => v.to_string(),
            _ => "".to_string(),
        }
    }

    let mut values = Vec::new();
    for i in 0..row.columns().len() {
        let column_type = row.columns()[i].column_type();
        let value = match column_type {
            ColumnType::Int1 => opt_to_string(row.try_get::<u8, _>(i)),
            ColumnType::Int2 => opt_to_string(row.try_get::<i16, _>(i)),
            ColumnType::Int4 => opt_to_string(row.try_get::<i32, _>(i)),
            ColumnType::Int8 => opt_to_string(row.try_get::<i64, _>(i)),
            ColumnType::Intn => {
                if let Ok(Some(value)) = row.try_get::<i64, _>(i) {
                    value.to_string()
                } else if let Ok(Some(value)) = row.try_get::<i32, _>(i) {
                    value.to_string()
                } else if let Ok(Some(value)) = row.try_get::<i16, _>(i) {
                    value.to_string()
                } else if let Ok(Some(value)) = row.try_get::<u8, _>(i) {
                    value.to_string()
                } else {
                    "".to_string()
                }
            }
            ColumnType::Float4 => opt_to_string(row.try_get::<f32, _>(i)),
            ColumnType::Float8 | ColumnType::Floatn | ColumnType::Money | ColumnType::Money4 => {
                opt_to_string(row.try_get::<f64, _>(i))
            }
            ColumnType::Bit => opt_to_string(row.try_get::<bool, _>(i)),
            ColumnType::BigVarChar
            | ColumnType::BigChar
            | ColumnType::NVarchar
            | ColumnType::NChar
            | ColumnType::Text
            | ColumnType::NText => opt_to_string(row.try_get::<&str, _>(i)),
            ColumnType::Datetime
            | ColumnType::Datetime2
            | ColumnType::Datetimen
            | ColumnType::Daten
            | ColumnType::DatetimeOffsetn => match row.try_get::<NaiveDateTime, _>(i) {
                Ok(Some(naive_datetime)) => naive_datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
                Ok(None) => "".to_string(),
                Err(_) => match row.try_get::<NaiveDate, _>(i) {
                    Ok(Some(naive_date)) => naive_date.format("%Y-%m-%d").to_string(),
                    _ => "".to_string(),
                },
            },
            ColumnType::Guid => opt_to_string(row.try_get::<Uuid, _>(i)),
            _ => "".to_string(),
        };
        values.push(value);
    }
    values
}

#[async_trait]
impl SqlSession for SqlConnection {
    async fn query_to_table(&mut self, sql: &str) -> Result<Table, LoadError> {
        let mut stream = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| Self::query_err(sql, e.to_string()))?;

        let mut headers: Vec<String> = Vec::new();
        let mut data: Vec<Vec<String>> = Vec::new();

        while let Some(query_item_result) = stream.next().await {
            match query_item_result {
                Ok(QueryItem::Row(row)) => {
                    if headers.is_empty() {
                        headers = extract_column_names(&row);
                    }
                    data.push(extract_row_values(&row));
                }
                Ok(_) => continue,
                Err(e) => return Err(Self::query_err(sql, e.to_string())),
            }
        }

        Ok(Table::from_raw_data(headers, data))
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, LoadError> {
        let result = self
            .client
            .execute(sql, &[])
            .await
            .map_err(|e| Self::query_err(sql, e.to_string()))?;
        Ok(result.rows_affected().iter().sum())
    }

    async fn table_columns(
        &mut self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Vec<SqlColumn>, LoadError> {
        let sql = format!(
            "SELECT COLUMN_NAME, DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS WHERE TABLE_NAME = {} AND TABLE_SCHEMA = {} ORDER BY ORDINAL_POSITION",
            quote_str(table_name),
            quote_str(schema_name)
        );
        let table = self.query_to_table(&sql).await?;
        Ok(table
            .data()
            .iter()
            .map(|row| SqlColumn {
                name: row.first().cloned().unwrap_or_default(),
                data_type: row.get(1).cloned().unwrap_or_default(),
            })
            .collect())
    }

    async fn row_count(&mut self, schema_name: &str, table_name: &str) -> Result<u64, LoadError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}",
            table_spec(schema_name, table_name)?
        );
        // a missing table counts as zero rows
        match self.query_to_table(&sql).await {
            Ok(table) => Ok(table
                .data()
                .first()
                .and_then(|r| r.first())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)),
            Err(_) => Ok(0),
        }
    }

    async fn schema_exists(&mut self, schema_name: &str) -> Result<bool, LoadError> {
        let sql = format!(
            "SELECT SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = {}",
            quote_str(schema_name)
        );
        Ok(!self.query_to_table(&sql).await?.is_empty())
    }

    async fn create_schema(&mut self, schema_name: &str) -> Result<(), LoadError> {
        self.execute(&format!("CREATE SCHEMA {}", quote_ident(schema_name)?))
            .await?;
        Ok(())
    }

    async fn drop_schema(&mut self, schema_name: &str) -> Result<(), LoadError> {
        let sql = format!(
            "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = {}",
            quote_str(schema_name)
        );
        let tables = self.query_to_table(&sql).await?;
        for row in tables.data() {
            if let Some(table_name) = row.first() {
                self.execute(&format!(
                    "DROP TABLE {}",
                    table_spec(schema_name, table_name)?
                ))
                .await?;
            }
        }
        self.execute(&format!("DROP SCHEMA {}", quote_ident(schema_name)?))
            .await?;
        Ok(())
    }

    async fn table_to_sql(
        &mut self,
        table: &Table,
        schema_name: &str,
        table_name: &str,
        mode: WriteMode,
        max_varchar: usize,
    ) -> Result<(), LoadError> {
        let spec = table_spec(schema_name, table_name)?;
        let kinds = infer_column_kinds(table);

        match mode {
            WriteMode::Replace => {
                self.execute(&format!("DROP TABLE IF EXISTS {}", spec)).await?;
                self.execute(&build_create_table_sql(
                    &spec,
                    table.headers(),
                    &kinds,
                    max_varchar,
                )?)
                .await?;
            }
            WriteMode::Append => {
                let existing = self.table_columns(schema_name, table_name).await?;
                for header in table.headers() {
                    if !existing.iter().any(|c| &c.name == header) {
                        return Err(LoadError::SchemaMismatch {
                            table: format!("{}.{}", schema_name, table_name),
                            column: header.clone(),
                        });
                    }
                }
            }
        }

        let chunk_size = insert_chunk_rows(table.headers().len());
        for chunk in table.data().chunks(chunk_size) {
            let sql = build_insert_sql(&spec, table.headers(), chunk, &kinds)?;
            self.execute(&sql).await?;
        }
        Ok(())
    }

    async fn add_column(
        &mut self,
        schema_name: &str,
        table_name: &str,
        column_name: &str,
        sql_type: &str,
    ) -> Result<(), LoadError> {
        self.execute(&format!(
            "ALTER TABLE {} ADD {} {}",
            table_spec(schema_name, table_name)?,
            quote_ident(column_name)?,
            sql_type
        ))
        .await?;
        Ok(())
    }

    async fn latest_rows(
        &mut self,
        schema_name: &str,
        table_name: &str,
        identity_columns: &[String],
        value_column: &str,
        crawldate_column: &str,
        policy: KeepPolicy,
    ) -> Result<Table, LoadError> {
        let database = self.database.clone();
        let sql = build_latest_rows_sql(
            &database,
            schema_name,
            table_name,
            identity_columns,
            value_column,
            crawldate_column,
            policy,
        )?;
        self.query_to_table(&sql).await
    }

    async fn dedupe(
        &mut self,
        schema_name: &str,
        table_name: &str,
        partition_columns: &[String],
        crawldate_column: &str,
        policy: KeepPolicy,
    ) -> Result<u64, LoadError> {
        let database = self.database.clone();
        let sql = build_dedupe_sql(
            &database,
            schema_name,
            table_name,
            partition_columns,
            crawldate_column,
            policy,
        )?;
        self.execute(&sql)
            .await
            .map_err(|e| LoadError::Deduplication {
                table: format!("{}.{}", schema_name, table_name),
                detail: e.to_string(),
            })
    }

    async fn merge_upsert(
        &mut self,
        table: &Table,
        schema_name: &str,
        table_name: &str,
        match_columns: &[String],
        max_varchar: usize,
    ) -> Result<(), LoadError> {
        let temp_table = format!("##{}", Uuid::new_v4().to_string().replace('-', "_"));
        let temp_spec = format!("[{}]", temp_table);
        let kinds = infer_column_kinds(table);

        self.execute(&build_create_table_sql(
            &temp_spec,
            table.headers(),
            &kinds,
            max_varchar,
        )?)
        .await?;

        let chunk_size = insert_chunk_rows(table.headers().len());
        let mut staged: Result<(), LoadError> = Ok(());
        for chunk in table.data().chunks(chunk_size) {
            let sql = build_insert_sql(&temp_spec, table.headers(), chunk, &kinds)?;
            if let Err(e) = self.execute(&sql).await {
                staged = Err(e);
                break;
            }
        }

        let merged = match staged {
            Ok(()) => {
                let stmt = build_merge_sql(
                    schema_name,
                    table_name,
                    &temp_table,
                    table.headers(),
                    match_columns,
                )?;
                self.execute(&stmt).await.map(|_| ())
            }
            Err(e) => Err(e),
        };

        // drop staging regardless of outcome
        let _ = self
            .execute(&format!("DROP TABLE IF EXISTS {}", temp_spec))
            .await;

        merged
    }

    async fn truncate(&mut self, schema_name: &str, table_name: &str) -> Result<(), LoadError> {
        self.execute(&format!(
            "TRUNCATE TABLE {}",
            table_spec(schema_name, table_name)?
        ))
        .await?;
        Ok(())
    }

    async fn delete_where(
        &mut self,
        schema_name: &str,
        table_name: &str,
        conditions: &str,
    ) -> Result<u64, LoadError> {
        self.execute(&format!(
            "DELETE FROM {} WHERE {}",
            table_spec(schema_name, table_name)?,
            conditions
        ))
        .await
    }

    async fn newest_date(
        &mut self,
        schema_name: &str,
        table_name: &str,
        column_name: &str,
    ) -> Result<Option<NaiveDateTime>, LoadError> {
        let column = quote_ident(column_name)?;
        let sql = format!(
            "SELECT TOP 1 {} FROM {} ORDER BY {} Desc",
            column,
            table_spec(schema_name, table_name)?,
            column
        );
        match self.query_to_table(&sql).await {
            Ok(table) => Ok(table
                .data()
                .first()
                .and_then(|r| r.first())
                .and_then(|v| parse_timestamp(v))),
            Err(_) => Ok(None),
        }
    }
}

/// Appends one audit row to `Info.MonitoringTable`, creating the schema and
/// table on first use. Called after every load attempt regardless of outcome.
pub async fn write_monitoring<S: SqlSession + ?Sized>(
    session: &mut S,
    record: &MonitoringRecord,
) -> Result<(), LoadError> {
    if !session.schema_exists(MONITORING_SCHEMA).await? {
        session.create_schema(MONITORING_SCHEMA).await?;
        tracing::info!(schema = MONITORING_SCHEMA, "monitoring schema created");
    }
    let table = record.to_table();
    let existing = session.table_columns(MONITORING_SCHEMA, MONITORING_TABLE).await?;
    let mode = if existing.is_empty() {
        WriteMode::Replace
    } else {
        WriteMode::Append
    };
    session
        .table_to_sql(&table, MONITORING_SCHEMA, MONITORING_TABLE, mode, 255)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn quote_ident_accepts_warehouse_names() {
        for name in [
            "CrawlDate",
            "tblEuropeanMonthlyBalance",
            "EU27+UK",
            "NOR Pipe",
            "Demand Sector Category",
            "Upload successful",
            "Nr_of_rows",
        ] {
            assert!(quote_ident(name).is_ok(), "{} should be accepted", name);
        }
    }

    #[test]
    fn quote_ident_rejects_injection_attempts() {
        for name in [
            "",
            "x]; DROP TABLE y; --",
            "a[b",
            "a]b",
            "semi;colon",
            "new\nline",
            "quote'name",
        ] {
            assert!(
                matches!(quote_ident(name), Err(LoadError::InvalidIdentifier(_))),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn quote_str_doubles_quotes() {
        assert_eq!(quote_str("it's"), "N'it''s'");
        assert_eq!(quote_str(""), "N''");
    }

    #[test]
    fn render_literal_by_kind() {
        assert_eq!(render_literal("10.5", ColumnKind::Float), "10.5");
        assert_eq!(render_literal("7", ColumnKind::Integer), "7");
        assert_eq!(render_literal("", ColumnKind::Integer), "NULL");
        assert_eq!(render_literal("", ColumnKind::Text), "N''");
        assert_eq!(render_literal("abc", ColumnKind::Text), "N'abc'");
        assert_eq!(
            render_literal("2024-01-01 00:00:00", ColumnKind::Timestamp),
            "N'2024-01-01 00:00:00'"
        );
        // a non-numeric cell in a numeric column is quoted, never spliced bare
        assert_eq!(render_literal("1; DROP", ColumnKind::Float), "N'1; DROP'");
    }

    #[test]
    fn dedupe_sql_orders_by_policy() {
        let partition = names(&["Country", "Date"]);
        let keep_oldest = build_dedupe_sql(
            "RECrawlers",
            "crawlertest",
            "testtable",
            &partition,
            "CrawlDate",
            KeepPolicy::KeepOldest,
        )
        .unwrap();
        assert!(keep_oldest.contains("order by [CrawlDate] Asc"));

        let replace = build_dedupe_sql(
            "RECrawlers",
            "crawlertest",
            "testtable",
            &partition,
            "CrawlDate",
            KeepPolicy::ReplaceWithNewest,
        )
        .unwrap();
        assert!(replace.contains("order by [CrawlDate] Desc"));
        assert!(replace.contains("[RECrawlers].[crawlertest].[testtable]"));
    }

    #[test]
    fn dedupe_sql_requires_partition_columns() {
        let err = build_dedupe_sql(
            "db",
            "s",
            "t",
            &[],
            "CrawlDate",
            KeepPolicy::KeepOldest,
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::Config(_)));
    }

    #[test]
    fn latest_rows_sql_aliases_old_value() {
        let sql = build_latest_rows_sql(
            "LNGTrade",
            "LNGG",
            "tblBenchmarks",
            &names(&["Country", "Date"]),
            "Value",
            "CrawlDate",
            KeepPolicy::KeepOldest,
        )
        .unwrap();
        assert!(sql.contains("[Value] AS [old_Value]"));
        assert!(sql.contains("WHERE rn = 1"));
        assert!(sql.contains("PARTITION BY [Country], [Date]"));
    }

    #[test]
    fn merge_sql_has_both_arms() {
        let sql = build_merge_sql(
            "LNGG",
            "tblBenchmarks",
            "##abc",
            &names(&["Country", "Date", "Value"]),
            &names(&["Country", "Date"]),
        )
        .unwrap();
        assert!(sql.contains("MERGE [LNGG].[tblBenchmarks] WITH (HOLDLOCK) AS main"));
        assert!(sql.contains("ON (main.[Country] = temp.[Country] AND main.[Date] = temp.[Date])"));
        assert!(sql.contains("WHEN MATCHED THEN\n  UPDATE SET [Value] = temp.[Value]"));
        assert!(sql.contains("WHEN NOT MATCHED THEN\n  INSERT ([Country], [Date], [Value])"));
    }

    #[test]
    fn merge_sql_skips_update_arm_when_all_columns_match() {
        let sql = build_merge_sql(
            "s",
            "t",
            "##abc",
            &names(&["Country"]),
            &names(&["Country"]),
        )
        .unwrap();
        assert!(!sql.contains("WHEN MATCHED"));
        assert!(sql.contains("WHEN NOT MATCHED"));
    }

    #[test]
    fn merge_sql_rejects_unknown_match_column() {
        let err = build_merge_sql(
            "s",
            "t",
            "##abc",
            &names(&["Country"]),
            &names(&["Missing"]),
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { .. }));
    }

    #[test]
    fn insert_sql_renders_kinds() {
        let headers = names(&["Country", "Value", "CrawlDate"]);
        let rows = vec![vec![
            "NO".to_string(),
            "10.0".to_string(),
            "2024-01-01 00:00:00".to_string(),
        ]];
        let kinds = vec![ColumnKind::Text, ColumnKind::Float, ColumnKind::Timestamp];
        let sql = build_insert_sql("[s].[t]", &headers, &rows, &kinds).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO [s].[t] ([Country], [Value], [CrawlDate]) VALUES (N'NO', 10.0, N'2024-01-01 00:00:00')"
        );
    }

    #[test]
    fn chunk_size_follows_parameter_budget() {
        assert_eq!(insert_chunk_rows(5), 419);
        assert_eq!(insert_chunk_rows(2100), 1);
        assert_eq!(insert_chunk_rows(1), 1000);
        assert_eq!(insert_chunk_rows(0), 1000);
    }

    #[test]
    fn monitoring_record_table_shape() {
        let table = MonitoringRecord::new("LNGG", "tblBenchmarks", 3, true).to_table();
        assert_eq!(
            table.headers(),
            &[
                "Schema".to_string(),
                "Table".to_string(),
                "Nr_of_rows".to_string(),
                "Upload successful".to_string(),
                "Timestamp".to_string(),
            ]
        );
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.cell(0, "Nr_of_rows"), "3");
        assert_eq!(table.cell(0, "Upload successful"), "True");
    }
}
