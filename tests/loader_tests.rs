// loader_tests.rs
//
// End-to-end pipeline tests against an in-memory session and a recording
// mail transport.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use resql::error_utils::LoadError;
use resql::loader_utils::{LoadConfig, SqlLoader};
use resql::mail_utils::{MailTransport, Notifier};
use resql::sql_utils::{KeepPolicy, SqlColumn, SqlSession, WriteMode};
use resql::table_utils::{parse_timestamp, DataSource, Table};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// In-memory stand-in for a SQL Server database, one per test.
#[derive(Default)]
struct FakeSession {
    schemas: HashSet<String>,
    tables: HashMap<(String, String), Table>,
    fail_appends_to: Option<(String, String)>,
}

impl FakeSession {
    fn key(schema_name: &str, table_name: &str) -> (String, String) {
        (schema_name.to_string(), table_name.to_string())
    }

    fn stored(&self, schema_name: &str, table_name: &str) -> Option<&Table> {
        self.tables.get(&Self::key(schema_name, table_name))
    }

    fn missing(schema_name: &str, table_name: &str) -> LoadError {
        LoadError::Query {
            context: format!("{}.{}", schema_name, table_name),
            detail: "table does not exist".to_string(),
        }
    }

    fn partition_key(row: &[String], indices: &[usize]) -> String {
        indices
            .iter()
            .map(|&i| row.get(i).map(|s| s.as_str()).unwrap_or(""))
            .collect::<Vec<&str>>()
            .join("\u{1f}")
    }

    /// Row index of the partition survivor under the keep policy.
    fn survivors(
        data: &[Vec<String>],
        partition_indices: &[usize],
        crawl_index: usize,
        policy: KeepPolicy,
    ) -> HashMap<String, usize> {
        let mut best: HashMap<String, usize> = HashMap::new();
        for (i, row) in data.iter().enumerate() {
            let key = Self::partition_key(row, partition_indices);
            let current = best.get(&key).copied();
            match current {
                None => {
                    best.insert(key, i);
                }
                Some(current) => {
                    let current_stamp = &data[current][crawl_index];
                    let this_stamp = &row[crawl_index];
                    let better = match policy {
                        KeepPolicy::KeepOldest => this_stamp < current_stamp,
                        KeepPolicy::ReplaceWithNewest => this_stamp > current_stamp,
                    };
                    if better {
                        best.insert(key, i);
                    }
                }
            }
        }
        best
    }
}

#[async_trait]
impl SqlSession for FakeSession {
    async fn query_to_table(&mut self, sql: &str) -> Result<Table, LoadError> {
        Err(LoadError::Query {
            context: sql.chars().take(120).collect(),
            detail: "raw queries are not supported by the fake session".to_string(),
        })
    }

    async fn execute(&mut self, _sql: &str) -> Result<u64, LoadError> {
        Ok(0)
    }

    async fn table_columns(
        &mut self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Vec<SqlColumn>, LoadError> {
        Ok(self
            .stored(schema_name, table_name)
            .map(|t| {
                t.headers()
                    .iter()
                    .map(|h| SqlColumn {
                        name: h.clone(),
                        data_type: "nvarchar".to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn row_count(&mut self, schema_name: &str, table_name: &str) -> Result<u64, LoadError> {
        Ok(self
            .stored(schema_name, table_name)
            .map(|t| t.row_count() as u64)
            .unwrap_or(0))
    }

    async fn schema_exists(&mut self, schema_name: &str) -> Result<bool, LoadError> {
        Ok(self.schemas.contains(schema_name))
    }

    async fn create_schema(&mut self, schema_name: &str) -> Result<(), LoadError> {
        self.schemas.insert(schema_name.to_string());
        Ok(())
    }

    async fn drop_schema(&mut self, schema_name: &str) -> Result<(), LoadError> {
        self.schemas.remove(schema_name);
        self.tables.retain(|(s, _), _| s != schema_name);
        Ok(())
    }

    async fn table_to_sql(
        &mut self,
        table: &Table,
        schema_name: &str,
        table_name: &str,
        mode: WriteMode,
        _max_varchar: usize,
    ) -> Result<(), LoadError> {
        if let Some((s, t)) = &self.fail_appends_to {
            if s == schema_name && t == table_name {
                return Err(LoadError::Query {
                    context: format!("{}.{}", schema_name, table_name),
                    detail: "simulated write failure".to_string(),
                });
            }
        }

        match mode {
            WriteMode::Replace => {
                self.tables
                    .insert(Self::key(schema_name, table_name), table.clone());
                Ok(())
            }
            WriteMode::Append => {
                let stored = self
                    .stored(schema_name, table_name)
                    .cloned()
                    .ok_or_else(|| Self::missing(schema_name, table_name))?;
                for header in table.headers() {
                    if !stored.has_column(header) {
                        return Err(LoadError::SchemaMismatch {
                            table: format!("{}.{}", schema_name, table_name),
                            column: header.clone(),
                        });
                    }
                }
                let mut data = stored.data().to_vec();
                for row in 0..table.row_count() {
                    let aligned: Vec<String> = stored
                        .headers()
                        .iter()
                        .map(|h| table.cell(row, h).to_string())
                        .collect();
                    data.push(aligned);
                }
                self.tables.insert(
                    Self::key(schema_name, table_name),
                    Table::from_raw_data(stored.headers().to_vec(), data),
                );
                Ok(())
            }
        }
    }

    async fn add_column(
        &mut self,
        schema_name: &str,
        table_name: &str,
        column_name: &str,
        _sql_type: &str,
    ) -> Result<(), LoadError> {
        let mut stored = self
            .stored(schema_name, table_name)
            .cloned()
            .ok_or_else(|| Self::missing(schema_name, table_name))?;
        stored.add_column(column_name, "");
        self.tables
            .insert(Self::key(schema_name, table_name), stored);
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
        let stored = self
            .stored(schema_name, table_name)
            .ok_or_else(|| Self::missing(schema_name, table_name))?;
        let partition_indices: Vec<usize> = identity_columns
            .iter()
            .filter_map(|c| stored.column_index(c))
            .collect();
        let crawl_index = stored
            .column_index(crawldate_column)
            .ok_or_else(|| Self::missing(schema_name, crawldate_column))?;

        let survivors = Self::survivors(stored.data(), &partition_indices, crawl_index, policy);

        let mut headers = identity_columns.to_vec();
        headers.push(format!("old_{}", value_column));
        let mut data = Vec::new();
        for &row in survivors.values() {
            let mut out: Vec<String> = identity_columns
                .iter()
                .map(|c| stored.cell(row, c).to_string())
                .collect();
            out.push(stored.cell(row, value_column).to_string());
            data.push(out);
        }
        Ok(Table::from_raw_data(headers, data))
    }

    async fn dedupe(
        &mut self,
        schema_name: &str,
        table_name: &str,
        partition_columns: &[String],
        crawldate_column: &str,
        policy: KeepPolicy,
    ) -> Result<u64, LoadError> {
        let stored = self
            .stored(schema_name, table_name)
            .cloned()
            .ok_or_else(|| Self::missing(schema_name, table_name))?;
        let partition_indices: Vec<usize> = partition_columns
            .iter()
            .filter_map(|c| stored.column_index(c))
            .collect();
        let crawl_index = stored
            .column_index(crawldate_column)
            .ok_or_else(|| Self::missing(schema_name, crawldate_column))?;

        let survivors = Self::survivors(stored.data(), &partition_indices, crawl_index, policy);
        let keep: HashSet<usize> = survivors.values().copied().collect();

        let data: Vec<Vec<String>> = stored
            .data()
            .iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .map(|(_, row)| row.clone())
            .collect();
        let deleted = (stored.row_count() - data.len()) as u64;
        self.tables.insert(
            Self::key(schema_name, table_name),
            Table::from_raw_data(stored.headers().to_vec(), data),
        );
        Ok(deleted)
    }

    async fn merge_upsert(
        &mut self,
        table: &Table,
        schema_name: &str,
        table_name: &str,
        match_columns: &[String],
        _max_varchar: usize,
    ) -> Result<(), LoadError> {
        let stored = self
            .stored(schema_name, table_name)
            .cloned()
            .ok_or_else(|| Self::missing(schema_name, table_name))?;
        let mut data = stored.data().to_vec();

        for row in 0..table.row_count() {
            let matched = data.iter().position(|existing| {
                match_columns.iter().all(|c| match stored.column_index(c) {
                    Some(i) => existing.get(i).map(|s| s.as_str()) == Some(table.cell(row, c)),
                    None => false,
                })
            });
            match matched {
                Some(idx) => {
                    for (i, header) in stored.headers().iter().enumerate() {
                        if table.has_column(header) {
                            data[idx][i] = table.cell(row, header).to_string();
                        }
                    }
                }
                None => {
                    let aligned: Vec<String> = stored
                        .headers()
                        .iter()
                        .map(|h| table.cell(row, h).to_string())
                        .collect();
                    data.push(aligned);
                }
            }
        }

        self.tables.insert(
            Self::key(schema_name, table_name),
            Table::from_raw_data(stored.headers().to_vec(), data),
        );
        Ok(())
    }

    async fn truncate(&mut self, schema_name: &str, table_name: &str) -> Result<(), LoadError> {
        let stored = self
            .stored(schema_name, table_name)
            .cloned()
            .ok_or_else(|| Self::missing(schema_name, table_name))?;
        self.tables.insert(
            Self::key(schema_name, table_name),
            Table::from_raw_data(stored.headers().to_vec(), Vec::new()),
        );
        Ok(())
    }

    async fn delete_where(
        &mut self,
        _schema_name: &str,
        _table_name: &str,
        _conditions: &str,
    ) -> Result<u64, LoadError> {
        Ok(0)
    }

    async fn newest_date(
        &mut self,
        schema_name: &str,
        table_name: &str,
        column_name: &str,
    ) -> Result<Option<NaiveDateTime>, LoadError> {
        Ok(self.stored(schema_name, table_name).and_then(|t| {
            (0..t.row_count())
                .filter_map(|row| parse_timestamp(t.cell(row, column_name)))
                .max()
        }))
    }
}

struct RecordingMail {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl MailTransport for RecordingMail {
    async fn send(
        &self,
        _recipients: &[String],
        subject: &str,
        html_body: &str,
    ) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), html_body.to_string()));
        Ok(())
    }
}

type Sent = Arc<Mutex<Vec<(String, String)>>>;

fn benchmark_config() -> LoadConfig {
    let mut config = LoadConfig::new("crawlertest", "testtable");
    config.column_names = vec![
        "Country".to_string(),
        "Date".to_string(),
        "Value".to_string(),
    ];
    config
}

fn make_loader(config: LoadConfig) -> (SqlLoader, Sent) {
    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let notifier = Notifier::new(
        Box::new(RecordingMail { sent: sent.clone() }),
        vec!["gasmarket@example.com".to_string()],
    );
    (SqlLoader::new(config, notifier), sent)
}

fn benchmark_rows() -> DataSource {
    DataSource::Matrix(vec![
        vec!["NO".to_string(), "2024-01".to_string(), "10.0".to_string()],
        vec!["NO".to_string(), "2024-02".to_string(), "11.0".to_string()],
        vec!["SE".to_string(), "2024-01".to_string(), "5.0".to_string()],
    ])
}

/// Seeds the session with the scenario-A table as if a crawl had stored it
/// earlier, with an explicit ingestion timestamp.
fn seed_benchmark_table(session: &mut FakeSession, stamp: &str) {
    session.schemas.insert("crawlertest".to_string());
    session.tables.insert(
        ("crawlertest".to_string(), "testtable".to_string()),
        Table::from_raw_data(
            vec![
                "Country".to_string(),
                "Date".to_string(),
                "Value".to_string(),
                "CrawlDate".to_string(),
            ],
            vec![
                vec![
                    "NO".to_string(),
                    "2024-01".to_string(),
                    "10.0".to_string(),
                    stamp.to_string(),
                ],
                vec![
                    "NO".to_string(),
                    "2024-02".to_string(),
                    "11.0".to_string(),
                    stamp.to_string(),
                ],
                vec![
                    "SE".to_string(),
                    "2024-01".to_string(),
                    "5.0".to_string(),
                    stamp.to_string(),
                ],
            ],
        ),
    );
}

fn subjects(sent: &Sent) -> Vec<String> {
    sent.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
}

#[tokio::test]
async fn first_load_into_empty_target_writes_all_rows() {
    let mut session = FakeSession::default();
    let (loader, sent) = make_loader(benchmark_config());

    let result = loader.load(&mut session, benchmark_rows()).await.unwrap();

    assert_eq!(result.rows_added, 3);
    assert!(result.new_columns.is_empty());
    assert_eq!(result.change_preview.row_count(), 3);

    let stored = session.stored("crawlertest", "testtable").unwrap();
    assert_eq!(stored.row_count(), 3);
    assert!(stored.has_column("CrawlDate"));

    // monitoring row recorded as successful
    let monitoring = session.stored("Info", "MonitoringTable").unwrap();
    assert_eq!(monitoring.row_count(), 1);
    assert_eq!(monitoring.cell(0, "Upload successful"), "True");
    assert_eq!(monitoring.cell(0, "Nr_of_rows"), "3");

    let subjects = subjects(&sent);
    assert!(subjects.contains(&"New schema created: crawlertest".to_string()));
    assert!(subjects.contains(&"New data added to testtable".to_string()));
}

#[tokio::test]
async fn identical_reload_is_an_empty_change_set() {
    let mut session = FakeSession::default();
    let (loader, sent) = make_loader(benchmark_config());

    loader.load(&mut session, benchmark_rows()).await.unwrap();
    let second = loader.load(&mut session, benchmark_rows()).await.unwrap();

    assert_eq!(second.rows_added, 0);
    assert!(second.change_preview.is_empty());
    assert_eq!(
        session
            .stored("crawlertest", "testtable")
            .unwrap()
            .row_count(),
        3
    );

    // exactly one upload notification across both loads
    let upload_subjects = subjects(&sent)
        .into_iter()
        .filter(|s| s == "New data added to testtable")
        .count();
    assert_eq!(upload_subjects, 1);

    // both attempts left a monitoring row
    let monitoring = session.stored("Info", "MonitoringTable").unwrap();
    assert_eq!(monitoring.row_count(), 2);
    assert_eq!(monitoring.cell(1, "Nr_of_rows"), "0");
    assert_eq!(monitoring.cell(1, "Upload successful"), "True");
}

#[tokio::test]
async fn value_drift_beyond_precision_is_ignored() {
    let mut session = FakeSession::default();
    seed_benchmark_table(&mut session, "2024-01-01 00:00:00");
    let (loader, _sent) = make_loader(benchmark_config());

    let noise = DataSource::Matrix(vec![vec![
        "NO".to_string(),
        "2024-01".to_string(),
        "10.0004".to_string(),
    ]]);
    let result = loader.load(&mut session, noise).await.unwrap();

    assert_eq!(result.rows_added, 0);
    assert!(result.change_preview.is_empty());
    assert_eq!(
        session
            .stored("crawlertest", "testtable")
            .unwrap()
            .row_count(),
        3
    );
}

#[tokio::test]
async fn value_change_at_precision_is_included_with_old_and_new() {
    let mut session = FakeSession::default();
    seed_benchmark_table(&mut session, "2024-01-01 00:00:00");
    let mut config = benchmark_config();
    config.keep_policy = KeepPolicy::ReplaceWithNewest;
    let (loader, _sent) = make_loader(config);

    let changed = DataSource::Matrix(vec![vec![
        "NO".to_string(),
        "2024-01".to_string(),
        "10.01".to_string(),
    ]]);
    let result = loader.load(&mut session, changed).await.unwrap();

    assert_eq!(result.change_preview.row_count(), 1);
    assert_eq!(result.change_preview.cell(0, "old_Value"), "10.0");
    assert_eq!(result.change_preview.cell(0, "Value"), "10.01");

    // replace-with-newest keeps the changed value after duplicate resolution
    let stored = session.stored("crawlertest", "testtable").unwrap();
    assert_eq!(stored.row_count(), 3);
    let no_jan = (0..stored.row_count())
        .find(|&r| stored.cell(r, "Country") == "NO" && stored.cell(r, "Date") == "2024-01")
        .unwrap();
    assert_eq!(stored.cell(no_jan, "Value"), "10.01");
}

#[tokio::test]
async fn keep_oldest_discards_changed_values_on_reload() {
    let mut session = FakeSession::default();
    seed_benchmark_table(&mut session, "2024-01-01 00:00:00");
    let (loader, _sent) = make_loader(benchmark_config());

    let changed = DataSource::Matrix(vec![vec![
        "NO".to_string(),
        "2024-01".to_string(),
        "10.01".to_string(),
    ]]);
    let result = loader.load(&mut session, changed).await.unwrap();

    // the change is detected and previewed, but the old value wins
    assert_eq!(result.change_preview.row_count(), 1);
    let stored = session.stored("crawlertest", "testtable").unwrap();
    assert_eq!(stored.row_count(), 3);
    let no_jan = (0..stored.row_count())
        .find(|&r| stored.cell(r, "Country") == "NO" && stored.cell(r, "Date") == "2024-01")
        .unwrap();
    assert_eq!(stored.cell(no_jan, "Value"), "10.0");
}

#[tokio::test]
async fn dedup_keeps_earlier_row_regardless_of_input_order() {
    for (first_stamp, second_stamp) in [
        ("2024-01-01 00:00:00", "2024-02-01 00:00:00"),
        ("2024-02-01 00:00:00", "2024-01-01 00:00:00"),
    ] {
        let mut session = FakeSession::default();
        session.schemas.insert("crawlertest".to_string());
        session.tables.insert(
            ("crawlertest".to_string(), "testtable".to_string()),
            Table::from_raw_data(
                vec![
                    "Country".to_string(),
                    "Date".to_string(),
                    "Value".to_string(),
                    "CrawlDate".to_string(),
                ],
                vec![
                    vec![
                        "NO".to_string(),
                        "2024-01".to_string(),
                        "1.0".to_string(),
                        first_stamp.to_string(),
                    ],
                    vec![
                        "NO".to_string(),
                        "2024-01".to_string(),
                        "2.0".to_string(),
                        second_stamp.to_string(),
                    ],
                ],
            ),
        );

        let (loader, _sent) = make_loader(benchmark_config());
        let deleted = loader.remove_duplicates(&mut session).await.unwrap();
        assert_eq!(deleted, 1);

        let stored = session.stored("crawlertest", "testtable").unwrap();
        assert_eq!(stored.row_count(), 1);
        assert_eq!(stored.cell(0, "CrawlDate"), "2024-01-01 00:00:00");
    }
}

#[tokio::test]
async fn replace_with_newest_keeps_later_row() {
    let mut session = FakeSession::default();
    session.schemas.insert("crawlertest".to_string());
    session.tables.insert(
        ("crawlertest".to_string(), "testtable".to_string()),
        Table::from_raw_data(
            vec![
                "Country".to_string(),
                "Date".to_string(),
                "Value".to_string(),
                "CrawlDate".to_string(),
            ],
            vec![
                vec![
                    "NO".to_string(),
                    "2024-01".to_string(),
                    "1.0".to_string(),
                    "2024-01-01 00:00:00".to_string(),
                ],
                vec![
                    "NO".to_string(),
                    "2024-01".to_string(),
                    "2.0".to_string(),
                    "2024-02-01 00:00:00".to_string(),
                ],
            ],
        ),
    );

    let mut config = benchmark_config();
    config.keep_policy = KeepPolicy::ReplaceWithNewest;
    let (loader, _sent) = make_loader(config);
    loader.remove_duplicates(&mut session).await.unwrap();

    let stored = session.stored("crawlertest", "testtable").unwrap();
    assert_eq!(stored.row_count(), 1);
    assert_eq!(stored.cell(0, "Value"), "2.0");
}

#[tokio::test]
async fn all_value_columns_is_a_configuration_error() {
    let mut session = FakeSession::default();
    let mut config = benchmark_config();
    config.value_columns = vec![
        "Country".to_string(),
        "Date".to_string(),
        "Value".to_string(),
        "CrawlDate".to_string(),
    ];
    let (loader, sent) = make_loader(config);

    let err = loader
        .load(&mut session, benchmark_rows())
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::InvalidValueColumns { .. }));

    // the failure was monitored and reported
    let monitoring = session.stored("Info", "MonitoringTable").unwrap();
    assert_eq!(monitoring.cell(0, "Upload successful"), "False");
    assert!(subjects(&sent).contains(&"Crawler Error".to_string()));
}

#[tokio::test]
async fn unrecognized_shape_is_rejected_and_notified() {
    let mut session = FakeSession::default();
    let (loader, sent) = make_loader(benchmark_config());

    let ragged = DataSource::Matrix(vec![
        vec!["NO".to_string(), "2024-01".to_string(), "10.0".to_string()],
        vec!["SE".to_string()],
    ]);
    let err = loader.load(&mut session, ragged).await.unwrap_err();
    assert!(matches!(err, LoadError::UnrecognizedShape(_)));

    // rejected before any write to the target
    assert!(session.stored("crawlertest", "testtable").is_none());
    assert!(subjects(&sent).contains(&"Crawler Error".to_string()));
}

#[tokio::test]
async fn write_failure_rolls_back_created_schema() {
    let mut session = FakeSession::default();
    session.fail_appends_to = Some(("crawlertest".to_string(), "testtable".to_string()));
    let (loader, sent) = make_loader(benchmark_config());

    let err = loader
        .load(&mut session, benchmark_rows())
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Query { .. }));

    // schema created within the failed operation is gone again
    assert!(!session.schemas.contains("crawlertest"));
    assert!(session.stored("crawlertest", "testtable").is_none());

    let monitoring = session.stored("Info", "MonitoringTable").unwrap();
    assert_eq!(monitoring.cell(0, "Upload successful"), "False");

    let subjects = subjects(&sent);
    assert!(subjects.contains(&"Schema rolled back: crawlertest".to_string()));
    assert!(subjects.contains(&"Crawler Error".to_string()));
}

#[tokio::test]
async fn payload_with_extra_column_widens_the_target() {
    let mut session = FakeSession::default();
    seed_benchmark_table(&mut session, "2024-01-01 00:00:00");

    let mut config = benchmark_config();
    config.column_names = vec![
        "Country".to_string(),
        "Date".to_string(),
        "Value".to_string(),
        "Source".to_string(),
    ];
    let (loader, _sent) = make_loader(config);

    let widened = DataSource::Matrix(vec![vec![
        "NO".to_string(),
        "2024-03".to_string(),
        "12.0".to_string(),
        "GIE".to_string(),
    ]]);
    let result = loader.load(&mut session, widened).await.unwrap();

    assert_eq!(result.rows_added, 1);
    assert_eq!(result.new_columns, vec!["Source".to_string()]);
    let stored = session.stored("crawlertest", "testtable").unwrap();
    assert!(stored.has_column("Source"));
    assert_eq!(stored.row_count(), 4);
}

#[tokio::test]
async fn vector_and_mapping_payloads_load_end_to_end() {
    let mut session = FakeSession::default();
    let (loader, _sent) = make_loader(benchmark_config());

    // single row as a flat vector
    let row = DataSource::Vector(vec![
        "NO".to_string(),
        "2024-01".to_string(),
        "10.0".to_string(),
    ]);
    let result = loader.load(&mut session, row).await.unwrap();
    assert_eq!(result.rows_added, 1);

    // mapping into a fresh two-column table
    let mut config = LoadConfig::new("crawlertest", "capacities");
    config.column_names = vec!["Country".to_string(), "Value".to_string()];
    let (loader, _sent) = make_loader(config);
    let mapping = DataSource::Mapping(vec![
        ("NO".to_string(), "95.5".to_string()),
        ("SE".to_string(), "88.1".to_string()),
    ]);
    let result = loader.load(&mut session, mapping).await.unwrap();
    assert_eq!(result.rows_added, 2);
}

#[tokio::test]
async fn direct_upsert_updates_matched_and_inserts_unmatched() {
    let mut session = FakeSession::default();
    seed_benchmark_table(&mut session, "2024-01-01 00:00:00");

    let upsert_rows = Table::from_raw_data(
        vec![
            "Country".to_string(),
            "Date".to_string(),
            "Value".to_string(),
        ],
        vec![
            vec!["NO".to_string(), "2024-01".to_string(), "99.0".to_string()],
            vec!["DK".to_string(), "2024-01".to_string(), "3.0".to_string()],
        ],
    );
    let (loader, sent) = make_loader(benchmark_config());
    let result = loader
        .upsert(
            &mut session,
            &upsert_rows,
            &["Country".to_string(), "Date".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(result.rows_added, 1);
    let stored = session.stored("crawlertest", "testtable").unwrap();
    assert_eq!(stored.row_count(), 4);
    let no_jan = (0..stored.row_count())
        .find(|&r| stored.cell(r, "Country") == "NO" && stored.cell(r, "Date") == "2024-01")
        .unwrap();
    assert_eq!(stored.cell(no_jan, "Value"), "99.0");
    assert!(subjects(&sent).contains(&"New data added to testtable".to_string()));
}

#[tokio::test]
async fn truncate_and_upload_replaces_all_rows() {
    let mut session = FakeSession::default();
    seed_benchmark_table(&mut session, "2024-01-01 00:00:00");

    let replacement = Table::from_raw_data(
        vec![
            "Country".to_string(),
            "Date".to_string(),
            "Value".to_string(),
            "CrawlDate".to_string(),
        ],
        vec![vec![
            "FI".to_string(),
            "2024-01".to_string(),
            "7.0".to_string(),
            "2024-03-01 00:00:00".to_string(),
        ]],
    );
    let (loader, _sent) = make_loader(benchmark_config());
    let result = loader
        .truncate_and_upload(&mut session, &replacement)
        .await
        .unwrap();

    assert_eq!(result.rows_added, 1);
    let stored = session.stored("crawlertest", "testtable").unwrap();
    assert_eq!(stored.row_count(), 1);
    assert_eq!(stored.cell(0, "Country"), "FI");
}

#[tokio::test]
async fn plain_upload_creates_missing_destination() {
    let mut session = FakeSession::default();
    let table = Table::from_raw_data(
        vec!["Terminal".to_string(), "Value".to_string()],
        vec![vec!["Zeebrugge".to_string(), "1.0".to_string()]],
    );
    let config = LoadConfig::new("crawlertest", "terminals");
    let (loader, _sent) = make_loader(config);

    let result = loader.upload(&mut session, &table).await.unwrap();
    assert_eq!(result.rows_added, 1);
    assert_eq!(
        session
            .stored("crawlertest", "terminals")
            .unwrap()
            .row_count(),
        1
    );
}
