// table_utils.rs
use crate::error_utils::LoadError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::fs::File;

/// Scalar kind inferred for a column of a `Table`. A column is `Text` unless
/// every non-empty value parses as the same stricter kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Float,
    Timestamp,
}

impl ColumnKind {
    /// Returns the SQL Server type this kind maps to. Text columns are
    /// bounded at `max_varchar` characters to avoid NVARCHAR(MAX) columns.
    pub fn sql_type(&self, max_varchar: usize) -> String {
        match self {
            ColumnKind::Text => format!("NVARCHAR({})", max_varchar),
            ColumnKind::Integer => "INT".to_string(),
            ColumnKind::Float => "FLOAT".to_string(),
            ColumnKind::Timestamp => "DATETIME".to_string(),
        }
    }
}

/// Represents an input payload on one of the four accepted shapes. The shape
/// is decided once here, at the boundary, and never re-inspected downstream.
#[derive(Debug, Clone)]
pub enum DataSource {
    /// An already rectangular table with embedded column names.
    Table(Table),
    /// A row-major matrix, one row per inner vector.
    Matrix(Vec<Vec<String>>),
    /// A flat vector: a single row when its length equals the column-name
    /// list, else one row per element in a single column.
    Vector(Vec<String>),
    /// Key/value pairs, each becoming one row of a two-column table.
    Mapping(Vec<(String, String)>),
}

/// Represents a rectangular, named-column dataset held as a string grid.
/// This is the uniform shape everything is materialized into before it
/// touches the database.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    headers: Vec<String>,
    data: Vec<Vec<String>>,
}

impl Table {
    /// Creates a new, empty `Table`.
    pub fn new() -> Self {
        Table {
            headers: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Creates a `Table` from headers and data.
    ///
    /// ```
    /// use resql::table_utils::Table;
    ///
    /// let headers = vec!["Country".to_string(), "Value".to_string()];
    /// let data = vec![vec!["NO".to_string(), "10.0".to_string()]];
    ///
    /// let table = Table::from_raw_data(headers.clone(), data.clone());
    /// assert_eq!(table.headers(), &headers[..]);
    /// assert_eq!(table.data(), &data[..]);
    /// ```
    pub fn from_raw_data(headers: Vec<String>, data: Vec<Vec<String>>) -> Self {
        Table { headers, data }
    }

    /// Reads a CSV file into a `Table`, first record as headers.
    pub fn from_csv_file(file_path: &str) -> Result<Self, LoadError> {
        let file = File::open(file_path).map_err(|e| LoadError::Query {
            context: format!("reading {}", file_path),
            detail: e.to_string(),
        })?;
        let mut rdr = csv::Reader::from_reader(file);

        let headers = rdr
            .headers()
            .map_err(|e| LoadError::Query {
                context: format!("reading {}", file_path),
                detail: e.to_string(),
            })?
            .iter()
            .map(String::from)
            .collect();

        let mut data = Vec::new();
        for result in rdr.records() {
            let record = result.map_err(|e| LoadError::Query {
                context: format!("reading {}", file_path),
                detail: e.to_string(),
            })?;
            data.push(record.iter().map(String::from).collect());
        }

        Ok(Table { headers, data })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn data(&self) -> &[Vec<String>] {
        &self.data
    }

    pub fn row_count(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the position of `column_name` among the headers, if present.
    pub fn column_index(&self, column_name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == column_name)
    }

    pub fn has_column(&self, column_name: &str) -> bool {
        self.column_index(column_name).is_some()
    }

    /// Sets the headers of the table.
    pub fn set_headers(&mut self, headers: Vec<&str>) -> &mut Self {
        self.headers = headers.into_iter().map(String::from).collect();
        self
    }

    /// Adds a single data row.
    pub fn add_row(&mut self, row: Vec<&str>) -> &mut Self {
        self.data.push(row.into_iter().map(String::from).collect());
        self
    }

    /// Appends a column with the same `fill` value on every existing row.
    pub fn add_column(&mut self, column_name: &str, fill: &str) -> &mut Self {
        self.headers.push(column_name.to_string());
        for row in &mut self.data {
            row.push(fill.to_string());
        }
        self
    }

    /// Returns a copy limited to the first `n` rows.
    pub fn head(&self, n: usize) -> Table {
        Table {
            headers: self.headers.clone(),
            data: self.data.iter().take(n).cloned().collect(),
        }
    }

    /// Returns the cell at (`row`, `column_name`), empty string when the row
    /// is ragged or the column is unknown.
    pub fn cell(&self, row: usize, column_name: &str) -> &str {
        match self.column_index(column_name) {
            Some(i) => self
                .data
                .get(row)
                .and_then(|r| r.get(i))
                .map(|s| s.as_str())
                .unwrap_or(""),
            None => "",
        }
    }

    /// Saves the table to a CSV file at `file_path`. Short rows are padded
    /// with empty strings up to the header width.
    pub fn save_as(&mut self, file_path: &str) -> Result<&mut Self, LoadError> {
        let file = File::create(file_path).map_err(|e| LoadError::Query {
            context: format!("writing {}", file_path),
            detail: e.to_string(),
        })?;
        let mut wtr = csv::Writer::from_writer(file);

        if !self.headers.is_empty() {
            wtr.write_record(&self.headers).map_err(|e| LoadError::Query {
                context: format!("writing {}", file_path),
                detail: e.to_string(),
            })?;
        }

        let headers_len = self.headers.len();
        for record in &mut self.data {
            while record.len() < headers_len {
                record.push("".to_string());
            }
            wtr.write_record(&*record).map_err(|e| LoadError::Query {
                context: format!("writing {}", file_path),
                detail: e.to_string(),
            })?;
        }

        wtr.flush().map_err(|e| LoadError::Query {
            context: format!("writing {}", file_path),
            detail: e.to_string(),
        })?;

        Ok(self)
    }

    /// Prints up to `max_rows` rows as an aligned text table, followed by the
    /// total row count. Cell content is capped at 45 characters per column.
    pub fn print_table(&self, max_rows: usize) -> &Self {
        let max_cell_width: usize = 45;

        let mut max_lengths = self
            .headers
            .iter()
            .map(|h| h.len() + 1)
            .collect::<Vec<usize>>();
        for row in self.data.iter().take(max_rows) {
            for (i, cell) in row.iter().enumerate() {
                if i < max_lengths.len() {
                    let current_max = std::cmp::max(max_lengths[i], cell.len());
                    max_lengths[i] = std::cmp::min(current_max, max_cell_width);
                }
            }
        }

        let format_cell =
            |s: &String, max_length: usize| -> String { format!("{:width$.width$}", s, width = max_length) };

        let table_width = max_lengths.iter().map(|&len| len + 1).sum::<usize>() + 1;

        println!(
            "\n|{}|",
            self.headers
                .iter()
                .zip(max_lengths.iter())
                .map(|(header, &max_length)| format_cell(header, max_length))
                .collect::<Vec<String>>()
                .join("|")
        );
        println!("{}", "-".repeat(table_width));

        for row in self.data.iter().take(max_rows) {
            println!(
                "|{}|",
                row.iter()
                    .zip(max_lengths.iter())
                    .map(|(cell, &max_length)| format_cell(cell, max_length))
                    .collect::<Vec<String>>()
                    .join("|")
            );
        }

        println!("Total rows: {}", self.data.len());

        self
    }

    /// Renders the table as an HTML table truncated to `max_rows` rows, the
    /// shape the notifier attaches to its emails.
    pub fn to_html(&self, max_rows: usize) -> String {
        fn escape(s: &str) -> String {
            s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
        }

        let mut html = String::from("<table border=\"1\"><thead><tr>");
        for header in &self.headers {
            html.push_str(&format!("<th>{}</th>", escape(header)));
        }
        html.push_str("</tr></thead><tbody>");
        for row in self.data.iter().take(max_rows) {
            html.push_str("<tr>");
            for cell in row {
                html.push_str(&format!("<td>{}</td>", escape(cell)));
            }
            html.push_str("</tr>");
        }
        html.push_str("</tbody></table>");
        html
    }
}

/// Materializes an input payload into a uniform rectangular `Table` and
/// stamps the ingestion-timestamp column.
///
/// `column_names` is required whenever the shape carries no embedded names
/// (matrix, vector, mapping). If no column named `crawldate_column` exists
/// after materialization, one is appended and stamped uniformly with the
/// current UTC instant.
///
/// Payloads matching none of the accepted shapes, empty payloads and ragged
/// matrices fail with `UnrecognizedShape` before anything is written.
///
/// ```
/// use resql::table_utils::{normalize, DataSource};
///
/// let cols = vec!["Country".to_string(), "Date".to_string(), "Value".to_string()];
/// let matrix = DataSource::Matrix(vec![
///     vec!["NO".to_string(), "2024-01".to_string(), "10.0".to_string()],
///     vec!["SE".to_string(), "2024-01".to_string(), "5.0".to_string()],
/// ]);
///
/// let table = normalize(matrix, &cols, "CrawlDate").unwrap();
/// assert_eq!(table.row_count(), 2);
/// assert!(table.has_column("CrawlDate"));
/// ```
pub fn normalize(
    source: DataSource,
    column_names: &[String],
    crawldate_column: &str,
) -> Result<Table, LoadError> {
    let mut table = match source {
        DataSource::Table(t) => {
            if t.headers().is_empty() {
                return Err(LoadError::UnrecognizedShape(
                    "table payload has no column names".to_string(),
                ));
            }
            t
        }
        DataSource::Matrix(rows) => {
            if column_names.is_empty() {
                return Err(LoadError::UnrecognizedShape(
                    "matrix payload requires a column name list".to_string(),
                ));
            }
            for row in &rows {
                if row.len() != column_names.len() {
                    return Err(LoadError::UnrecognizedShape(format!(
                        "matrix row has {} cells but {} column names were given",
                        row.len(),
                        column_names.len()
                    )));
                }
            }
            Table::from_raw_data(column_names.to_vec(), rows)
        }
        DataSource::Vector(values) => {
            if values.len() == column_names.len() && !values.is_empty() {
                // the vector is one row
                Table::from_raw_data(column_names.to_vec(), vec![values])
            } else if column_names.len() == 1 {
                // the vector is one column
                Table::from_raw_data(
                    column_names.to_vec(),
                    values.into_iter().map(|v| vec![v]).collect(),
                )
            } else {
                return Err(LoadError::UnrecognizedShape(format!(
                    "vector of {} values fits neither one row of {} columns nor a single column",
                    values.len(),
                    column_names.len()
                )));
            }
        }
        DataSource::Mapping(pairs) => {
            if column_names.len() != 2 {
                return Err(LoadError::UnrecognizedShape(format!(
                    "mapping payload requires exactly 2 column names, {} were given",
                    column_names.len()
                )));
            }
            Table::from_raw_data(
                column_names.to_vec(),
                pairs.into_iter().map(|(k, v)| vec![k, v]).collect(),
            )
        }
    };

    if table.is_empty() {
        return Err(LoadError::UnrecognizedShape(
            "input data cannot be None / empty".to_string(),
        ));
    }

    if !table.has_column(crawldate_column) {
        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        table.add_column(crawldate_column, &stamp);
    }

    let non_crawldate = table
        .headers()
        .iter()
        .filter(|h| h.as_str() != crawldate_column)
        .count();
    if non_crawldate == 0 {
        return Err(LoadError::UnrecognizedShape(
            "payload has no columns besides the ingestion timestamp".to_string(),
        ));
    }

    Ok(table)
}

/// Infers one `ColumnKind` per column. Inference is best effort over the
/// non-empty values: all-integer columns are `Integer`, numeric columns with
/// a fractional value widen to `Float`, all-timestamp columns are
/// `Timestamp`, everything else is `Text`.
pub fn infer_column_kinds(table: &Table) -> Vec<ColumnKind> {
    (0..table.headers().len())
        .map(|i| {
            let mut seen = false;
            let mut all_int = true;
            let mut all_float = true;
            let mut all_ts = true;
            for row in table.data() {
                let value = match row.get(i) {
                    Some(v) if !v.is_empty() => v,
                    _ => continue,
                };
                seen = true;
                if value.parse::<i64>().is_err() {
                    all_int = false;
                }
                if value.parse::<f64>().is_err() {
                    all_float = false;
                }
                if parse_timestamp(value).is_none() {
                    all_ts = false;
                }
            }
            if !seen {
                ColumnKind::Text
            } else if all_int {
                ColumnKind::Integer
            } else if all_float {
                ColumnKind::Float
            } else if all_ts {
                ColumnKind::Timestamp
            } else {
                ColumnKind::Text
            }
        })
        .collect()
}

/// Parses a timestamp from a string using the date formats the warehouse
/// emits, returning `None` when nothing matches.
pub fn parse_timestamp(time_str: &str) -> Option<NaiveDateTime> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.3f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%z",
        "%m/%d/%Y %I:%M:%S %p",
    ];

    formats
        .iter()
        .find_map(|&format| NaiveDateTime::parse_from_str(time_str, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(time_str, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .or_else(|| {
            DateTime::parse_from_rfc3339(time_str)
                .map(|dt| dt.naive_local())
                .ok()
        })
}
