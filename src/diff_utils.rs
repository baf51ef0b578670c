// diff_utils.rs
use crate::error_utils::LoadError;
use crate::table_utils::Table;

/// Rows attached to notification emails are capped at this many.
pub const PREVIEW_ROWS: usize = 50;

/// Alias the stored value carries in the comparison join.
pub fn old_value_column(value_column: &str) -> String {
    format!("old_{}", value_column)
}

/// The minimal set of new or changed rows computed for one load, plus a
/// preview projection for notification. Computed once per load, consumed by
/// the writer, discarded after write and notify.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    /// Included rows projected onto the original column set.
    pub rows: Table,
    /// Identity columns + old value + new value, first `PREVIEW_ROWS` rows.
    pub preview: Table,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn identity_key(table: &Table, row: usize, identity_columns: &[String]) -> String {
    identity_columns
        .iter()
        .map(|c| table.cell(row, c))
        .collect::<Vec<&str>>()
        .join("\u{1f}")
}

fn rounded(value: f64, precision: u32) -> i64 {
    (value * 10f64.powi(precision as i32)).round() as i64
}

/// Whether a stored value and an incoming value differ at `precision`
/// decimals. Numeric values are compared by scaled rounding, never by exact
/// float equality; non-numeric values fall back to string inequality.
fn values_differ(new_value: &str, old_value: &str, precision: u32) -> bool {
    match (new_value.parse::<f64>(), old_value.parse::<f64>()) {
        (Ok(n), Ok(o)) => rounded(n, precision) != rounded(o, precision),
        _ => new_value != old_value,
    }
}

/// Compares freshly normalized rows against the canonical stored row per
/// identity partition and keeps only the rows whose value actually changed.
///
/// `old_rows` carries the identity columns plus the stored value aliased to
/// `old_<value_column>` (the shape `latest_rows` returns). A new row whose
/// identity has no stored counterpart is implicitly new and always included.
/// An empty result is a valid outcome, not an error.
///
/// ```
/// use resql::diff_utils::compute_change_set;
/// use resql::table_utils::Table;
///
/// let new_rows = Table::from_raw_data(
///     vec!["Country".into(), "Value".into(), "CrawlDate".into()],
///     vec![
///         vec!["NO".into(), "10.0004".into(), "2024-02-01 00:00:00".into()],
///         vec!["SE".into(), "6.0".into(), "2024-02-01 00:00:00".into()],
///     ],
/// );
/// let old_rows = Table::from_raw_data(
///     vec!["Country".into(), "old_Value".into()],
///     vec![
///         vec!["NO".into(), "10.0".into()],
///         vec!["SE".into(), "5.0".into()],
///     ],
/// );
///
/// let identity = vec!["Country".to_string()];
/// let change = compute_change_set(&new_rows, &old_rows, &identity, "Value", 3).unwrap();
///
/// // 10.0004 rounds to 10.0 at 3 decimals and drops out, 6.0 vs 5.0 stays
/// assert_eq!(change.rows.row_count(), 1);
/// assert_eq!(change.rows.cell(0, "Country"), "SE");
/// ```
pub fn compute_change_set(
    new_rows: &Table,
    old_rows: &Table,
    identity_columns: &[String],
    value_column: &str,
    precision: u32,
) -> Result<ChangeSet, LoadError> {
    if !new_rows.has_column(value_column) {
        return Err(LoadError::SchemaMismatch {
            table: "input data".to_string(),
            column: value_column.to_string(),
        });
    }
    let old_column = old_value_column(value_column);

    // canonical stored value per identity key
    let mut stored: std::collections::HashMap<String, &str> = std::collections::HashMap::new();
    for row in 0..old_rows.row_count() {
        stored.insert(
            identity_key(old_rows, row, identity_columns),
            old_rows.cell(row, &old_column),
        );
    }

    let mut included: Vec<Vec<String>> = Vec::new();
    let mut preview_rows: Vec<Vec<String>> = Vec::new();

    for row in 0..new_rows.row_count() {
        let new_value = new_rows.cell(row, value_column);
        let key = identity_key(new_rows, row, identity_columns);
        let changed = match stored.get(&key) {
            Some(old_value) => values_differ(new_value, old_value, precision),
            None => true,
        };
        if !changed {
            continue;
        }

        included.push(new_rows.data()[row].clone());

        if preview_rows.len() < PREVIEW_ROWS {
            let mut preview_row: Vec<String> = identity_columns
                .iter()
                .map(|c| new_rows.cell(row, c).to_string())
                .collect();
            preview_row.push(stored.get(&key).copied().unwrap_or("").to_string());
            preview_row.push(new_value.to_string());
            preview_rows.push(preview_row);
        }
    }

    let mut preview_headers: Vec<String> = identity_columns.to_vec();
    preview_headers.push(old_column);
    preview_headers.push(value_column.to_string());

    Ok(ChangeSet {
        rows: Table::from_raw_data(new_rows.headers().to_vec(), included),
        preview: Table::from_raw_data(preview_headers, preview_rows),
    })
}
