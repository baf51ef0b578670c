// error_utils.rs
use thiserror::Error;

/// Error taxonomy for the load pipeline.
///
/// Nothing in the pipeline retries: every variant is fatal for the operation
/// that raised it, surfaces to the caller, and (at the write boundary) to a
/// human through the notifier. The only errors ever swallowed are transport
/// failures inside the notifier itself.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Authentication or network failure while opening a session. Single
    /// attempt, fail fast.
    #[error("could not create a connection with {server} and {database}: {detail}")]
    Connection {
        server: String,
        database: String,
        detail: String,
    },

    /// A statement or query failed at the database.
    #[error("{context} failed: {detail}")]
    Query { context: String, detail: String },

    /// An append referenced a column the destination does not have. The
    /// caller must widen the schema first.
    #[error("column [{column}] is missing from {table}")]
    SchemaMismatch { table: String, column: String },

    /// The input payload matched none of the accepted shapes. Terminal,
    /// rejected before any write.
    #[error("did not recognise input data structure: {0}")]
    UnrecognizedShape(String),

    /// Caller configuration bug: no identity column would remain.
    #[error("every column cannot be a value column ({value_columns} value columns declared over {total_columns} columns)")]
    InvalidValueColumns {
        value_columns: usize,
        total_columns: usize,
    },

    /// The windowed duplicate delete failed. The statement is atomic, so the
    /// table is left unmodified.
    #[error("duplicate removal on {table} failed: {detail}")]
    Deduplication { table: String, detail: String },

    /// A caller-supplied schema, table or column name failed the identifier
    /// allow-list.
    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    /// Varchar width outside (0, 1023].
    #[error("varchar size {0} out of range, maximum is 1023 and 0 is not allowed")]
    VarcharSize(usize),

    /// A load configuration could not be parsed or is inconsistent.
    #[error("invalid load configuration: {0}")]
    Config(String),
}
