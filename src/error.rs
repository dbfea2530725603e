//! Error types for the ingestion pipeline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// A bounded stage queue rejected an item. Recovered locally by
    /// dropping; only surfaced to callers at the very first hand-off.
    #[error("Queue full: {0}")]
    QueueFull(&'static str),

    #[error("Graph transaction failed at {statement} ({rows} rows): {source}")]
    Transaction {
        statement: &'static str,
        rows: usize,
        #[source]
        source: Box<IngestError>,
    },

    #[error("Graph store error: {0}")]
    Store(String),

    #[error("Key/value store error: {0}")]
    KeyValue(String),

    #[error("Pipeline is shut down")]
    Closed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IngestError {
    /// Wrap a statement failure with enough context to diagnose which
    /// statement of which batch aborted the transaction.
    pub fn in_statement(self, statement: &'static str, rows: usize) -> Self {
        IngestError::Transaction {
            statement,
            rows,
            source: Box::new(self),
        }
    }
}
