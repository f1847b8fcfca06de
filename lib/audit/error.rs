use diesel::result::Error as DieselError;
use thiserror::Error;

use crate::store::StoreError;

/// Anything an instrumented operation can raise while it runs.
///
/// These never leave [`super::Auditor::invoke`]: they are rendered into the log record and
/// surfaced to callers as [`super::Invocation::Failed`].
#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("query failed: {0}")]
    Query(#[from] DieselError),

    #[error("invalid cron expression `{expression}`: {source}")]
    Cron {
        expression: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("missing required input `{0}`")]
    MissingInput(&'static str),

    #[error("{0}")]
    Invalid(String),
}

/// The audit record itself could not be written.
///
/// There is no further fallback for this, so it aborts the batch.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to acquire a connection for the audit log")]
    Acquire(#[source] StoreError),

    #[error("failed to append audit record to {table}")]
    Append {
        table: String,
        #[source]
        source: DieselError,
    },
}

/// Structured failure cause of one instrumented call.
#[derive(Debug)]
pub struct OperationFailure {
    pub action: &'static str,
    pub error: OperationError,
    /// Full error chain, as persisted in the log record.
    pub report: String,
}
