//! Instrumentation wrapper: turns any store operation into an audited, fault-isolated call.
//!
//! Every [`Auditor::invoke`] does the same thing regardless of the operation:
//! 1. Snapshot the operation's loggable inputs (its `Serialize` impl decides what is loggable).
//! 2. Acquire a connection, run the operation, release the connection.
//! 3. Render the outcome into a message.
//! 4. Acquire a second, independent connection and append exactly one log record.
//!
//! Operation failures stop at this boundary and come back as [`Invocation::Failed`]. Only a
//! failure to write the log record itself escapes, as [`AuditError`].

mod error;
mod sink;

pub use error::{AuditError, OperationError, OperationFailure};
pub use sink::{LogRecord, LogSink, SinkError, CORE_COLUMNS};

use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::logging::format_error_chain;
use crate::metrics::{OperationOutcome, SegmenterMetrics};
use crate::store::{Connector, Describe, StoreConnection};

/// A unit of work against the store that can be audited.
pub trait Operation {
    /// Call-site arguments. Fields marked `#[serde(skip)]` stay out of the log record.
    type Input: Serialize;
    type Output: Describe;

    /// Name recorded in the log's `action` column.
    fn action(&self) -> &'static str;

    /// One-line summary that starts every log message for this operation.
    fn description(&self) -> &'static str;

    fn run(
        &self,
        conn: &mut dyn StoreConnection,
        input: &Self::Input,
    ) -> Result<Self::Output, OperationError>;
}

/// Outcome of one instrumented call.
#[must_use]
#[derive(Debug)]
pub enum Invocation<T> {
    Completed(T),
    Failed(OperationFailure),
}

impl<T> Invocation<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Invocation::Completed(value) => Some(value),
            Invocation::Failed(_) => None,
        }
    }

    pub fn output(&self) -> Option<&T> {
        match self {
            Invocation::Completed(value) => Some(value),
            Invocation::Failed(_) => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Invocation::Completed(_))
    }

    pub fn failure(&self) -> Option<&OperationFailure> {
        match self {
            Invocation::Completed(_) => None,
            Invocation::Failed(failure) => Some(failure),
        }
    }
}

pub struct Auditor {
    run_id: String,
    connector: Box<dyn Connector>,
    sink: LogSink,
    metrics: SegmenterMetrics,
}

impl Auditor {
    pub fn new(
        run_id: String,
        connector: Box<dyn Connector>,
        sink: LogSink,
        metrics: SegmenterMetrics,
    ) -> Self {
        Self {
            run_id,
            connector,
            sink,
            metrics,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    pub fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    /// Runs `op` with a freshly acquired connection and appends one log record.
    ///
    /// `Err` only when the log record could not be written.
    pub fn invoke<O>(&self, op: &O, input: &O::Input) -> Result<Invocation<O::Output>, AuditError>
    where
        O: Operation + ?Sized,
    {
        let action = op.action();
        let snapshot = self.snapshot(action, input);
        let started = Instant::now();

        let outcome = self
            .connector
            .acquire()
            .map_err(OperationError::from)
            .and_then(|mut conn| op.run(&mut *conn, input));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (message, error_report, invocation) = match outcome {
            Ok(output) => {
                let message = format!("{}: {}", op.description(), output.describe());
                info!(
                    event = "operation_completed",
                    run_id = %self.run_id,
                    action,
                    elapsed_ms,
                    "{message}"
                );
                self.metrics
                    .record_operation(action, OperationOutcome::Completed);
                (message, None, Invocation::Completed(output))
            }
            Err(err) => {
                let report = format_error_chain(&err);
                let message = format!("{}:\n{report}", op.description());
                error!(
                    event = "operation_failed",
                    run_id = %self.run_id,
                    action,
                    elapsed_ms,
                    error = %err,
                    "{message}"
                );
                self.metrics.record_operation(action, OperationOutcome::Failed);
                let failure = OperationFailure {
                    action,
                    error: err,
                    report: report.clone(),
                };
                (message, Some(report), Invocation::Failed(failure))
            }
        };

        self.append(&LogRecord::new(
            &self.run_id,
            action,
            &snapshot,
            message,
            error_report,
        ))?;
        Ok(invocation)
    }

    /// Appends a record that does not wrap an operation call (batch summaries, config errors).
    pub fn record(
        &self,
        action: &str,
        snapshot: &Map<String, Value>,
        message: String,
        error: Option<String>,
    ) -> Result<(), AuditError> {
        self.append(&LogRecord::new(
            &self.run_id,
            action,
            snapshot,
            message,
            error,
        ))
    }

    pub fn append(&self, record: &LogRecord) -> Result<(), AuditError> {
        let sql = self.sink.insert_sql(record);
        let mut conn = self.connector.acquire().map_err(AuditError::Acquire)?;
        conn.execute_sql(&sql)
            .map_err(|source| AuditError::Append {
                table: self.sink.table().to_string(),
                source,
            })?;
        Ok(())
    }

    /// Best-effort argument snapshot; never aborts the call.
    fn snapshot<I: Serialize + ?Sized>(&self, action: &str, input: &I) -> Map<String, Value> {
        match serde_json::to_value(input) {
            Ok(Value::Object(map)) => map,
            Ok(Value::Null) => Map::new(),
            Ok(other) => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
            Err(err) => {
                warn!(
                    event = "operation_params_snapshot_failed",
                    run_id = %self.run_id,
                    action,
                    error = %err,
                    "could not snapshot operation inputs; logging empty params"
                );
                Map::new()
            }
        }
    }
}
