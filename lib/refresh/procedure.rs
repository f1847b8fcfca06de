use super::{classify, RefreshInput, RefreshOutcome};
use crate::audit::{Operation, OperationError};
use crate::store::StoreConnection;

/// Runs a stored procedure (or any statement) that recomputes the segment in place.
pub struct ProcedureRefresh;

impl Operation for ProcedureRefresh {
    type Input = RefreshInput;
    type Output = RefreshOutcome;

    fn action(&self) -> &'static str {
        "refresh_procedure"
    }

    fn description(&self) -> &'static str {
        "Refresh segment by procedure"
    }

    fn run(
        &self,
        conn: &mut dyn StoreConnection,
        input: &RefreshInput,
    ) -> Result<RefreshOutcome, OperationError> {
        if input.sql.trim().is_empty() {
            return Err(OperationError::MissingInput("sql"));
        }
        conn.batch_execute_sql(&input.sql)?;
        classify(conn, &input.table_name, input.now)
    }
}
