use super::{CheckInput, CheckOutput, Evidence};
use crate::audit::{Operation, OperationError};
use crate::store::{load_frame, table_columns, Frame, StoreConnection};

/// Reads the target table; passes when the read works and the table has columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReachabilityCheck {
    with_data: bool,
}

impl ReachabilityCheck {
    /// Validates the read without fetching rows.
    pub fn schema_only() -> Self {
        Self { with_data: false }
    }

    /// Materializes every row of the table into the evidence frame.
    pub fn with_data() -> Self {
        Self { with_data: true }
    }
}

impl Operation for ReachabilityCheck {
    type Input = CheckInput;
    type Output = CheckOutput;

    fn action(&self) -> &'static str {
        "check_table"
    }

    fn description(&self) -> &'static str {
        "Check collection availability"
    }

    fn run(
        &self,
        conn: &mut dyn StoreConnection,
        input: &CheckInput,
    ) -> Result<CheckOutput, OperationError> {
        let table = &input.table_name;
        conn.batch_execute_sql(&format!("SELECT * FROM {table} LIMIT 0"))?;

        let columns = table_columns(conn, table)?;
        let reachable = !columns.is_empty();
        let frame = if self.with_data {
            load_frame(conn, table, columns)?
        } else {
            Frame::empty(columns)
        };

        Ok(CheckOutput {
            evidence: Evidence::Frame(frame),
            verdict: Some(reachable),
        })
    }
}
