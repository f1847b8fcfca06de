use super::{CheckInput, CheckOutput, Evidence};
use crate::audit::{Operation, OperationError};
use crate::store::{quote, Record, StoreConnection, INFINITY};

/// Compares the live rows of a segment table with the segment it is configured for.
///
/// Consistent when there are live rows for this segment and none for any other, so a table
/// shared by several segments never passes.
pub struct ConsistencyCheck;

impl Operation for ConsistencyCheck {
    type Input = CheckInput;
    type Output = CheckOutput;

    fn action(&self) -> &'static str {
        "check_consistency"
    }

    fn description(&self) -> &'static str {
        "Check consistency with the configuration table"
    }

    fn run(
        &self,
        conn: &mut dyn StoreConnection,
        input: &CheckInput,
    ) -> Result<CheckOutput, OperationError> {
        let segment_id = input
            .segment_id
            .as_deref()
            .ok_or(OperationError::MissingInput("segment_id"))?;
        let id = quote(segment_id);
        let sql = format!(
            "SELECT \
                COUNT(CASE WHEN segment_id = {id} THEN 1 END) AS matching, \
                COUNT(CASE WHEN segment_id IS NULL OR segment_id <> {id} THEN 1 END) AS foreign_rows \
             FROM {table} \
             WHERE actual_end = {infinity}",
            table = input.table_name,
            infinity = quote(INFINITY),
        );

        let counts = conn
            .load_counts(&sql)?
            .into_iter()
            .next()
            .ok_or_else(|| OperationError::Invalid("consistency query returned no rows".into()))?;
        let consistent = counts.matching > 0 && counts.foreign_rows == 0;

        let evidence = Record::new()
            .with("segment_name", input.segment_name.clone())
            .with("segment_id", segment_id)
            .with("table_name", input.table_name.to_string())
            .with("live_rows", counts.matching)
            .with("foreign_live_rows", counts.foreign_rows)
            .with("consistent", consistent);
        Ok(CheckOutput {
            evidence: Evidence::Record(evidence),
            verdict: Some(consistent),
        })
    }
}
