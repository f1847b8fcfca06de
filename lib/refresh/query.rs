use chrono::NaiveDateTime;
use tracing::{debug, warn};

use super::{classify, RefreshInput, RefreshOutcome};
use crate::audit::{Operation, OperationError};
use crate::collection::CollectionRef;
use crate::store::{ident, table_columns, Dialect, StoreConnection};

/// How many duplicated ids a rejected staging result names in its error.
const DUPLICATE_SAMPLE: usize = 5;

const STAGING_TABLE: &str = "segmenter_staging";
const GRID_TABLE: &str = "segmenter_grid";

/// Versioning columns maintained by the merge itself.
const BOOKKEEPING_COLUMNS: [&str; 3] = ["actual_begin", "actual_end", "processed"];

/// Bitemporal merge of a query's result into the segment table.
pub struct QueryRefresh;

impl Operation for QueryRefresh {
    type Input = RefreshInput;
    type Output = RefreshOutcome;

    fn action(&self) -> &'static str {
        "refresh_query"
    }

    fn description(&self) -> &'static str {
        "Refresh segment by query"
    }

    fn run(
        &self,
        conn: &mut dyn StoreConnection,
        input: &RefreshInput,
    ) -> Result<RefreshOutcome, OperationError> {
        let dialect = conn.dialect();
        let staging = dialect.temp_table(STAGING_TABLE);
        let grid = dialect.temp_table(GRID_TABLE);

        if table_columns(conn, &input.table_name)?.is_empty() {
            return Err(OperationError::Invalid(format!(
                "segment table {} does not exist",
                input.table_name
            )));
        }

        let select = input.sql.trim().trim_end_matches(';');
        conn.batch_execute_sql(&format!(
            "DROP TABLE IF EXISTS {staging}; CREATE TEMP TABLE {STAGING_TABLE} AS {select};"
        ))?;

        let staged = table_columns(conn, &staging)?;
        if !staged.iter().any(|column| column == "id") {
            return Err(OperationError::Invalid(
                "refresh query must return an `id` column".to_string(),
            ));
        }
        let duplicates: Vec<String> = conn
            .load_values(&format!(
                "SELECT CAST(id AS TEXT) AS value FROM {staging} \
                 GROUP BY id HAVING COUNT(*) > 1 LIMIT {DUPLICATE_SAMPLE}"
            ))?
            .into_iter()
            .map(|row| row.value.unwrap_or_else(|| "NULL".to_string()))
            .collect();
        if !duplicates.is_empty() {
            return Err(OperationError::Invalid(format!(
                "refresh query must return one row per `id`; duplicated: {}",
                duplicates.join(", ")
            )));
        }

        let business: Vec<String> = staged
            .into_iter()
            .filter(|column| column != "id" && !BOOKKEEPING_COLUMNS.contains(&column.as_str()))
            .collect();

        let statements = merge_statements(
            dialect,
            &input.table_name,
            &staging,
            &grid,
            &business,
            input.now,
        );
        conn.batch_execute_sql("BEGIN")?;
        if let Err(err) = apply_steps(conn, &input.table_name, &statements) {
            if let Err(rollback) = conn.batch_execute_sql("ROLLBACK") {
                warn!(
                    table = %input.table_name,
                    error = %rollback,
                    "failed to roll back refresh merge"
                );
            }
            return Err(err);
        }
        conn.batch_execute_sql("COMMIT")?;

        conn.batch_execute_sql(&format!(
            "DROP TABLE IF EXISTS {grid}; DROP TABLE IF EXISTS {staging};"
        ))?;

        classify(conn, &input.table_name, input.now)
    }
}

/// Runs the merge steps in order; the caller owns the surrounding transaction.
fn apply_steps(
    conn: &mut dyn StoreConnection,
    table: &CollectionRef,
    statements: &[(&'static str, String)],
) -> Result<(), OperationError> {
    for (step, sql) in statements {
        let affected = conn.execute_sql(sql)?;
        debug!(%table, step, affected, "refresh merge step applied");
    }
    Ok(())
}

/// Ordered merge statements, labelled by step.
///
/// `business` are the staged columns compared and copied besides `id`.
pub fn merge_statements(
    dialect: Dialect,
    target: &CollectionRef,
    staging: &CollectionRef,
    grid: &CollectionRef,
    business: &[String],
    now: NaiveDateTime,
) -> Vec<(&'static str, String)> {
    let now = dialect.timestamp(now);
    let infinity = dialect.infinity();

    let new_columns: Vec<String> = business
        .iter()
        .map(|column| ident(&format!("new_{column}")))
        .collect();
    let new_columns_as = business
        .iter()
        .zip(&new_columns)
        .map(|(column, new_column)| format!(", n.{} AS {new_column}", ident(column)))
        .collect::<String>();
    let changed = if business.is_empty() {
        "0 = 1".to_string()
    } else {
        business
            .iter()
            .map(|column| {
                let column = ident(column);
                dialect.differs(&format!("t.{column}"), &format!("n.{column}"))
            })
            .collect::<Vec<_>>()
            .join(" OR ")
    };

    let mut target_columns = vec![ident("id")];
    target_columns.extend(business.iter().map(|column| ident(column)));
    target_columns.extend(BOOKKEEPING_COLUMNS.iter().map(|column| ident(column)));
    let target_columns = target_columns.join(", ");
    let copied = std::iter::once(ident("id"))
        .chain(new_columns.iter().cloned())
        .collect::<Vec<_>>()
        .join(", ");

    let live = format!("actual_end = {infinity}");
    let grid_ids = |flag: &str| format!("id IN (SELECT id FROM {grid} WHERE {flag} = 1)");

    vec![
        ("drop_grid", format!("DROP TABLE IF EXISTS {grid}")),
        (
            "build_grid",
            format!(
                "CREATE TEMP TABLE {grid_name} AS \
                 SELECT n.id AS id{new_columns_as}, \
                    CASE WHEN t.id IS NULL THEN 0 ELSE 1 END AS existed, \
                    CASE WHEN t.id IS NOT NULL AND ({changed}) THEN 1 ELSE 0 END AS changed \
                 FROM {staging} n \
                 LEFT JOIN {target} t ON t.id = n.id AND t.{live}",
                grid_name = grid.name(),
            ),
        ),
        (
            "insert_new",
            format!(
                "INSERT INTO {target} ({target_columns}) \
                 SELECT {copied}, {now}, {infinity}, {now} FROM {grid} WHERE existed = 0"
            ),
        ),
        (
            "bump_processed",
            format!(
                "UPDATE {target} SET processed = {now} WHERE {live} AND {}",
                grid_ids("existed")
            ),
        ),
        (
            "close_changed",
            format!(
                "UPDATE {target} SET actual_end = {now} WHERE {live} AND {}",
                grid_ids("changed")
            ),
        ),
        (
            "insert_successors",
            format!(
                "INSERT INTO {target} ({target_columns}) \
                 SELECT {copied}, {now}, {infinity}, {now} FROM {grid} WHERE changed = 1"
            ),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite_test::SqliteFixture;
    use crate::store::{load_frame, Frame};
    use chrono::{Duration, NaiveDate};
    use serde_json::{Map, Value};

    const SEGMENT: &str = "CREATE TABLE main.seg ( \
        id TEXT, segment_id TEXT, name TEXT, \
        actual_begin TEXT, actual_end TEXT, processed TEXT)";

    const STAGED: &str = "SELECT 'n1' AS id, 'seg-1' AS segment_id, 'new' AS name \
        UNION ALL SELECT 'c1', 'seg-1', 'changed' \
        UNION ALL SELECT 'u1', 'seg-1', 'same';";

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 5, 4)
            .unwrap()
            .and_hms_opt(10, 5, 0)
            .unwrap()
    }

    fn seeded() -> SqliteFixture {
        let fixture = SqliteFixture::new();
        fixture.execute(SEGMENT);
        fixture.execute(
            "INSERT INTO main.seg VALUES \
             ('c1', 'seg-1', 'before', '2026-05-01 08:00:00.000000', 'infinity', '2026-05-01 08:00:00.000000'), \
             ('u1', 'seg-1', 'same', '2026-05-01 08:00:00.000000', 'infinity', '2026-05-01 08:00:00.000000')",
        );
        fixture
    }

    fn input(at: NaiveDateTime) -> RefreshInput {
        RefreshInput {
            table_name: CollectionRef::new("main", "seg"),
            sql: STAGED.to_string(),
            segment_id: "seg-1".to_string(),
            segment_name: Some("test segment".to_string()),
            now: at,
        }
    }

    fn rows(fixture: &SqliteFixture) -> Frame {
        let table = CollectionRef::new("main", "seg");
        let mut conn = fixture.connection();
        let columns = table_columns(&mut conn, &table).unwrap();
        load_frame(&mut conn, &table, columns).unwrap()
    }

    fn versions<'a>(frame: &'a Frame, id: &str) -> Vec<&'a Map<String, Value>> {
        frame.rows().iter().filter(|row| row["id"] == id).collect()
    }

    #[test]
    fn merge_inserts_closes_and_bumps() {
        let fixture = seeded();
        let outcome = QueryRefresh
            .run(&mut fixture.connection(), &input(now()))
            .expect("query refresh should succeed");

        let stamp = "2026-05-04 10:05:00.000000";
        let frame = rows(&fixture);

        let new_rows = versions(&frame, "n1");
        assert_eq!(new_rows.len(), 1);
        assert_eq!(new_rows[0]["actual_end"], "infinity");
        assert_eq!(new_rows[0]["actual_begin"], stamp);
        assert_eq!(new_rows[0]["segment_id"], "seg-1");

        let changed = versions(&frame, "c1");
        assert_eq!(changed.len(), 2);
        let closed = changed.iter().find(|row| row["name"] == "before").unwrap();
        assert_eq!(closed["actual_end"], stamp);
        let live = changed.iter().find(|row| row["name"] == "changed").unwrap();
        assert_eq!(live["actual_end"], "infinity");

        let unchanged = versions(&frame, "u1");
        assert_eq!(unchanged.len(), 1);
        assert_eq!(unchanged[0]["actual_end"], "infinity");
        assert_eq!(unchanged[0]["processed"], stamp);
        assert_eq!(unchanged[0]["actual_begin"], "2026-05-01 08:00:00.000000");

        assert_eq!(
            outcome.processed_ids(),
            ["c1", "n1", "u1"].into_iter().collect()
        );
        assert_eq!(outcome.added_ids(), ["c1", "n1"].into_iter().collect());
        assert_eq!(outcome.closed_ids(), ["c1"].into_iter().collect());
    }

    #[test]
    fn rerun_with_same_input_adds_and_closes_nothing() {
        let fixture = seeded();
        QueryRefresh
            .run(&mut fixture.connection(), &input(now()))
            .unwrap();
        let second = QueryRefresh
            .run(&mut fixture.connection(), &input(now() + Duration::minutes(5)))
            .unwrap();

        assert!(second.added_ids().is_empty());
        assert!(second.closed_ids().is_empty());
        assert_eq!(second.processed_ids().len(), 3);

        let frame = rows(&fixture);
        let live = frame
            .rows()
            .iter()
            .filter(|row| row["actual_end"] == "infinity")
            .count();
        assert_eq!(live, 3);
    }

    #[test]
    fn failed_step_leaves_the_segment_untouched() {
        let fixture = seeded();
        fixture.execute(
            "CREATE TRIGGER reject_bad BEFORE INSERT ON seg WHEN NEW.name = 'bad' \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        );
        let before = rows(&fixture);

        let mut input = input(now());
        // c1 changes, so its live row is closed before the successor insert trips the trigger
        input.sql = "SELECT 'c1' AS id, 'seg-1' AS segment_id, 'bad' AS name".to_string();
        let err = QueryRefresh
            .run(&mut fixture.connection(), &input)
            .unwrap_err();
        assert!(err.to_string().contains("rejected"));

        let after = rows(&fixture);
        assert_eq!(after, before);
        let live = versions(&after, "c1");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0]["actual_end"], "infinity");
        assert_eq!(live[0]["name"], "before");
    }

    #[test]
    fn duplicated_ids_in_staging_are_rejected() {
        let fixture = SqliteFixture::new();
        fixture.execute(SEGMENT);
        let mut input = input(now());
        input.sql = "SELECT 'n1' AS id, 'seg-1' AS segment_id, 'a' AS name \
                     UNION ALL SELECT 'n1', 'seg-1', 'b'"
            .to_string();

        let err = QueryRefresh
            .run(&mut fixture.connection(), &input)
            .unwrap_err();
        assert!(err.to_string().contains("duplicated: n1"));
        assert!(rows(&fixture).rows().is_empty());
    }

    #[test]
    fn staging_without_id_is_rejected() {
        let fixture = seeded();
        let mut input = input(now());
        input.sql = "SELECT 'x' AS name".to_string();
        let err = QueryRefresh
            .run(&mut fixture.connection(), &input)
            .unwrap_err();
        assert!(err.to_string().contains("`id`"));
    }

    #[test]
    fn missing_target_is_rejected_before_staging() {
        let fixture = SqliteFixture::new();
        let err = QueryRefresh
            .run(&mut fixture.connection(), &input(now()))
            .unwrap_err();
        assert!(err.to_string().contains("main.seg"));
    }

    #[test]
    fn postgres_merge_uses_null_safe_comparison_and_typed_literals() {
        let statements = merge_statements(
            Dialect::Postgres,
            &CollectionRef::new("public", "seg"),
            &Dialect::Postgres.temp_table(STAGING_TABLE),
            &Dialect::Postgres.temp_table(GRID_TABLE),
            &["name".to_string()],
            now(),
        );
        let steps: Vec<_> = statements.iter().map(|(step, _)| *step).collect();
        assert_eq!(
            steps,
            [
                "drop_grid",
                "build_grid",
                "insert_new",
                "bump_processed",
                "close_changed",
                "insert_successors"
            ]
        );
        let (_, grid) = &statements[1];
        assert!(grid.contains("t.\"name\" IS DISTINCT FROM n.\"name\""));
        assert!(grid.contains("FROM pg_temp.segmenter_staging n"));
        let (_, insert) = &statements[2];
        assert!(insert.contains("TIMESTAMP '2026-05-04 10:05:00.000000', TIMESTAMP 'infinity'"));
    }
}
