//! Raw-SQL access to the relational store.
//!
//! Everything above this module talks to a `dyn StoreConnection`: a short-lived, already-open
//! connection that can run statements and load a handful of fixed row shapes. Store-specific SQL
//! lives in [`Dialect`], so checks and refresh strategies build one statement text per dialect
//! and never branch on the backend themselves.

mod connector;
mod frame;

pub use connector::{connector_from_url, Connector, PgConnector, SqliteConnector};
pub use frame::{Describe, Frame, Record};

use chrono::NaiveDateTime;
use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection, R2D2Connection};
use diesel::result::Error as DieselError;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Nullable, Text};
use diesel::sqlite::SqliteConnection;
use thiserror::Error;

use crate::collection::CollectionRef;

/// Sentinel stored in `actual_end` for the live version of a row.
pub const INFINITY: &str = "infinity";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to the store: {0}")]
    Connection(#[from] diesel::ConnectionError),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("query failed: {0}")]
    Query(#[from] DieselError),
    #[error("failed to decode row payload: {0}")]
    Decode(#[from] serde_json::Error),
}

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct NameRow {
    #[diesel(sql_type = Text)]
    pub name: String,
}

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct ValueRow {
    #[diesel(sql_type = Nullable<Text>)]
    pub value: Option<String>,
}

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct CountsRow {
    #[diesel(sql_type = BigInt)]
    pub matching: i64,
    #[diesel(sql_type = BigInt)]
    pub foreign_rows: i64,
}

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct ClassifiedIdRow {
    #[diesel(sql_type = Text)]
    pub processed: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub added: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub closed: Option<String>,
}

/// Which SQL flavour a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Query returning one `name` row per column of `table`, in declaration order.
    ///
    /// A missing table yields zero rows rather than an error.
    pub fn columns_query(self, table: &CollectionRef) -> String {
        match self {
            Dialect::Postgres => format!(
                "SELECT attname::text AS name FROM pg_attribute \
                 WHERE attrelid = to_regclass({}) AND attnum > 0 AND NOT attisdropped \
                 ORDER BY attnum",
                quote(&table.to_string())
            ),
            Dialect::Sqlite => format!(
                "SELECT name FROM pragma_table_info({}, {}) ORDER BY cid",
                quote(table.name()),
                quote(table.namespace())
            ),
        }
    }

    /// Namespace holding connection-local transient tables.
    pub fn temp_namespace(self) -> &'static str {
        match self {
            Dialect::Postgres => "pg_temp",
            Dialect::Sqlite => "temp",
        }
    }

    /// Reference to a transient table created with `CREATE TEMP TABLE {name}`.
    pub fn temp_table(self, name: &str) -> CollectionRef {
        CollectionRef::new(self.temp_namespace(), name)
    }

    /// Expression rendering the current row of `alias` as JSON text.
    pub fn row_json(self, alias: &str, columns: &[String]) -> String {
        match self {
            Dialect::Postgres => format!("row_to_json({alias})::text"),
            Dialect::Sqlite => {
                let pairs = columns
                    .iter()
                    .map(|column| format!("{}, {alias}.{}", quote(column), ident(column)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("json_object({pairs})")
            }
        }
    }

    /// Null-safe inequality between two expressions.
    pub fn differs(self, left: &str, right: &str) -> String {
        match self {
            Dialect::Postgres => format!("{left} IS DISTINCT FROM {right}"),
            Dialect::Sqlite => format!("{left} IS NOT {right}"),
        }
    }

    /// Typed timestamp literal, usable in `INSERT ... SELECT` lists.
    pub fn timestamp(self, at: NaiveDateTime) -> String {
        match self {
            Dialect::Postgres => format!("TIMESTAMP {}", quote(&sql_timestamp(at))),
            Dialect::Sqlite => quote(&sql_timestamp(at)),
        }
    }

    /// The open-ended `actual_end` of a live row.
    pub fn infinity(self) -> String {
        match self {
            Dialect::Postgres => format!("TIMESTAMP {}", quote(INFINITY)),
            Dialect::Sqlite => quote(INFINITY),
        }
    }

    /// Predicate true when timestamp expression `column` falls on the calendar day of `at`.
    pub fn same_day(self, column: &str, at: NaiveDateTime) -> String {
        let at = quote(&sql_timestamp(at));
        match self {
            Dialect::Postgres => format!("CAST({column} AS date) = CAST({at} AS date)"),
            Dialect::Sqlite => format!("date({column}) = date({at})"),
        }
    }
}

/// Minimal statement surface every store connection offers.
///
/// Object safe so operations receive `&mut dyn StoreConnection` regardless of backend.
pub trait StoreConnection {
    fn dialect(&self) -> Dialect;
    fn execute_sql(&mut self, sql: &str) -> Result<usize, DieselError>;
    fn batch_execute_sql(&mut self, sql: &str) -> Result<(), DieselError>;
    fn load_names(&mut self, sql: &str) -> Result<Vec<NameRow>, DieselError>;
    fn load_values(&mut self, sql: &str) -> Result<Vec<ValueRow>, DieselError>;
    fn load_counts(&mut self, sql: &str) -> Result<Vec<CountsRow>, DieselError>;
    fn load_classified(&mut self, sql: &str) -> Result<Vec<ClassifiedIdRow>, DieselError>;
}

macro_rules! impl_store_connection {
    ($conn:ty, $dialect:expr) => {
        impl StoreConnection for $conn {
            fn dialect(&self) -> Dialect {
                $dialect
            }

            fn execute_sql(&mut self, sql: &str) -> Result<usize, DieselError> {
                sql_query(sql).execute(self)
            }

            fn batch_execute_sql(&mut self, sql: &str) -> Result<(), DieselError> {
                self.batch_execute(sql)
            }

            fn load_names(&mut self, sql: &str) -> Result<Vec<NameRow>, DieselError> {
                sql_query(sql).load::<NameRow>(self)
            }

            fn load_values(&mut self, sql: &str) -> Result<Vec<ValueRow>, DieselError> {
                sql_query(sql).load::<ValueRow>(self)
            }

            fn load_counts(&mut self, sql: &str) -> Result<Vec<CountsRow>, DieselError> {
                sql_query(sql).load::<CountsRow>(self)
            }

            fn load_classified(&mut self, sql: &str) -> Result<Vec<ClassifiedIdRow>, DieselError> {
                sql_query(sql).load::<ClassifiedIdRow>(self)
            }
        }
    };
}

impl_store_connection!(PgConnection, Dialect::Postgres);
impl_store_connection!(SqliteConnection, Dialect::Sqlite);

impl<C> StoreConnection for PooledConnection<ConnectionManager<C>>
where
    C: StoreConnection + R2D2Connection + 'static,
{
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn execute_sql(&mut self, sql: &str) -> Result<usize, DieselError> {
        (**self).execute_sql(sql)
    }

    fn batch_execute_sql(&mut self, sql: &str) -> Result<(), DieselError> {
        (**self).batch_execute_sql(sql)
    }

    fn load_names(&mut self, sql: &str) -> Result<Vec<NameRow>, DieselError> {
        (**self).load_names(sql)
    }

    fn load_values(&mut self, sql: &str) -> Result<Vec<ValueRow>, DieselError> {
        (**self).load_values(sql)
    }

    fn load_counts(&mut self, sql: &str) -> Result<Vec<CountsRow>, DieselError> {
        (**self).load_counts(sql)
    }

    fn load_classified(&mut self, sql: &str) -> Result<Vec<ClassifiedIdRow>, DieselError> {
        (**self).load_classified(sql)
    }
}

/// Ordered column names of `table`; empty when the table does not exist.
pub fn table_columns(
    conn: &mut dyn StoreConnection,
    table: &CollectionRef,
) -> Result<Vec<String>, DieselError> {
    let sql = conn.dialect().columns_query(table);
    Ok(conn
        .load_names(&sql)?
        .into_iter()
        .map(|row| row.name)
        .collect())
}

/// Loads every row of `table` into a [`Frame`] with the given column order.
pub fn load_frame(
    conn: &mut dyn StoreConnection,
    table: &CollectionRef,
    columns: Vec<String>,
) -> Result<Frame, StoreError> {
    let sql = format!(
        "SELECT {} AS value FROM {table} t",
        conn.dialect().row_json("t", &columns)
    );

    let mut rows = Vec::new();
    for row in conn.load_values(&sql)? {
        let Some(payload) = row.value else {
            continue;
        };
        match serde_json::from_str::<serde_json::Value>(&payload)? {
            serde_json::Value::Object(map) => rows.push(map),
            other => {
                return Err(StoreError::Decode(serde::de::Error::custom(format!(
                    "expected a JSON object per row, got {other}"
                ))))
            }
        }
    }

    Ok(Frame::new(columns, rows))
}

/// Single-quoted SQL string literal.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn quote_opt(value: Option<&str>) -> String {
    value.map(quote).unwrap_or_else(|| "NULL".to_string())
}

/// Double-quoted SQL identifier.
pub fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Timestamp text both backends compare and order correctly.
pub fn sql_timestamp(at: NaiveDateTime) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite_test::SqliteFixture;
    use chrono::NaiveDate;

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(quote("o'brien"), "'o''brien'");
        assert_eq!(quote_opt(None), "NULL");
        assert_eq!(ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn sql_timestamp_keeps_microseconds() {
        let at = NaiveDate::from_ymd_opt(2026, 3, 1)
            .unwrap()
            .and_hms_micro_opt(4, 5, 6, 7)
            .unwrap();
        assert_eq!(sql_timestamp(at), "2026-03-01 04:05:06.000007");
    }

    #[test]
    fn timestamp_literals_are_typed_on_postgres_only() {
        let at = NaiveDate::from_ymd_opt(2026, 3, 1)
            .unwrap()
            .and_hms_opt(4, 5, 6)
            .unwrap();
        assert_eq!(
            Dialect::Postgres.timestamp(at),
            "TIMESTAMP '2026-03-01 04:05:06.000000'"
        );
        assert_eq!(Dialect::Sqlite.timestamp(at), "'2026-03-01 04:05:06.000000'");
        assert_eq!(Dialect::Postgres.infinity(), "TIMESTAMP 'infinity'");
    }

    #[test]
    fn postgres_columns_query_targets_regclass() {
        let table = CollectionRef::new("public", "segmenter");
        let sql = Dialect::Postgres.columns_query(&table);
        assert!(sql.contains("to_regclass('public.segmenter')"));
    }

    #[test]
    fn sqlite_reports_columns_in_declaration_order() {
        let fixture = SqliteFixture::new();
        let mut conn = fixture.connection();
        let columns = table_columns(&mut conn, &CollectionRef::new("main", "segmenter"))
            .expect("failed to read sqlite columns");
        assert_eq!(
            columns,
            vec![
                "segment_id",
                "segment_name",
                "table_name",
                "refresh_cron",
                "refresh_params",
                "refresh_auto",
            ]
        );
    }

    #[test]
    fn sqlite_missing_table_has_no_columns() {
        let fixture = SqliteFixture::new();
        let mut conn = fixture.connection();
        let columns = table_columns(&mut conn, &CollectionRef::new("main", "nope"))
            .expect("pragma on a missing table should not fail");
        assert!(columns.is_empty());
    }

    #[test]
    fn sqlite_frame_materializes_rows_as_objects() {
        let fixture = SqliteFixture::new();
        fixture.execute(
            "CREATE TABLE main.people (id INTEGER, name TEXT); \
             INSERT INTO main.people VALUES (1, 'ann'), (2, NULL);",
        );
        let mut conn = fixture.connection();
        let table = CollectionRef::new("main", "people");
        let columns = table_columns(&mut conn, &table).unwrap();
        let frame = load_frame(&mut conn, &table, columns).expect("failed to load frame");

        assert_eq!(frame.len(), 2);
        assert_eq!(frame.columns(), ["id", "name"]);
        assert_eq!(frame.rows()[0]["name"], serde_json::json!("ann"));
        assert!(frame.rows()[1]["name"].is_null());
    }
}
