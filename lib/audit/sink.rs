use serde_json::{Map, Value};
use thiserror::Error;

use crate::collection::CollectionRef;
use crate::store::{ident, quote_opt, table_columns, StoreConnection};

/// Columns every log sink must provide.
pub const CORE_COLUMNS: [&str; 5] = ["id", "action", "params", "message", "error"];

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to read log sink schema: {0}")]
    Schema(#[from] diesel::result::Error),
    #[error("log sink {table} does not exist or has no readable columns")]
    Missing { table: String },
    #[error("log sink {table} is missing required column `{column}`")]
    MissingColumn { table: String, column: &'static str },
}

/// One append-only audit row, in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    fields: Vec<(String, Option<String>)>,
}

impl LogRecord {
    /// Builds a record from the core fields plus every top-level field of `snapshot`.
    ///
    /// Core fields win over snapshot fields with the same name.
    pub fn new(
        run_id: &str,
        action: &str,
        snapshot: &Map<String, Value>,
        message: String,
        error: Option<String>,
    ) -> Self {
        let mut fields: Vec<(String, Option<String>)> = snapshot
            .iter()
            .filter(|(key, _)| !CORE_COLUMNS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), render_field(value)))
            .collect();

        let params = Value::Object(snapshot.clone()).to_string();
        fields.push(("id".to_string(), Some(run_id.to_string())));
        fields.push(("action".to_string(), Some(action.to_string())));
        fields.push(("params".to_string(), Some(params)));
        fields.push(("message".to_string(), Some(message)));
        fields.push(("error".to_string(), error));

        Self { fields }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .and_then(|(_, value)| value.as_deref())
    }

    pub fn fields(&self) -> &[(String, Option<String>)] {
        &self.fields
    }
}

fn render_field(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Destination table for audit records, with its columns discovered once at startup.
#[derive(Debug, Clone)]
pub struct LogSink {
    table: CollectionRef,
}

impl LogSink {
    /// Reads the sink's columns and checks the core ones are present.
    pub fn open(
        conn: &mut dyn StoreConnection,
        mut table: CollectionRef,
    ) -> Result<Self, SinkError> {
        let columns = table_columns(conn, &table)?;
        if columns.is_empty() {
            return Err(SinkError::Missing {
                table: table.to_string(),
            });
        }
        if let Some(column) = CORE_COLUMNS
            .into_iter()
            .find(|core| !columns.iter().any(|known| known == core))
        {
            return Err(SinkError::MissingColumn {
                table: table.to_string(),
                column,
            });
        }

        table.cache(crate::store::Frame::empty(columns), false);
        Ok(Self { table })
    }

    pub fn table(&self) -> &CollectionRef {
        &self.table
    }

    /// `INSERT` for `record`, restricted to columns the sink actually has.
    ///
    /// Fields unknown to the sink are dropped so configuration drift never breaks logging.
    pub fn insert_sql(&self, record: &LogRecord) -> String {
        let (columns, values): (Vec<_>, Vec<_>) = record
            .fields()
            .iter()
            .filter(|(name, _)| self.table.has_column(name))
            .map(|(name, value)| (ident(name), quote_opt(value.as_deref())))
            .unzip();

        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            values.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite_test::SqliteFixture;
    use serde_json::json;

    fn snapshot(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("snapshot must be an object"),
        }
    }

    #[test]
    fn core_fields_override_snapshot_fields() {
        let record = LogRecord::new(
            "run-1",
            "check_cron",
            &snapshot(json!({"id": "seg-7", "segment_id": "seg-7", "refresh_auto": true})),
            "ok".into(),
            None,
        );
        assert_eq!(record.get("id"), Some("run-1"));
        assert_eq!(record.get("segment_id"), Some("seg-7"));
        assert_eq!(record.get("refresh_auto"), Some("true"));
        assert_eq!(record.get("error"), None);
        assert!(record.get("params").unwrap().contains("\"segment_id\":\"seg-7\""));
    }

    #[test]
    fn insert_drops_columns_the_sink_does_not_have() {
        let fixture = SqliteFixture::new();
        let mut conn = fixture.connection();
        let sink = LogSink::open(&mut conn, CollectionRef::new("main", "segmenter_log"))
            .expect("fixture sink should open");

        let record = LogRecord::new(
            "run-1",
            "check_table",
            &snapshot(json!({"segment_id": "seg-1", "not_a_column": 5})),
            "msg".into(),
            Some("boom".into()),
        );
        let sql = sink.insert_sql(&record);
        assert!(sql.contains("\"segment_id\""));
        let (columns, values) = sql.split_once(" VALUES ").unwrap();
        assert!(!columns.contains("not_a_column"));
        // the full snapshot still travels in `params`
        assert!(values.contains("\"not_a_column\":5"));

        conn.execute_sql(&sql).expect("filtered insert should succeed");
        let rows = fixture.log_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].segment_id.as_deref(), Some("seg-1"));
        assert_eq!(rows[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn missing_sink_is_a_startup_error() {
        let fixture = SqliteFixture::new();
        let mut conn = fixture.connection();
        let err = LogSink::open(&mut conn, CollectionRef::new("main", "nowhere")).unwrap_err();
        assert!(matches!(err, SinkError::Missing { .. }));
    }

    #[test]
    fn sink_without_core_columns_is_rejected() {
        let fixture = SqliteFixture::new();
        fixture.execute("CREATE TABLE main.thin_log (id TEXT, action TEXT)");
        let mut conn = fixture.connection();
        let err = LogSink::open(&mut conn, CollectionRef::new("main", "thin_log")).unwrap_err();
        assert!(matches!(
            err,
            SinkError::MissingColumn {
                column: "params",
                ..
            }
        ));
    }
}
