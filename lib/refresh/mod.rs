//! Refresh strategies: recompute a segment's bitemporal table and classify what changed.
//!
//! A segment's `refresh_params` names exactly one strategy:
//! `{"query": {"sql": "select ..."}}` or `{"procedure": {"sql": "call ..."}}`.

mod procedure;
mod query;

pub use procedure::ProcedureRefresh;
pub use query::{merge_statements, QueryRefresh};

use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::audit::{Operation, OperationError};
use crate::checks::serialize_timestamp;
use crate::collection::CollectionRef;
use crate::store::{Describe, Frame, StoreConnection};

/// Object form of a refresh strategy operation.
pub type Refresh = dyn Operation<Input = RefreshInput, Output = RefreshOutcome>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrategyError {
    #[error("refresh_params is empty")]
    Unconfigured,
    #[error("refresh_params names more than one strategy: {}", keys.join(", "))]
    Ambiguous { keys: Vec<String> },
    #[error("invalid `{strategy}` refresh params: {reason}")]
    Invalid { strategy: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryParams {
    /// Select producing the full desired state of the segment, one row per `id`.
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProcedureParams {
    /// Statement that recomputes the segment in place, e.g. `call public.update_segment()`.
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshStrategy {
    Query(QueryParams),
    Procedure(ProcedureParams),
}

impl RefreshStrategy {
    pub fn resolve(params: &Map<String, Value>) -> Result<Self, StrategyError> {
        let mut entries = params.iter();
        let (name, value) = entries.next().ok_or(StrategyError::Unconfigured)?;
        if entries.next().is_some() {
            return Err(StrategyError::Ambiguous {
                keys: params.keys().cloned().collect(),
            });
        }

        match name.as_str() {
            "query" => decode(name, value).map(RefreshStrategy::Query),
            "procedure" => decode(name, value).map(RefreshStrategy::Procedure),
            other => Err(StrategyError::Invalid {
                strategy: other.to_string(),
                reason: "unknown strategy (expected `query` or `procedure`)".to_string(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RefreshStrategy::Query(_) => "query",
            RefreshStrategy::Procedure(_) => "procedure",
        }
    }

    pub fn sql(&self) -> &str {
        match self {
            RefreshStrategy::Query(params) => &params.sql,
            RefreshStrategy::Procedure(params) => &params.sql,
        }
    }

    pub fn operation(&self) -> &'static Refresh {
        match self {
            RefreshStrategy::Query(_) => &QueryRefresh,
            RefreshStrategy::Procedure(_) => &ProcedureRefresh,
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(strategy: &str, value: &Value) -> Result<T, StrategyError> {
    let params: T = serde_json::from_value(value.clone()).map_err(|err| StrategyError::Invalid {
        strategy: strategy.to_string(),
        reason: err.to_string(),
    })?;
    Ok(params)
}

/// Arguments handed to a strategy for one segment.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshInput {
    pub table_name: CollectionRef,
    pub sql: String,
    pub segment_id: String,
    pub segment_name: Option<String>,
    /// Timestamp written into `actual_begin`, `actual_end` and `processed` by this run.
    #[serde(serialize_with = "serialize_timestamp")]
    pub now: NaiveDateTime,
}

/// One identifier touched by the latest refresh.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClassifiedRow {
    pub processed: String,
    pub added: Option<String>,
    pub closed: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub rows: Vec<ClassifiedRow>,
}

impl RefreshOutcome {
    pub fn processed_ids(&self) -> BTreeSet<&str> {
        self.rows.iter().map(|row| row.processed.as_str()).collect()
    }

    pub fn added_ids(&self) -> BTreeSet<&str> {
        self.rows.iter().filter_map(|row| row.added.as_deref()).collect()
    }

    pub fn closed_ids(&self) -> BTreeSet<&str> {
        self.rows.iter().filter_map(|row| row.closed.as_deref()).collect()
    }

    fn to_frame(&self) -> Frame {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut map = Map::new();
                map.insert("processed".into(), row.processed.clone().into());
                map.insert("added".into(), row.added.clone().into());
                map.insert("closed".into(), row.closed.clone().into());
                map
            })
            .collect();
        Frame::new(
            vec!["processed".into(), "added".into(), "closed".into()],
            rows,
        )
    }
}

impl Describe for RefreshOutcome {
    fn describe(&self) -> String {
        self.to_frame().describe()
    }
}

/// Classifies every id carrying the latest `processed` watermark of the day of `now`.
///
/// `added` when the version began at the watermark, `closed` when it ended there.
pub fn classify(
    conn: &mut dyn StoreConnection,
    table: &CollectionRef,
    now: NaiveDateTime,
) -> Result<RefreshOutcome, OperationError> {
    let same_day = conn.dialect().same_day("processed", now);
    let sql = format!(
        "WITH latest AS ( \
            SELECT DISTINCT CAST(id AS TEXT) AS id, actual_begin, actual_end, processed \
            FROM {table} \
            WHERE processed = (SELECT MAX(processed) FROM {table} WHERE {same_day}) \
         ) \
         SELECT DISTINCT l.id AS processed, a.id AS added, c.id AS closed \
         FROM latest l \
         LEFT JOIN latest a ON a.id = l.id AND a.actual_begin = a.processed \
         LEFT JOIN latest c ON c.id = l.id AND c.actual_end = c.processed \
         ORDER BY 1, 2, 3"
    );

    let mut rows: Vec<ClassifiedRow> = conn
        .load_classified(&sql)?
        .into_iter()
        .map(|row| ClassifiedRow {
            processed: row.processed,
            added: row.added,
            closed: row.closed,
        })
        .collect();
    rows.sort();
    Ok(RefreshOutcome { rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite_test::SqliteFixture;
    use chrono::NaiveDate;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("params must be an object"),
        }
    }

    #[test]
    fn resolves_each_strategy() {
        let query = RefreshStrategy::resolve(&params(json!({"query": {"sql": "select 1"}}))).unwrap();
        assert_eq!(query.name(), "query");
        assert_eq!(query.sql(), "select 1");
        assert_eq!(query.operation().action(), "refresh_query");

        let procedure =
            RefreshStrategy::resolve(&params(json!({"procedure": {"sql": "call p()"}}))).unwrap();
        assert_eq!(procedure.operation().action(), "refresh_procedure");
    }

    #[test]
    fn extra_params_are_ignored() {
        let strategy =
            RefreshStrategy::resolve(&params(json!({"query": {"sql": "select 1", "hint": 2}})))
                .unwrap();
        assert_eq!(strategy.sql(), "select 1");
    }

    #[test]
    fn configuration_errors_are_distinguished() {
        assert_eq!(
            RefreshStrategy::resolve(&Map::new()),
            Err(StrategyError::Unconfigured)
        );
        assert!(matches!(
            RefreshStrategy::resolve(&params(json!({
                "query": {"sql": "select 1"},
                "procedure": {"sql": "call p()"}
            }))),
            Err(StrategyError::Ambiguous { keys }) if keys.len() == 2
        ));
        assert!(matches!(
            RefreshStrategy::resolve(&params(json!({"pipeline": {}}))),
            Err(StrategyError::Invalid { strategy, .. }) if strategy == "pipeline"
        ));
        assert!(matches!(
            RefreshStrategy::resolve(&params(json!({"query": {"statement": "select 1"}}))),
            Err(StrategyError::Invalid { strategy, .. }) if strategy == "query"
        ));
    }

    #[test]
    fn classify_uses_the_latest_watermark_of_the_day() {
        let fixture = SqliteFixture::new();
        fixture.execute(
            "CREATE TABLE main.seg (id INTEGER, actual_begin TEXT, actual_end TEXT, processed TEXT); \
             INSERT INTO main.seg VALUES \
               (1, '2026-05-04 10:00:00', 'infinity', '2026-05-04 10:00:00'), \
               (2, '2026-05-01 08:00:00', '2026-05-04 10:00:00', '2026-05-04 10:00:00'), \
               (2, '2026-05-04 10:00:00', 'infinity', '2026-05-04 10:00:00'), \
               (3, '2026-05-01 08:00:00', 'infinity', '2026-05-04 10:00:00'), \
               (4, '2026-05-01 08:00:00', 'infinity', '2026-05-04 09:00:00'), \
               (5, '2026-05-05 08:00:00', 'infinity', '2026-05-05 08:00:00');",
        );
        let now = NaiveDate::from_ymd_opt(2026, 5, 4)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();

        let outcome = classify(
            &mut fixture.connection(),
            &CollectionRef::new("main", "seg"),
            now,
        )
        .unwrap();
        assert_eq!(outcome.processed_ids(), BTreeSet::from(["1", "2", "3"]));
        assert_eq!(outcome.added_ids(), BTreeSet::from(["1", "2"]));
        assert_eq!(outcome.closed_ids(), BTreeSet::from(["2"]));
        assert!(outcome.describe().starts_with("<Frame>"));
    }
}
