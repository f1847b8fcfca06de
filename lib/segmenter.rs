//! Batch orchestrator: select eligible segments, gate them through the check chain and
//! dispatch their refresh strategy.

use chrono::{Local, NaiveDateTime, Timelike};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::audit::{AuditError, Auditor, Invocation, LogSink, Operation, OperationError, SinkError};
use crate::checks::{
    CheckInput, CheckOutput, CheckPolicy, CheckRegistry, Evidence, ReachabilityCheck,
};
use crate::collection::{CollectionRef, DEFAULT_NAMESPACE};
use crate::logging::format_error_chain;
use crate::metrics::{SegmentOutcome, SegmenterMetrics};
use crate::refresh::{RefreshOutcome, RefreshStrategy, StrategyError};
use crate::segments::{select_eligible, SegmentDescriptor, SegmentSet};
use crate::store::{Connector, Describe, StoreConnection, StoreError};

/// Source of the batch's wall-clock time.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall time, truncated to microseconds like the stored timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        let now = Local::now().naive_local();
        now.with_nanosecond(now.nanosecond() / 1_000 * 1_000)
            .unwrap_or(now)
    }
}

/// Always the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum SegmenterError {
    #[error("failed to acquire a connection to open the log sink")]
    Acquire(#[source] StoreError),
    #[error("failed to open the log sink")]
    Sink(#[from] SinkError),
    #[error("configuration table {table} is not readable")]
    ConfigUnavailable { table: String },
    #[error(transparent)]
    Audit(#[from] AuditError),
}

pub struct SegmenterOptions {
    pub config_table: CollectionRef,
    pub log_table: CollectionRef,
    pub default_namespace: String,
    pub checks: CheckRegistry,
    pub policy: CheckPolicy,
    pub metrics: SegmenterMetrics,
    pub clock: Box<dyn Clock>,
}

impl Default for SegmenterOptions {
    fn default() -> Self {
        Self {
            config_table: CollectionRef::new(DEFAULT_NAMESPACE, "segmenter"),
            log_table: CollectionRef::new(DEFAULT_NAMESPACE, "segmenter_log"),
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            checks: CheckRegistry::default_chain(),
            policy: CheckPolicy::default(),
            metrics: SegmenterMetrics::default(),
            clock: Box::new(LocalClock),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedSegment {
    pub segment: SegmentDescriptor,
    pub strategy: &'static str,
    pub outcome: RefreshOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedSegment {
    pub segment: SegmentDescriptor,
    pub action: &'static str,
    pub report: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    ChecksNotPassed(Vec<&'static str>),
    Strategy(StrategyError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedSegment {
    pub segment: SegmentDescriptor,
    pub reason: SkipReason,
}

/// What one `refresh_segments` batch did with every eligible segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    /// Dispatched, and the strategy completed.
    pub refreshed: Vec<RefreshedSegment>,
    /// Dispatched, but the strategy failed.
    pub failed: Vec<FailedSegment>,
    pub skipped: Vec<SkippedSegment>,
}

impl RefreshReport {
    pub fn refreshed_segments(&self) -> Vec<&SegmentDescriptor> {
        self.refreshed.iter().map(|entry| &entry.segment).collect()
    }

    /// Every segment a strategy was dispatched for, whether or not it completed.
    pub fn dispatched_segments(&self) -> Vec<&SegmentDescriptor> {
        self.refreshed
            .iter()
            .map(|entry| &entry.segment)
            .chain(self.failed.iter().map(|entry| &entry.segment))
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Describe for RefreshReport {
    fn describe(&self) -> String {
        let mut out = format!(
            "<RefreshReport> refreshed={} failed={} skipped={}",
            self.refreshed.len(),
            self.failed.len(),
            self.skipped.len()
        );
        for entry in &self.refreshed {
            out.push_str(&format!(
                "\nrefreshed  {}  {}  processed={} added={} closed={}",
                entry.segment.segment_id,
                entry.strategy,
                entry.outcome.processed_ids().len(),
                entry.outcome.added_ids().len(),
                entry.outcome.closed_ids().len()
            ));
        }
        for entry in &self.failed {
            out.push_str(&format!(
                "\nfailed     {}  {}",
                entry.segment.segment_id, entry.action
            ));
        }
        for entry in &self.skipped {
            let reason = match &entry.reason {
                SkipReason::ChecksNotPassed(checks) => checks.join(","),
                SkipReason::Strategy(err) => err.to_string(),
            };
            out.push_str(&format!(
                "\nskipped    {}  {reason}",
                entry.segment.segment_id
            ));
        }
        out
    }
}

#[derive(Debug, Serialize)]
struct SelectionInput<'a> {
    config_table: &'a CollectionRef,
    candidates: usize,
}

/// Filters the configuration snapshot down to eligible segments.
struct SelectSegments<'a> {
    segments: &'a [SegmentDescriptor],
}

impl<'a> Operation for SelectSegments<'a> {
    type Input = SelectionInput<'a>;
    type Output = SegmentSet;

    fn action(&self) -> &'static str {
        "select_segments"
    }

    fn description(&self) -> &'static str {
        "Select segments due for refresh"
    }

    fn run(
        &self,
        _conn: &mut dyn StoreConnection,
        _input: &SelectionInput<'a>,
    ) -> Result<SegmentSet, OperationError> {
        Ok(SegmentSet(select_eligible(self.segments)))
    }
}

pub struct Segmenter {
    auditor: Auditor,
    config_table: CollectionRef,
    segments: Vec<SegmentDescriptor>,
    checks: CheckRegistry,
    policy: CheckPolicy,
    metrics: SegmenterMetrics,
    clock: Box<dyn Clock>,
    started_at: NaiveDateTime,
}

impl Segmenter {
    /// Opens the log sink, probes the log and configuration tables and loads the configuration.
    pub fn connect(
        connector: Box<dyn Connector>,
        options: SegmenterOptions,
    ) -> Result<Self, SegmenterError> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = options.clock.now();

        let sink = {
            let mut conn = connector.acquire().map_err(SegmenterError::Acquire)?;
            LogSink::open(&mut *conn, options.log_table.clone())?
        };
        let auditor = Auditor::new(run_id, connector, sink, options.metrics.clone());

        let log_probe = auditor.invoke(
            &ReachabilityCheck::schema_only(),
            &CheckInput::for_table(options.log_table.clone(), started_at),
        )?;
        if !log_probe.output().is_some_and(CheckOutput::passed) {
            warn!(
                run_id = %auditor.run_id(),
                table = %options.log_table,
                "log table did not pass the reachability check"
            );
        }

        let mut config_table = options.config_table;
        let config_probe = auditor.invoke(
            &ReachabilityCheck::with_data(),
            &CheckInput::for_table(config_table.clone(), started_at),
        )?;
        match config_probe {
            Invocation::Completed(CheckOutput {
                evidence: Evidence::Frame(frame),
                verdict: Some(true),
            }) => config_table.cache(frame, true),
            _ => {
                return Err(SegmenterError::ConfigUnavailable {
                    table: config_table.to_string(),
                })
            }
        }

        let segments = config_table
            .data()
            .map(|frame| SegmentDescriptor::from_frame(frame, &options.default_namespace))
            .unwrap_or_default();
        info!(
            event = "segmenter_connected",
            run_id = %auditor.run_id(),
            config_table = %config_table,
            segments = segments.len(),
            checks = ?options.checks.names(),
            "loaded segment configuration"
        );

        Ok(Self {
            auditor,
            config_table,
            segments,
            checks: options.checks,
            policy: options.policy,
            metrics: options.metrics,
            clock: options.clock,
            started_at,
        })
    }

    pub fn run_id(&self) -> &str {
        self.auditor.run_id()
    }

    pub fn auditor(&self) -> &Auditor {
        &self.auditor
    }

    pub fn config_table(&self) -> &CollectionRef {
        &self.config_table
    }

    /// Every parseable descriptor of the configuration snapshot.
    pub fn segments(&self) -> &[SegmentDescriptor] {
        &self.segments
    }

    /// Eligible segments; an instrumented call, so it leaves a `select_segments` record.
    pub fn select_segments(&self) -> Result<Vec<SegmentDescriptor>, AuditError> {
        let op = SelectSegments {
            segments: &self.segments,
        };
        let input = SelectionInput {
            config_table: &self.config_table,
            candidates: self.segments.len(),
        };
        Ok(self
            .auditor
            .invoke(&op, &input)?
            .ok()
            .map(|selection| selection.0)
            .unwrap_or_default())
    }

    /// One batch: checks then refresh for every eligible segment, strictly in order.
    ///
    /// `Err` only when an audit record could not be written.
    pub fn refresh_segments(&self) -> Result<RefreshReport, AuditError> {
        let mut report = RefreshReport::default();

        for segment in self.select_segments()? {
            let span = info_span!("segment", segment_id = %segment.segment_id);
            let _guard = span.enter();

            let input = segment.check_input(self.started_at, self.clock.now());
            let chain = self.checks.evaluate(&self.auditor, &input, self.policy)?;
            if !chain.passed() {
                info!(
                    event = "segment_skipped",
                    not_passed = ?chain.not_passed,
                    "segment did not pass its checks"
                );
                self.metrics.record_segment(SegmentOutcome::Skipped);
                report.skipped.push(SkippedSegment {
                    segment,
                    reason: SkipReason::ChecksNotPassed(chain.not_passed),
                });
                continue;
            }

            let strategy = match RefreshStrategy::resolve(&segment.refresh_params) {
                Ok(strategy) => strategy,
                Err(err) => {
                    self.record_strategy_error(&segment, &err)?;
                    self.metrics.record_segment(SegmentOutcome::Skipped);
                    report.skipped.push(SkippedSegment {
                        segment,
                        reason: SkipReason::Strategy(err),
                    });
                    continue;
                }
            };

            let operation = strategy.operation();
            let input = segment.refresh_input(&strategy, self.clock.now());
            match self.auditor.invoke(operation, &input)? {
                Invocation::Completed(outcome) => {
                    info!(
                        event = "segment_refreshed",
                        strategy = strategy.name(),
                        processed = outcome.processed_ids().len(),
                        added = outcome.added_ids().len(),
                        closed = outcome.closed_ids().len(),
                        "segment refreshed"
                    );
                    self.metrics.record_segment(SegmentOutcome::Refreshed);
                    report.refreshed.push(RefreshedSegment {
                        segment,
                        strategy: strategy.name(),
                        outcome,
                    });
                }
                Invocation::Failed(failure) => {
                    self.metrics.record_segment(SegmentOutcome::Failed);
                    report.failed.push(FailedSegment {
                        segment,
                        action: failure.action,
                        report: failure.report,
                    });
                }
            }
        }

        self.auditor.record(
            "refresh_segments",
            &Map::new(),
            format!("Refresh segments: {}", report.describe()),
            None,
        )?;
        Ok(report)
    }

    fn record_strategy_error(
        &self,
        segment: &SegmentDescriptor,
        err: &StrategyError,
    ) -> Result<(), AuditError> {
        let snapshot = match serde_json::to_value(segment) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let report = format_error_chain(err);
        warn!(
            event = "strategy_unresolved",
            run_id = %self.run_id(),
            error = %err,
            "segment refresh_params do not name a usable strategy"
        );
        self.auditor.record(
            "resolve_strategy",
            &snapshot,
            format!("Resolve refresh strategy:\n{report}"),
            Some(report),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite_test::SqliteFixture;
    use chrono::NaiveDate;

    fn options(fixture_ns: &str) -> SegmenterOptions {
        SegmenterOptions {
            config_table: CollectionRef::new(fixture_ns, "segmenter"),
            log_table: CollectionRef::new(fixture_ns, "segmenter_log"),
            default_namespace: fixture_ns.to_string(),
            clock: Box::new(FixedClock(
                NaiveDate::from_ymd_opt(2026, 5, 4)
                    .unwrap()
                    .and_hms_opt(10, 5, 0)
                    .unwrap(),
            )),
            ..SegmenterOptions::default()
        }
    }

    #[test]
    fn connect_probes_both_tables_and_loads_descriptors() {
        let fixture = SqliteFixture::new();
        fixture.execute(
            "INSERT INTO main.segmenter VALUES \
             ('s1', 'one', 'seg_one', '*/5 * * * *', '{\"query\": {\"sql\": \"select 1 as id\"}}', 1), \
             ('s2', 'two', 'seg_two', NULL, '{}', 0)",
        );

        let segmenter = Segmenter::connect(Box::new(fixture.connector()), options("main")).unwrap();
        assert_eq!(segmenter.segments().len(), 2);
        assert_eq!(segmenter.segments()[0].table_name.to_string(), "main.seg_one");
        assert!(segmenter.config_table().data().is_some());

        let actions: Vec<_> = fixture.log_rows().into_iter().map(|row| row.action).collect();
        assert_eq!(actions, ["check_table", "check_table"]);

        let selected = segmenter.select_segments().unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].segment_id, "s1");
        let last = fixture.log_rows().pop().unwrap();
        assert_eq!(last.action, "select_segments");
        assert_eq!(last.id, segmenter.run_id());
    }

    #[test]
    fn missing_config_table_is_a_startup_error() {
        let fixture = SqliteFixture::new();
        let mut opts = options("main");
        opts.config_table = CollectionRef::new("main", "no_such_config");

        let err = Segmenter::connect(Box::new(fixture.connector()), opts)
            .err()
            .unwrap();
        assert!(matches!(err, SegmenterError::ConfigUnavailable { .. }));
        // the failed probe itself is still on record
        assert!(fixture
            .log_rows()
            .iter()
            .any(|row| row.action == "check_table" && row.error.is_some()));
    }

    #[test]
    fn missing_log_table_is_a_sink_error() {
        let fixture = SqliteFixture::new();
        let mut opts = options("main");
        opts.log_table = CollectionRef::new("main", "no_such_log");

        let err = Segmenter::connect(Box::new(fixture.connector()), opts)
            .err()
            .unwrap();
        assert!(matches!(err, SegmenterError::Sink(SinkError::Missing { .. })));
    }

    #[test]
    fn ambiguous_params_skip_the_segment_with_a_record() {
        let fixture = SqliteFixture::new();
        fixture.execute(
            "CREATE TABLE main.seg_one (id TEXT, segment_id TEXT, actual_begin TEXT, actual_end TEXT, processed TEXT); \
             INSERT INTO main.seg_one VALUES ('1', 's1', '2026-05-01', 'infinity', '2026-05-01'); \
             INSERT INTO main.segmenter VALUES \
             ('s1', 'one', 'seg_one', '*/5 * * * *', \
              '{\"query\": {\"sql\": \"select 1 as id\"}, \"procedure\": {\"sql\": \"select 1\"}}', 1);",
        );

        let segmenter = Segmenter::connect(Box::new(fixture.connector()), options("main")).unwrap();
        let report = segmenter.refresh_segments().unwrap();
        assert!(report.refreshed.is_empty());
        assert!(matches!(
            report.skipped[0].reason,
            SkipReason::Strategy(StrategyError::Ambiguous { .. })
        ));

        let rows = fixture.log_rows();
        let resolve = rows
            .iter()
            .find(|row| row.action == "resolve_strategy")
            .unwrap();
        assert_eq!(resolve.segment_id.as_deref(), Some("s1"));
        assert!(resolve.error.as_deref().unwrap().contains("more than one strategy"));
        assert_eq!(rows.last().unwrap().action, "refresh_segments");
    }
}
