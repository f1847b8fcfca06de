//! Admission checks gating a segment's refresh.
//!
//! Each check is an [`Operation`] over [`CheckInput`] and is always run through the
//! [`Auditor`]. A check that fails to run has no verdict, and no verdict never counts as a pass.

mod consistency;
mod reachability;
mod schedule;

pub use consistency::ConsistencyCheck;
pub use reachability::ReachabilityCheck;
pub use schedule::{normalize_cron, parse_schedule, window, ScheduleCheck};

use chrono::NaiveDateTime;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::audit::{AuditError, Auditor, Operation};
use crate::collection::CollectionRef;
use crate::store::{sql_timestamp, Describe, Frame, Record};

/// Everything a check may look at, taken from one segment descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct CheckInput {
    pub segment_id: Option<String>,
    pub segment_name: Option<String>,
    pub table_name: CollectionRef,
    pub refresh_cron: Option<String>,
    pub refresh_params: Map<String, Value>,
    /// Instant the schedule verdict is taken for.
    #[serde(serialize_with = "serialize_timestamp")]
    pub reference_time: NaiveDateTime,
    /// Instant the schedule window is computed around.
    #[serde(serialize_with = "serialize_timestamp")]
    pub evaluated_at: NaiveDateTime,
}

impl CheckInput {
    /// Input for probing a table that is not a segment (configuration and log tables).
    pub fn for_table(table_name: CollectionRef, at: NaiveDateTime) -> Self {
        Self {
            segment_id: None,
            segment_name: None,
            table_name,
            refresh_cron: None,
            refresh_params: Map::new(),
            reference_time: at,
            evaluated_at: at,
        }
    }
}

pub(crate) fn serialize_timestamp<S: Serializer>(
    at: &NaiveDateTime,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&sql_timestamp(*at))
}

/// What a check looked at.
#[derive(Debug, Clone, PartialEq)]
pub enum Evidence {
    Record(Record),
    Frame(Frame),
}

impl Describe for Evidence {
    fn describe(&self) -> String {
        match self {
            Evidence::Record(record) => record.describe(),
            Evidence::Frame(frame) => frame.describe(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutput {
    pub evidence: Evidence,
    pub verdict: Option<bool>,
}

impl CheckOutput {
    pub fn passed(&self) -> bool {
        self.verdict == Some(true)
    }
}

impl Describe for CheckOutput {
    fn describe(&self) -> String {
        let verdict = match self.verdict {
            Some(true) => "pass",
            Some(false) => "fail",
            None => "none",
        };
        format!("verdict={verdict}\n{}", self.evidence.describe())
    }
}

/// Object form of a check as stored in the registry.
pub type Check = dyn Operation<Input = CheckInput, Output = CheckOutput>;

/// Whether the chain keeps evaluating after a check did not pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckPolicy {
    /// Every check runs, so each segment gets a complete audit trail.
    #[default]
    RunAll,
    StopAtFirstFailure,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown check `{name}` (known: {known})")]
pub struct UnknownCheck {
    pub name: String,
    pub known: String,
}

/// Ordered set of checks, built once at startup.
pub struct CheckRegistry {
    checks: Vec<Box<Check>>,
}

impl CheckRegistry {
    pub fn new(checks: Vec<Box<Check>>) -> Self {
        Self { checks }
    }

    /// `check_cron`, `check_table`, `check_consistency`.
    pub fn default_chain() -> Self {
        Self::new(vec![
            Box::new(ScheduleCheck) as Box<Check>,
            Box::new(ReachabilityCheck::schema_only()),
            Box::new(ConsistencyCheck),
        ])
    }

    /// Keeps only the named checks, in registry order. An empty list keeps everything.
    pub fn only(self, names: &[String]) -> Result<Self, UnknownCheck> {
        if names.is_empty() {
            return Ok(self);
        }
        if let Some(name) = names.iter().find(|name| !self.contains(name)) {
            return Err(UnknownCheck {
                name: name.clone(),
                known: self.names().join(", "),
            });
        }

        let checks = self
            .checks
            .into_iter()
            .filter(|check| names.iter().any(|name| name == check.action()))
            .collect();
        Ok(Self { checks })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|check| check.action()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.checks.iter().any(|check| check.action() == name)
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Runs the chain for one segment.
    pub fn evaluate(
        &self,
        auditor: &Auditor,
        input: &CheckInput,
        policy: CheckPolicy,
    ) -> Result<ChainOutcome, AuditError> {
        let mut outcome = ChainOutcome::default();
        for check in &self.checks {
            let passed = auditor
                .invoke(&**check, input)?
                .ok()
                .is_some_and(|output| output.passed());
            outcome.evaluated.push(check.action());
            if !passed {
                outcome.not_passed.push(check.action());
                if policy == CheckPolicy::StopAtFirstFailure {
                    break;
                }
            }
        }

        debug!(
            segment_id = input.segment_id.as_deref().unwrap_or_default(),
            evaluated = ?outcome.evaluated,
            not_passed = ?outcome.not_passed,
            "check chain evaluated"
        );
        Ok(outcome)
    }
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::default_chain()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainOutcome {
    pub evaluated: Vec<&'static str>,
    pub not_passed: Vec<&'static str>,
}

impl ChainOutcome {
    pub fn passed(&self) -> bool {
        self.not_passed.is_empty()
    }
}
