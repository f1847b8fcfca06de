//! Segment descriptors: the rows of the configuration table.

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::checks::CheckInput;
use crate::collection::CollectionRef;
use crate::refresh::{RefreshInput, RefreshStrategy};
use crate::store::{Describe, Frame};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentDescriptor {
    pub segment_id: String,
    pub segment_name: Option<String>,
    pub table_name: CollectionRef,
    pub refresh_cron: Option<String>,
    pub refresh_params: Map<String, Value>,
    pub refresh_auto: bool,
}

impl SegmentDescriptor {
    /// Reads one configuration row.
    ///
    /// Both the current layout (`segment_id`, `segment_name`) and the legacy one (`id`, `name`)
    /// are accepted. Rows without an id or a usable `table_name` yield `None`.
    pub fn from_row(row: &Map<String, Value>, default_namespace: &str) -> Option<Self> {
        let segment_id = text(row.get("segment_id").or_else(|| row.get("id")))?;
        let segment_name = text(row.get("segment_name").or_else(|| row.get("name")));
        let Some(table_name) = text(row.get("table_name"))
            .and_then(|raw| CollectionRef::parse(&raw, default_namespace))
        else {
            warn!(
                segment_id = %segment_id,
                "segment has no usable table_name; ignoring it"
            );
            return None;
        };

        Some(Self {
            refresh_cron: text(row.get("refresh_cron")),
            refresh_params: params(&segment_id, row.get("refresh_params")),
            refresh_auto: flag(row.get("refresh_auto")),
            segment_id,
            segment_name,
            table_name,
        })
    }

    /// Every parseable descriptor of a configuration snapshot, in row order.
    pub fn from_frame(frame: &Frame, default_namespace: &str) -> Vec<Self> {
        frame
            .rows()
            .iter()
            .filter_map(|row| Self::from_row(row, default_namespace))
            .collect()
    }

    /// Auto-refreshed, scheduled, and configured with refresh params.
    pub fn is_eligible(&self) -> bool {
        self.refresh_auto && self.refresh_cron.is_some() && !self.refresh_params.is_empty()
    }

    pub fn check_input(
        &self,
        reference_time: NaiveDateTime,
        evaluated_at: NaiveDateTime,
    ) -> CheckInput {
        CheckInput {
            segment_id: Some(self.segment_id.clone()),
            segment_name: self.segment_name.clone(),
            table_name: self.table_name.clone(),
            refresh_cron: self.refresh_cron.clone(),
            refresh_params: self.refresh_params.clone(),
            reference_time,
            evaluated_at,
        }
    }

    pub fn refresh_input(&self, strategy: &RefreshStrategy, now: NaiveDateTime) -> RefreshInput {
        RefreshInput {
            table_name: self.table_name.clone(),
            sql: strategy.sql().to_string(),
            segment_id: self.segment_id.clone(),
            segment_name: self.segment_name.clone(),
            now,
        }
    }
}

/// Eligible descriptors, in configuration order.
pub fn select_eligible(segments: &[SegmentDescriptor]) -> Vec<SegmentDescriptor> {
    segments
        .iter()
        .filter(|segment| segment.is_eligible())
        .cloned()
        .collect()
}

/// A selection of segments as rendered in the audit log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentSet(pub Vec<SegmentDescriptor>);

impl Describe for SegmentSet {
    fn describe(&self) -> String {
        let mut out = format!("<Segments> {} rows", self.0.len());
        for segment in &self.0 {
            out.push_str(&format!(
                "\n{}  {}  {}",
                segment.segment_id,
                segment.table_name,
                segment.refresh_cron.as_deref().unwrap_or("-")
            ));
        }
        out
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(text) if text.trim().is_empty() => None,
        Value::String(text) => Some(text.trim().to_string()),
        other => Some(other.to_string()),
    }
}

fn params(segment_id: &str, value: Option<&Value>) -> Map<String, Value> {
    match value {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(raw)) if raw.trim().is_empty() => Map::new(),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!(
                    segment_id,
                    refresh_params = %raw,
                    "refresh_params is not a JSON object; treating as empty"
                );
                Map::new()
            }
        },
        Some(other) => {
            warn!(
                segment_id,
                refresh_params = %other,
                "refresh_params is not a JSON object; treating as empty"
            );
            Map::new()
        }
    }
}

fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(raw)) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "true" | "t" | "1" | "yes" | "y"
        ),
        _ => false,
    }
}
