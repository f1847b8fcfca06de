//! Batch metrics in Prometheus text exposition format.
//!
//! The segmenter is a run-to-completion job, so instead of serving `/metrics` the registry is
//! rendered once after the batch and written to a textfile-collector path when asked to.

use std::fs;
use std::io;
use std::path::Path;

use prometheus_client::encoding::{text::encode, EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::build_info;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum OperationOutcome {
    Completed,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SegmentOutcome {
    Refreshed,
    Failed,
    Skipped,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub action: String,
    pub outcome: OperationOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SegmentLabels {
    pub outcome: SegmentOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

#[derive(Clone, Default)]
pub struct SegmenterMetrics {
    /// Instrumented calls by action and outcome.
    pub operations_total: Family<OperationLabels, Counter>,
    /// Segments by final outcome within the batch.
    pub segments_total: Family<SegmentLabels, Counter>,
}

impl SegmenterMetrics {
    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::default();
        let sub_registry = registry.sub_registry_with_prefix(prefix);

        let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
        build_info_metric
            .get_or_create(&BuildInfoLabels {
                service: "segmenter",
                version: build_info::VERSION,
                commit: build_info::short_commit_hash(),
            })
            .set(1);
        sub_registry.register(
            "build_info",
            "Build identity labels for this process",
            build_info_metric,
        );
        sub_registry.register(
            "operations",
            "Total number of instrumented store operations",
            metrics.operations_total.clone(),
        );
        sub_registry.register(
            "segments",
            "Total number of segments handled by refresh batches",
            metrics.segments_total.clone(),
        );
        metrics
    }

    pub fn record_operation(&self, action: &str, outcome: OperationOutcome) {
        self.operations_total
            .get_or_create(&OperationLabels {
                action: action.to_string(),
                outcome,
            })
            .inc();
    }

    pub fn record_segment(&self, outcome: SegmentOutcome) {
        self.segments_total
            .get_or_create(&SegmentLabels { outcome })
            .inc();
    }
}

/// Renders `registry` and writes it to `path` via a sibling temp file so collectors never read
/// a half-written file.
pub fn write_textfile(registry: &Registry, path: &Path) -> io::Result<()> {
    let mut body = String::new();
    encode(&mut body, registry).map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    let tmp_path = path.with_extension("prom.tmp");
    fs::write(&tmp_path, body)?;
    fs::rename(&tmp_path, path)
}
