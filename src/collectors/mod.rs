//! Prometheus metric collectors for GitLab data.
//!
//! Each collector owns one metric family group, a fetch routine (`run`), and
//! a materialization routine (`collect`). Observations from the last
//! completed scrape are kept behind a per-collector RwLock and swapped
//! atomically, so a concurrent `/metrics` scrape sees either the previous
//! complete snapshot or the new one, never a mixture.

pub mod code_review;
pub mod contributors;
pub mod dora;
pub mod environments;
pub mod jobs;
pub mod merge_requests;
pub mod pipelines;
pub mod repository;
pub mod test_reports;
pub mod value_stream;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use code_review::CodeReviewCollector;
pub use contributors::ContributorsCollector;
pub use dora::DoraCollector;
pub use environments::EnvironmentsCollector;
pub use jobs::JobsCollector;
pub use merge_requests::MergeRequestsCollector;
pub use pipelines::PipelinesCollector;
pub use repository::RepositoryCollector;
pub use test_reports::TestReportsCollector;
pub use value_stream::ValueStreamCollector;

/// The interface all metric collectors implement.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Human-readable name, e.g. "pipelines". Also the `collector_type` label.
    fn name(&self) -> &'static str;

    /// Whether this collector is active. Disabled collectors stay registered
    /// so `describe` output is stable, but emit nothing and are never
    /// scheduled.
    fn enabled(&self) -> bool;

    /// The super-set of all possible metric descriptors.
    fn describe(&self) -> Vec<&Desc>;

    /// Materializes the current observation snapshot into metric families.
    fn collect(&self) -> Vec<MetricFamily>;

    /// Fetches data from GitLab and replaces the observation snapshot.
    /// Called periodically by the scheduler; may run concurrently with
    /// `collect`.
    async fn run(&self, cancel: &CancellationToken) -> Result<()>;

    /// Updates the set of project paths to track.
    fn set_projects(&self, projects: Vec<String>);
}

/// Holds all registered collectors in insertion order and adapts them to the
/// `prometheus` crate's collector contract, so the whole set registers with a
/// `prometheus::Registry` as a single collector.
#[derive(Clone, Default)]
pub struct Registry {
    collectors: Vec<Arc<dyn Collector>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        tracing::info!(
            collector = collector.name(),
            enabled = collector.enabled(),
            "registered collector"
        );
        self.collectors.push(collector);
    }

    pub fn collectors(&self) -> &[Arc<dyn Collector>] {
        &self.collectors
    }
}

impl prometheus::core::Collector for Registry {
    /// Descriptor union over every collector, enabled or not, per Prometheus
    /// conventions. Shared descriptors (the scrape metrics) are deduplicated.
    fn desc(&self) -> Vec<&Desc> {
        let mut seen = std::collections::HashSet::new();
        let mut descs = Vec::new();
        for collector in &self.collectors {
            for desc in collector.describe() {
                if seen.insert(desc.id) {
                    descs.push(desc);
                }
            }
        }
        descs
    }

    /// Metric families from enabled collectors only. Families that several
    /// collectors share (the scrape metrics) are merged by name.
    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = Vec::new();
        for collector in &self.collectors {
            if collector.enabled() {
                families.extend(collector.collect());
            }
        }
        merge_families(families)
    }
}

/// Merges families with the same name by concatenating their metrics.
fn merge_families(families: Vec<MetricFamily>) -> Vec<MetricFamily> {
    let mut by_name: BTreeMap<String, MetricFamily> = BTreeMap::new();
    for mut family in families {
        match by_name.get_mut(family.get_name()) {
            Some(existing) => {
                for metric in family.take_metric().into_iter() {
                    existing.mut_metric().push(metric);
                }
            }
            None => {
                by_name.insert(family.get_name().to_string(), family);
            }
        }
    }
    by_name.into_values().collect()
}

// ---------------------------------------------------------------------------
// Observation snapshots
// ---------------------------------------------------------------------------

/// One observed value under a label tuple.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LabeledValue {
    pub labels: Vec<String>,
    pub value: f64,
}

impl LabeledValue {
    pub fn new(labels: Vec<String>, value: f64) -> Self {
        Self { labels, value }
    }
}

/// Builds a metric descriptor with variable labels and no const labels.
pub(crate) fn new_desc(name: &str, help: &str, labels: &[&str]) -> Desc {
    Desc::new(
        name.to_string(),
        help.to_string(),
        labels.iter().map(|l| l.to_string()).collect(),
        HashMap::new(),
    )
    .expect("valid metric descriptor")
}

/// Materializes an observation snapshot into Prometheus metric families.
///
/// Families are built fresh from the snapshot on every scrape, so values are
/// exactly what the last completed run recorded: re-running a collector
/// against unchanged data cannot re-advance histogram sums, and a scrape
/// never observes a half-applied update.
pub(crate) struct FamilyBuilder {
    registry: prometheus::Registry,
}

impl FamilyBuilder {
    pub fn new() -> Self {
        Self {
            registry: prometheus::Registry::new(),
        }
    }

    /// Adds a gauge family. The last value wins for duplicate label tuples.
    pub fn gauges(&self, name: &str, help: &str, label_names: &[&str], values: &[LabeledValue]) {
        if values.is_empty() {
            return;
        }
        let vec = GaugeVec::new(Opts::new(name, help), label_names).expect("valid gauge family");
        self.registry
            .register(Box::new(vec.clone()))
            .expect("unique family name");
        for value in values {
            vec.with_label_values(&label_refs(&value.labels)).set(value.value);
        }
    }

    /// Adds a counter family. Duplicate label tuples accumulate.
    pub fn counters(&self, name: &str, help: &str, label_names: &[&str], values: &[LabeledValue]) {
        if values.is_empty() {
            return;
        }
        let vec = CounterVec::new(Opts::new(name, help), label_names).expect("valid counter family");
        self.registry
            .register(Box::new(vec.clone()))
            .expect("unique family name");
        for value in values {
            vec.with_label_values(&label_refs(&value.labels)).inc_by(value.value);
        }
    }

    /// Adds a histogram family, observing each value once.
    pub fn histograms(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        buckets: &[f64],
        values: &[LabeledValue],
    ) {
        if values.is_empty() {
            return;
        }
        let opts = HistogramOpts::new(name, help).buckets(buckets.to_vec());
        let vec = HistogramVec::new(opts, label_names).expect("valid histogram family");
        self.registry
            .register(Box::new(vec.clone()))
            .expect("unique family name");
        for value in values {
            vec.with_label_values(&label_refs(&value.labels)).observe(value.value);
        }
    }

    /// Adds the per-collector scrape metrics shared by every collector.
    pub fn scrape_metrics(&self, collector_type: &str, duration_seconds: f64, errors_total: f64) {
        self.gauges(
            "age_scrape_duration_seconds",
            "Time taken by the collector scrape.",
            &["collector_type"],
            &[LabeledValue::new(vec![collector_type.to_string()], duration_seconds)],
        );
        self.counters(
            "age_scrape_errors_total",
            "Total number of scrape errors.",
            &["collector_type"],
            &[LabeledValue::new(vec![collector_type.to_string()], errors_total)],
        );
    }

    pub fn finish(self) -> Vec<MetricFamily> {
        self.registry.gather()
    }
}

fn label_refs(labels: &[String]) -> Vec<&str> {
    labels.iter().map(String::as_str).collect()
}

/// Descriptors for the scrape metrics every collector emits.
pub(crate) fn scrape_descs() -> Vec<Desc> {
    vec![
        new_desc(
            "age_scrape_duration_seconds",
            "Time taken by the collector scrape.",
            &["collector_type"],
        ),
        new_desc(
            "age_scrape_errors_total",
            "Total number of scrape errors.",
            &["collector_type"],
        ),
    ]
}

/// Read-lock helper that recovers from poisoning: a panicking run must not
/// permanently break `/metrics`.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Copies the tracked project list out of a collector's lock.
pub(crate) fn snapshot_projects(projects: &RwLock<Vec<String>>) -> Vec<String> {
    read_lock(projects).clone()
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;

    struct StubCollector {
        name: &'static str,
        enabled: bool,
        descs: Vec<Desc>,
    }

    impl StubCollector {
        fn new(name: &'static str, enabled: bool) -> Self {
            Self {
                name,
                enabled,
                descs: scrape_descs(),
            }
        }
    }

    #[async_trait]
    impl Collector for StubCollector {
        fn name(&self) -> &'static str {
            self.name
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        fn describe(&self) -> Vec<&Desc> {
            self.descs.iter().collect()
        }

        fn collect(&self) -> Vec<MetricFamily> {
            let builder = FamilyBuilder::new();
            builder.scrape_metrics(self.name, 0.1, 0.0);
            builder.finish()
        }

        async fn run(&self, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }

        fn set_projects(&self, _projects: Vec<String>) {}
    }

    #[test]
    fn test_registry_describe_includes_disabled_collectors() {
        use prometheus::core::Collector as _;

        let mut registry = Registry::new();
        registry.register(Arc::new(StubCollector::new("pipelines", true)));
        registry.register(Arc::new(StubCollector::new("dora", false)));

        // Shared descriptors appear once, regardless of enablement.
        let descs = registry.desc();
        assert_eq!(descs.len(), 2);
    }

    #[test]
    fn test_registry_collect_skips_disabled_collectors() {
        use prometheus::core::Collector as _;

        let mut registry = Registry::new();
        registry.register(Arc::new(StubCollector::new("pipelines", true)));
        registry.register(Arc::new(StubCollector::new("dora", false)));

        let families = registry.collect();
        let duration = testutil::family(&families, "age_scrape_duration_seconds").unwrap();
        assert_eq!(duration.get_metric().len(), 1);
        assert_eq!(
            duration.get_metric()[0].get_label()[0].get_value(),
            "pipelines"
        );
    }

    #[test]
    fn test_registry_registers_with_prometheus() {
        let mut registry = Registry::new();
        registry.register(Arc::new(StubCollector::new("pipelines", true)));

        let prom = prometheus::Registry::new();
        prom.register(Box::new(registry)).unwrap();

        let families = prom.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "age_scrape_duration_seconds"));
    }

    #[test]
    fn test_family_builder_gauges_and_counters() {
        let builder = FamilyBuilder::new();
        builder.gauges(
            "age_test_gauge",
            "help",
            &["project"],
            &[
                LabeledValue::new(vec!["a".to_string()], 1.0),
                LabeledValue::new(vec!["b".to_string()], 2.0),
            ],
        );
        builder.counters(
            "age_test_counter",
            "help",
            &["project"],
            &[
                LabeledValue::new(vec!["a".to_string()], 2.0),
                LabeledValue::new(vec!["a".to_string()], 3.0),
            ],
        );

        let families = builder.finish();
        assert_eq!(
            testutil::gauge_value(&families, "age_test_gauge", &[("project", "b")]),
            Some(2.0)
        );
        // Counter values accumulate across duplicate tuples.
        assert_eq!(
            testutil::counter_value(&families, "age_test_counter", &[("project", "a")]),
            Some(5.0)
        );
    }

    #[test]
    fn test_family_builder_histograms() {
        let builder = FamilyBuilder::new();
        builder.histograms(
            "age_test_seconds",
            "help",
            &["project"],
            &[10.0, 60.0, 120.0],
            &[
                LabeledValue::new(vec!["a".to_string()], 120.0),
                LabeledValue::new(vec!["a".to_string()], 5.0),
            ],
        );

        let families = builder.finish();
        let (count, sum) =
            testutil::histogram_stats(&families, "age_test_seconds", &[("project", "a")]).unwrap();
        assert_eq!(count, 2);
        assert!((sum - 125.0).abs() < 1e-9);

        // An observation equal to the bound lands in that bucket.
        assert_eq!(
            testutil::bucket_count(&families, "age_test_seconds", &[("project", "a")], 120.0),
            Some(2)
        );
        assert_eq!(
            testutil::bucket_count(&families, "age_test_seconds", &[("project", "a")], 10.0),
            Some(1)
        );
    }

    #[test]
    fn test_empty_value_lists_emit_no_family() {
        let builder = FamilyBuilder::new();
        builder.gauges("age_empty", "help", &["project"], &[]);
        let families = builder.finish();
        assert!(testutil::family(&families, "age_empty").is_none());
    }

    #[test]
    fn test_merge_families_concatenates_metrics() {
        let a = {
            let builder = FamilyBuilder::new();
            builder.scrape_metrics("pipelines", 0.5, 0.0);
            builder.finish()
        };
        let b = {
            let builder = FamilyBuilder::new();
            builder.scrape_metrics("jobs", 0.25, 2.0);
            builder.finish()
        };

        let merged = merge_families(a.into_iter().chain(b).collect());
        let duration = testutil::family(&merged, "age_scrape_duration_seconds").unwrap();
        assert_eq!(duration.get_metric().len(), 2);

        assert_eq!(
            testutil::counter_value(
                &merged,
                "age_scrape_errors_total",
                &[("collector_type", "jobs")]
            ),
            Some(2.0)
        );
    }
}
