use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::PipelinesCollectorConfig;
use crate::error::{ExporterError, Result};
use crate::gitlab::graphql::GraphQlPipeline;
use crate::gitlab::types::Pipeline;
use crate::gitlab::{GitLabClient, ListPipelinesOptions};
use crate::store::{last_updated_key, Store};

use super::{
    new_desc, read_lock, scrape_descs, snapshot_projects, write_lock, Collector, FamilyBuilder,
    LabeledValue,
};

const PARENT_LABELS: [&str; 5] = ["project", "ref", "kind", "source", "status"];
const CHILD_LABELS: [&str; 5] = ["project", "ref", "parent_project", "parent_ref", "bridge_name"];

/// Fetches pipeline data from the GitLab API and exposes histogram and
/// gauge/counter metrics for pipeline durations, statuses, and child
/// pipelines discovered through bridge jobs.
pub struct PipelinesCollector {
    client: Arc<GitLabClient>,
    config: PipelinesCollectorConfig,
    store: Arc<dyn Store>,
    projects: RwLock<Vec<String>>,
    observations: RwLock<PipelineObservations>,
    buckets: Vec<f64>,
    descs: Vec<Desc>,
}

/// One tracked pipeline. Records are keyed by pipeline id per project and
/// retained across cycles, so incremental fetches (updated_after) merge into
/// the existing set instead of erasing unchanged pipelines.
#[derive(Debug, Clone)]
struct PipelineRecord {
    ref_: String,
    kind: String,
    source: String,
    status: String,
    duration: Option<f64>,
    queued_duration: Option<f64>,
    coverage: Option<f64>,
    created_at_epoch: Option<i64>,
    children: Vec<ChildRecord>,
}

/// A downstream pipeline reached through a bridge job. The project label is
/// the downstream project id rendered as a string when the path is unknown.
#[derive(Debug, Clone)]
struct ChildRecord {
    project: String,
    ref_: String,
    bridge_name: String,
    status: String,
    duration: Option<f64>,
    queued_duration: Option<f64>,
}

#[derive(Debug, Clone, Default)]
struct PipelineObservations {
    records: HashMap<String, BTreeMap<i64, PipelineRecord>>,
    scrape_duration: f64,
    scrape_errors: f64,
}

impl PipelinesCollector {
    pub fn new(
        client: Arc<GitLabClient>,
        config: PipelinesCollectorConfig,
        store: Arc<dyn Store>,
        projects: Vec<String>,
    ) -> Self {
        let buckets = if config.histogram_buckets.is_empty() {
            prometheus::DEFAULT_BUCKETS.to_vec()
        } else {
            config.histogram_buckets.clone()
        };

        let mut descs = vec![
            new_desc(
                "age_pipeline_duration_seconds",
                "Pipeline execution duration in seconds.",
                &PARENT_LABELS,
            ),
            new_desc(
                "age_pipeline_queued_duration_seconds",
                "Time a pipeline spent queued before execution in seconds.",
                &["project", "ref", "kind", "source"],
            ),
            new_desc(
                "age_pipeline_status",
                "Pipeline status (1 = current status matches label, 0 otherwise).",
                &PARENT_LABELS,
            ),
            new_desc(
                "age_pipeline_run_count",
                "Total pipeline runs.",
                &["project", "ref", "kind", "source"],
            ),
            new_desc(
                "age_pipeline_coverage",
                "Code coverage percentage reported by the pipeline.",
                &["project", "ref", "kind"],
            ),
            new_desc(
                "age_pipeline_id",
                "Latest pipeline ID.",
                &["project", "ref", "kind"],
            ),
            new_desc(
                "age_pipeline_created_timestamp",
                "Pipeline creation timestamp (unix epoch seconds).",
                &["project", "ref", "kind"],
            ),
            new_desc(
                "age_child_pipeline_duration_seconds",
                "Child/triggered pipeline execution duration in seconds.",
                &CHILD_LABELS,
            ),
            new_desc(
                "age_child_pipeline_queued_duration_seconds",
                "Child/triggered pipeline queue time in seconds.",
                &CHILD_LABELS,
            ),
            new_desc(
                "age_child_pipeline_status",
                "Child/triggered pipeline status.",
                &[
                    "project",
                    "ref",
                    "parent_project",
                    "parent_ref",
                    "bridge_name",
                    "status",
                ],
            ),
            new_desc(
                "age_child_pipeline_run_count",
                "Total child/triggered pipeline executions.",
                &CHILD_LABELS,
            ),
        ];
        descs.extend(scrape_descs());

        Self {
            client,
            config,
            store,
            projects: RwLock::new(projects),
            observations: RwLock::new(PipelineObservations::default()),
            buckets,
            descs,
        }
    }

    async fn collect_project(
        &self,
        cancel: &CancellationToken,
        obs: &mut PipelineObservations,
        project: &str,
    ) -> Result<()> {
        let store_key = last_updated_key(project, "pipelines");
        let updated_after = match self.store.get_last_updated(&store_key).await {
            Ok(at) => at,
            Err(err) => {
                warn!(project, error = %err, "failed to read last-updated state, fetching all");
                None
            }
        };
        let cycle_started = Utc::now();

        if self.client.use_graphql() {
            let first = self
                .config
                .max_pipelines_per_ref
                .min(self.client.graphql_page_size());
            let batch = match self
                .client
                .fetch_project_with_pipelines(cancel, project, first)
                .await
            {
                Ok(batch) => batch,
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) => {
                    // A batch failure must not mask unrelated projects.
                    warn!(project, error = %err, "batch query failed, skipping project this cycle");
                    return Ok(());
                }
            };

            for pipeline in &batch.pipelines {
                let Some(id) = pipeline.numeric_id() else {
                    continue;
                };
                let mut record = record_from_graphql(pipeline);
                if self.config.include_child_pipelines {
                    record.children = self.discover_children(cancel, project, id).await?;
                }
                obs.records
                    .entry(project.to_string())
                    .or_default()
                    .insert(id, record);
            }
        } else {
            let opts = ListPipelinesOptions {
                limit: Some(self.config.max_pipelines_per_ref),
                updated_after,
                ..Default::default()
            };
            let infos = self.client.list_pipelines(cancel, project, &opts).await?;

            for info in infos {
                let pipeline = match self.client.get_pipeline(cancel, project, info.id).await {
                    Ok(pipeline) => pipeline,
                    Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                    Err(err) => {
                        warn!(project, pipeline = info.id, error = %err, "failed to get pipeline details");
                        continue;
                    }
                };

                let mut record = record_from_pipeline(&pipeline);
                if self.config.include_child_pipelines {
                    record.children = self.discover_children(cancel, project, pipeline.id).await?;
                }
                obs.records
                    .entry(project.to_string())
                    .or_default()
                    .insert(pipeline.id, record);
            }
        }

        if let Some(records) = obs.records.get_mut(project) {
            // Cap retained history so long-lived processes stay bounded.
            let cap = self.config.max_pipelines_per_ref.saturating_mul(10).max(10);
            while records.len() > cap {
                records.pop_first();
            }
        }

        if let Err(err) = self.store.set_last_updated(&store_key, cycle_started).await {
            warn!(project, error = %err, "failed to persist last-updated state");
        }

        Ok(())
    }

    /// Walks bridge jobs of a pipeline and records every downstream pipeline.
    /// Cross-project targets the token cannot access keep their bridge-level
    /// fields but contribute no duration.
    async fn discover_children(
        &self,
        cancel: &CancellationToken,
        project: &str,
        pipeline_id: i64,
    ) -> Result<Vec<ChildRecord>> {
        let bridges = match self
            .client
            .list_pipeline_bridges(cancel, project, pipeline_id)
            .await
        {
            Ok(bridges) => bridges,
            Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
            Err(err) => {
                warn!(project, pipeline = pipeline_id, error = %err, "failed to list bridge jobs");
                return Ok(Vec::new());
            }
        };

        let mut children = Vec::new();
        for bridge in bridges {
            let Some(downstream) = bridge.downstream_pipeline else {
                continue;
            };

            let child_project = if downstream.project_id != 0 {
                downstream.project_id.to_string()
            } else {
                String::new()
            };

            // The bridge payload lacks duration fields; fetch the full record.
            let mut duration = None;
            let mut queued_duration = None;
            if !child_project.is_empty() {
                match self
                    .client
                    .get_pipeline(cancel, &child_project, downstream.id)
                    .await
                {
                    Ok(full) => {
                        duration = full.duration.filter(|d| *d > 0.0);
                        queued_duration = full.queued_duration.filter(|d| *d > 0.0);
                    }
                    Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                    Err(err) => {
                        debug!(
                            project = %child_project,
                            pipeline = downstream.id,
                            error = %err,
                            "downstream pipeline not accessible"
                        );
                    }
                }
            }

            children.push(ChildRecord {
                project: child_project,
                ref_: downstream.ref_,
                bridge_name: bridge.name,
                status: downstream.status,
                duration,
                queued_duration,
            });
        }

        Ok(children)
    }
}

#[async_trait]
impl Collector for PipelinesCollector {
    fn name(&self) -> &'static str {
        "pipelines"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn describe(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let obs = read_lock(&self.observations).clone();

        let mut duration = Vec::new();
        let mut queued = Vec::new();
        let mut status = Vec::new();
        let mut run_counts: HashMap<Vec<String>, f64> = HashMap::new();
        let mut coverage = Vec::new();
        let mut latest_id = Vec::new();
        let mut created = Vec::new();
        let mut child_duration = Vec::new();
        let mut child_queued = Vec::new();
        let mut child_status = Vec::new();
        let mut child_run_counts: HashMap<Vec<String>, f64> = HashMap::new();

        for (project, records) in &obs.records {
            // Latest pipeline per (ref, kind); BTreeMap iterates ids ascending.
            let mut latest: HashMap<(String, String), (i64, &PipelineRecord)> = HashMap::new();
            let mut latest_coverage: HashMap<(String, String), (i64, f64)> = HashMap::new();

            for (&id, record) in records {
                let base = vec![
                    project.clone(),
                    record.ref_.clone(),
                    record.kind.clone(),
                    record.source.clone(),
                ];
                let mut with_status = base.clone();
                with_status.push(record.status.clone());

                if let Some(value) = record.duration {
                    duration.push(LabeledValue::new(with_status.clone(), value));
                }
                if let Some(value) = record.queued_duration {
                    queued.push(LabeledValue::new(base.clone(), value));
                }
                status.push(LabeledValue::new(with_status, 1.0));
                *run_counts.entry(base).or_default() += 1.0;

                let group = (record.ref_.clone(), record.kind.clone());
                let entry = latest.entry(group.clone()).or_insert((id, record));
                if id >= entry.0 {
                    *entry = (id, record);
                }
                if let Some(value) = record.coverage {
                    let entry = latest_coverage.entry(group).or_insert((id, value));
                    if id >= entry.0 {
                        *entry = (id, value);
                    }
                }

                for child in &record.children {
                    let child_base = vec![
                        child.project.clone(),
                        child.ref_.clone(),
                        project.clone(),
                        record.ref_.clone(),
                        child.bridge_name.clone(),
                    ];
                    if let Some(value) = child.duration {
                        child_duration.push(LabeledValue::new(child_base.clone(), value));
                    }
                    if let Some(value) = child.queued_duration {
                        child_queued.push(LabeledValue::new(child_base.clone(), value));
                    }
                    let mut child_with_status = child_base.clone();
                    child_with_status.push(child.status.clone());
                    child_status.push(LabeledValue::new(child_with_status, 1.0));
                    *child_run_counts.entry(child_base).or_default() += 1.0;
                }
            }

            for ((ref_, kind), (id, record)) in latest {
                let labels = vec![project.clone(), ref_.clone(), kind.clone()];
                latest_id.push(LabeledValue::new(labels.clone(), id as f64));
                if let Some(epoch) = record.created_at_epoch {
                    created.push(LabeledValue::new(labels, epoch as f64));
                }
            }
            for ((ref_, kind), (_, value)) in latest_coverage {
                coverage.push(LabeledValue::new(vec![project.clone(), ref_, kind], value));
            }
        }

        let builder = FamilyBuilder::new();
        builder.histograms(
            "age_pipeline_duration_seconds",
            "Pipeline execution duration in seconds.",
            &PARENT_LABELS,
            &self.buckets,
            &duration,
        );
        builder.histograms(
            "age_pipeline_queued_duration_seconds",
            "Time a pipeline spent queued before execution in seconds.",
            &["project", "ref", "kind", "source"],
            &self.buckets,
            &queued,
        );
        builder.gauges(
            "age_pipeline_status",
            "Pipeline status (1 = current status matches label, 0 otherwise).",
            &PARENT_LABELS,
            &status,
        );
        builder.counters(
            "age_pipeline_run_count",
            "Total pipeline runs.",
            &["project", "ref", "kind", "source"],
            &to_labeled(run_counts),
        );
        builder.gauges(
            "age_pipeline_coverage",
            "Code coverage percentage reported by the pipeline.",
            &["project", "ref", "kind"],
            &coverage,
        );
        builder.gauges(
            "age_pipeline_id",
            "Latest pipeline ID.",
            &["project", "ref", "kind"],
            &latest_id,
        );
        builder.gauges(
            "age_pipeline_created_timestamp",
            "Pipeline creation timestamp (unix epoch seconds).",
            &["project", "ref", "kind"],
            &created,
        );
        builder.histograms(
            "age_child_pipeline_duration_seconds",
            "Child/triggered pipeline execution duration in seconds.",
            &CHILD_LABELS,
            &self.buckets,
            &child_duration,
        );
        builder.histograms(
            "age_child_pipeline_queued_duration_seconds",
            "Child/triggered pipeline queue time in seconds.",
            &CHILD_LABELS,
            &self.buckets,
            &child_queued,
        );
        builder.gauges(
            "age_child_pipeline_status",
            "Child/triggered pipeline status.",
            &[
                "project",
                "ref",
                "parent_project",
                "parent_ref",
                "bridge_name",
                "status",
            ],
            &child_status,
        );
        builder.counters(
            "age_child_pipeline_run_count",
            "Total child/triggered pipeline executions.",
            &CHILD_LABELS,
            &to_labeled(child_run_counts),
        );
        builder.scrape_metrics(self.name(), obs.scrape_duration, obs.scrape_errors);
        builder.finish()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let started = std::time::Instant::now();
        let projects = snapshot_projects(&self.projects);

        let mut obs = read_lock(&self.observations).clone();
        let mut err_count = 0.0;

        for project in &projects {
            match self.collect_project(cancel, &mut obs, project).await {
                Ok(()) => {}
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) => {
                    error!(project, error = %err, "failed to collect pipelines");
                    err_count += 1.0;
                }
            }
        }

        obs.scrape_duration = started.elapsed().as_secs_f64();
        obs.scrape_errors += err_count;
        *write_lock(&self.observations) = obs;

        debug!(projects = projects.len(), errors = err_count, "pipelines collection completed");
        Ok(())
    }

    fn set_projects(&self, projects: Vec<String>) {
        *write_lock(&self.projects) = projects;
    }
}

/// Maps a GitLab pipeline source to the exporter's kind label. Total: every
/// source value maps to exactly one kind.
pub(crate) fn pipeline_kind(source: Option<&str>) -> &'static str {
    match source.unwrap_or("") {
        "parent_pipeline" => "child",
        "trigger" | "pipeline" => "trigger",
        "merge_request_event" => "merge_request",
        "schedule" => "schedule",
        _ => "branch",
    }
}

fn record_from_pipeline(pipeline: &Pipeline) -> PipelineRecord {
    PipelineRecord {
        ref_: pipeline.ref_.clone(),
        kind: pipeline_kind(pipeline.source.as_deref()).to_string(),
        source: pipeline.source.clone().unwrap_or_default(),
        status: pipeline.status.clone(),
        duration: pipeline.duration.filter(|d| *d > 0.0),
        queued_duration: pipeline.queued_duration.filter(|d| *d > 0.0),
        coverage: pipeline
            .coverage
            .as_deref()
            .and_then(|raw| raw.trim().parse().ok()),
        created_at_epoch: pipeline.created_at.map(|t| t.timestamp()),
        children: Vec::new(),
    }
}

fn record_from_graphql(pipeline: &GraphQlPipeline) -> PipelineRecord {
    let source = pipeline.source.clone().unwrap_or_default();
    PipelineRecord {
        ref_: pipeline.ref_.clone().unwrap_or_default(),
        kind: pipeline_kind(Some(source.as_str())).to_string(),
        source,
        status: pipeline.status.to_lowercase(),
        duration: pipeline.duration.filter(|d| *d > 0.0),
        queued_duration: pipeline.queued_duration.filter(|d| *d > 0.0),
        coverage: None,
        created_at_epoch: pipeline
            .created_at
            .as_deref()
            .and_then(|raw| raw.parse::<chrono::DateTime<Utc>>().ok())
            .map(|t| t.timestamp()),
        children: Vec::new(),
    }
}

fn to_labeled(counts: HashMap<Vec<String>, f64>) -> Vec<LabeledValue> {
    counts
        .into_iter()
        .map(|(labels, value)| LabeledValue::new(labels, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::testutil;
    use crate::config::GitLabConfig;
    use crate::store::MemoryStore;

    fn test_collector(config: PipelinesCollectorConfig) -> PipelinesCollector {
        let gitlab = GitLabConfig {
            token: "t".to_string(),
            ..Default::default()
        };
        let client = Arc::new(GitLabClient::new(&gitlab, None).unwrap());
        PipelinesCollector::new(
            client,
            config,
            Arc::new(MemoryStore::new()),
            vec!["demo/app".to_string()],
        )
    }

    fn record(
        ref_: &str,
        source: &str,
        status: &str,
        duration: Option<f64>,
        queued: Option<f64>,
    ) -> PipelineRecord {
        PipelineRecord {
            ref_: ref_.to_string(),
            kind: pipeline_kind(Some(source)).to_string(),
            source: source.to_string(),
            status: status.to_string(),
            duration,
            queued_duration: queued,
            coverage: None,
            created_at_epoch: None,
            children: Vec::new(),
        }
    }

    #[test]
    fn test_pipeline_kind_is_total() {
        assert_eq!(pipeline_kind(Some("parent_pipeline")), "child");
        assert_eq!(pipeline_kind(Some("trigger")), "trigger");
        assert_eq!(pipeline_kind(Some("pipeline")), "trigger");
        assert_eq!(pipeline_kind(Some("merge_request_event")), "merge_request");
        assert_eq!(pipeline_kind(Some("schedule")), "schedule");
        assert_eq!(pipeline_kind(Some("push")), "branch");
        assert_eq!(pipeline_kind(Some("web")), "branch");
        assert_eq!(pipeline_kind(Some("api")), "branch");
        assert_eq!(pipeline_kind(Some("something_new")), "branch");
        assert_eq!(pipeline_kind(None), "branch");
    }

    #[test]
    fn test_record_from_pipeline_parses_coverage() {
        let payload = r#"{
            "id": 10, "ref": "main", "status": "success", "source": "push",
            "duration": 120, "queued_duration": 3, "coverage": "87.5",
            "created_at": "2026-01-01T00:00:00Z"
        }"#;
        let pipeline: Pipeline = serde_json::from_str(payload).unwrap();
        let record = record_from_pipeline(&pipeline);
        assert_eq!(record.kind, "branch");
        assert_eq!(record.coverage, Some(87.5));
        assert_eq!(record.created_at_epoch, Some(1767225600));

        // Unparseable coverage degrades to no observation.
        let pipeline = Pipeline {
            coverage: Some("n/a".to_string()),
            ..pipeline
        };
        assert_eq!(record_from_pipeline(&pipeline).coverage, None);
    }

    /// Scenario: one project, two pipelines on main triggered by push, the
    /// newer one successful (120s, queued 3s), the older one failed (45s).
    #[test]
    fn test_minimal_success_materialization() {
        let collector = test_collector(PipelinesCollectorConfig::default());

        {
            let mut obs = collector.observations.write().unwrap();
            let records = obs.records.entry("demo/app".to_string()).or_default();
            let mut newest = record("main", "push", "success", Some(120.0), Some(3.0));
            newest.created_at_epoch = Some(1767225600);
            records.insert(10, newest);
            records.insert(9, record("main", "push", "failed", Some(45.0), Some(1.0)));
        }

        let families = collector.collect();
        let labels = [
            ("project", "demo/app"),
            ("ref", "main"),
            ("kind", "branch"),
            ("source", "push"),
        ];

        let success_labels: Vec<(&str, &str)> = labels
            .iter()
            .copied()
            .chain([("status", "success")])
            .collect();
        let (count, sum) = testutil::histogram_stats(
            &families,
            "age_pipeline_duration_seconds",
            &success_labels,
        )
        .unwrap();
        assert_eq!(count, 1);
        assert!((sum - 120.0).abs() < 1e-9);
        assert_eq!(
            testutil::bucket_count(
                &families,
                "age_pipeline_duration_seconds",
                &success_labels,
                120.0
            ),
            Some(1)
        );

        let failed_labels: Vec<(&str, &str)> = labels
            .iter()
            .copied()
            .chain([("status", "failed")])
            .collect();
        assert_eq!(
            testutil::gauge_value(&families, "age_pipeline_status", &failed_labels),
            Some(1.0)
        );

        assert_eq!(
            testutil::counter_value(&families, "age_pipeline_run_count", &labels),
            Some(2.0)
        );

        assert_eq!(
            testutil::gauge_value(
                &families,
                "age_pipeline_id",
                &[("project", "demo/app"), ("ref", "main"), ("kind", "branch")]
            ),
            Some(10.0)
        );
        assert_eq!(
            testutil::gauge_value(
                &families,
                "age_pipeline_created_timestamp",
                &[("project", "demo/app"), ("ref", "main"), ("kind", "branch")]
            ),
            Some(1767225600.0)
        );
    }

    /// Scenario: a parent pipeline in team/api with a bridge whose downstream
    /// pipeline lives in project 999 and ran for 60 seconds.
    #[test]
    fn test_child_discovery_materialization() {
        let collector = test_collector(PipelinesCollectorConfig::default());

        {
            let mut obs = collector.observations.write().unwrap();
            let records = obs.records.entry("team/api".to_string()).or_default();
            let mut parent = record("main", "push", "success", Some(300.0), None);
            parent.children.push(ChildRecord {
                project: "999".to_string(),
                ref_: "main".to_string(),
                bridge_name: "trigger-backend".to_string(),
                status: "success".to_string(),
                duration: Some(60.0),
                queued_duration: None,
            });
            records.insert(100, parent);
        }

        let families = collector.collect();
        let child_labels = [
            ("project", "999"),
            ("ref", "main"),
            ("parent_project", "team/api"),
            ("parent_ref", "main"),
            ("bridge_name", "trigger-backend"),
        ];

        assert!(
            testutil::bucket_count(
                &families,
                "age_child_pipeline_duration_seconds",
                &child_labels,
                60.0
            )
            .unwrap()
                >= 1
        );

        let status_labels: Vec<(&str, &str)> = child_labels
            .iter()
            .copied()
            .chain([("status", "success")])
            .collect();
        assert_eq!(
            testutil::gauge_value(&families, "age_child_pipeline_status", &status_labels),
            Some(1.0)
        );
        assert_eq!(
            testutil::counter_value(&families, "age_child_pipeline_run_count", &child_labels),
            Some(1.0)
        );
    }

    #[test]
    fn test_collect_is_idempotent() {
        let collector = test_collector(PipelinesCollectorConfig::default());
        {
            let mut obs = collector.observations.write().unwrap();
            obs.records
                .entry("demo/app".to_string())
                .or_default()
                .insert(10, record("main", "push", "success", Some(120.0), None));
        }

        let first = collector.collect();
        let second = collector.collect();

        let labels = [
            ("project", "demo/app"),
            ("ref", "main"),
            ("kind", "branch"),
            ("source", "push"),
            ("status", "success"),
        ];
        assert_eq!(
            testutil::histogram_stats(&first, "age_pipeline_duration_seconds", &labels),
            testutil::histogram_stats(&second, "age_pipeline_duration_seconds", &labels),
        );
    }

    #[test]
    fn test_describe_is_stable_and_complete() {
        let collector = test_collector(PipelinesCollectorConfig::default());
        let descs = collector.describe();
        let names: Vec<&str> = descs.iter().map(|d| d.fq_name.as_str()).collect();
        assert!(names.contains(&"age_pipeline_duration_seconds"));
        assert!(names.contains(&"age_child_pipeline_run_count"));
        assert!(names.contains(&"age_scrape_errors_total"));
        // Stable across calls.
        assert_eq!(descs.len(), collector.describe().len());
    }

    #[test]
    fn test_disabled_collector_reports_disabled() {
        let collector = test_collector(PipelinesCollectorConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!collector.enabled());
        // Describe still works for disabled collectors.
        assert!(!collector.describe().is_empty());
    }
}
