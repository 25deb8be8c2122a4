use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::JobsCollectorConfig;
use crate::error::{ExporterError, Result};
use crate::gitlab::types::Job;
use crate::gitlab::{GitLabClient, ListPipelinesOptions};

use super::{
    new_desc, read_lock, scrape_descs, snapshot_projects, write_lock, Collector, FamilyBuilder,
    LabeledValue,
};

/// How many recent pipelines to walk for jobs per project and cycle.
const RECENT_PIPELINES: usize = 20;

/// Fetches job-level data and exposes histogram and gauge/counter metrics
/// for job durations, statuses, artifact sizes, and runner types.
pub struct JobsCollector {
    client: Arc<GitLabClient>,
    config: JobsCollectorConfig,
    projects: RwLock<Vec<String>>,
    observations: RwLock<JobObservations>,
    buckets: Vec<f64>,
    descs: Vec<Desc>,
}

#[derive(Debug, Clone)]
struct JobRecord {
    project: String,
    ref_: String,
    stage: String,
    name: String,
    runner_type: String,
    status: String,
    failure_reason: String,
    duration: Option<f64>,
    queued_duration: Option<f64>,
    artifact_size: Option<f64>,
}

#[derive(Debug, Clone, Default)]
struct JobObservations {
    records: Vec<JobRecord>,
    scrape_duration: f64,
    scrape_errors: f64,
}

impl JobsCollector {
    pub fn new(
        client: Arc<GitLabClient>,
        config: JobsCollectorConfig,
        projects: Vec<String>,
    ) -> Self {
        let buckets = if config.histogram_buckets.is_empty() {
            prometheus::DEFAULT_BUCKETS.to_vec()
        } else {
            config.histogram_buckets.clone()
        };

        let mut descs = vec![
            new_desc(
                "age_job_duration_seconds",
                "Job execution duration in seconds.",
                &["project", "ref", "stage", "job_name", "runner_type", "status"],
            ),
            new_desc(
                "age_job_queued_duration_seconds",
                "Time a job spent queued before execution in seconds.",
                &["project", "ref", "stage", "job_name"],
            ),
            new_desc(
                "age_job_status",
                "Job status (1 = current status matches label, 0 otherwise).",
                &["project", "ref", "stage", "job_name", "status", "failure_reason"],
            ),
            new_desc(
                "age_job_run_count",
                "Total job executions.",
                &["project", "ref", "stage", "job_name"],
            ),
            new_desc(
                "age_job_artifact_size_bytes",
                "Job artifact size in bytes.",
                &["project", "ref", "stage", "job_name"],
            ),
        ];
        descs.extend(scrape_descs());

        Self {
            client,
            config,
            projects: RwLock::new(projects),
            observations: RwLock::new(JobObservations::default()),
            buckets,
            descs,
        }
    }

    async fn collect_project(
        &self,
        cancel: &CancellationToken,
        records: &mut Vec<JobRecord>,
        project: &str,
    ) -> Result<()> {
        let opts = ListPipelinesOptions {
            limit: Some(RECENT_PIPELINES),
            ..Default::default()
        };
        let pipelines = self.client.list_pipelines(cancel, project, &opts).await?;

        for pipeline in pipelines {
            let jobs = match self
                .client
                .list_pipeline_jobs(cancel, project, pipeline.id)
                .await
            {
                Ok(jobs) => jobs,
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) => {
                    warn!(project, pipeline = pipeline.id, error = %err, "failed to list pipeline jobs");
                    continue;
                }
            };

            for job in jobs {
                records.push(record_from_job(
                    project,
                    &job,
                    self.config.include_runner_details,
                ));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Collector for JobsCollector {
    fn name(&self) -> &'static str {
        "jobs"
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
        let mut artifact_size = Vec::new();

        for record in &obs.records {
            let base = vec![
                record.project.clone(),
                record.ref_.clone(),
                record.stage.clone(),
                record.name.clone(),
            ];

            if let Some(value) = record.duration {
                let mut labels = base.clone();
                labels.push(record.runner_type.clone());
                labels.push(record.status.clone());
                duration.push(LabeledValue::new(labels, value));
            }
            if let Some(value) = record.queued_duration {
                queued.push(LabeledValue::new(base.clone(), value));
            }

            let mut status_labels = base.clone();
            status_labels.push(record.status.clone());
            status_labels.push(record.failure_reason.clone());
            status.push(LabeledValue::new(status_labels, 1.0));

            *run_counts.entry(base.clone()).or_default() += 1.0;

            if let Some(value) = record.artifact_size {
                artifact_size.push(LabeledValue::new(base, value));
            }
        }

        let builder = FamilyBuilder::new();
        builder.histograms(
            "age_job_duration_seconds",
            "Job execution duration in seconds.",
            &["project", "ref", "stage", "job_name", "runner_type", "status"],
            &self.buckets,
            &duration,
        );
        builder.histograms(
            "age_job_queued_duration_seconds",
            "Time a job spent queued before execution in seconds.",
            &["project", "ref", "stage", "job_name"],
            &self.buckets,
            &queued,
        );
        builder.gauges(
            "age_job_status",
            "Job status (1 = current status matches label, 0 otherwise).",
            &["project", "ref", "stage", "job_name", "status", "failure_reason"],
            &status,
        );
        builder.counters(
            "age_job_run_count",
            "Total job executions.",
            &["project", "ref", "stage", "job_name"],
            &run_counts
                .into_iter()
                .map(|(labels, value)| LabeledValue::new(labels, value))
                .collect::<Vec<_>>(),
        );
        builder.gauges(
            "age_job_artifact_size_bytes",
            "Job artifact size in bytes.",
            &["project", "ref", "stage", "job_name"],
            &artifact_size,
        );
        builder.scrape_metrics(self.name(), obs.scrape_duration, obs.scrape_errors);
        builder.finish()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let started = std::time::Instant::now();
        let projects = snapshot_projects(&self.projects);

        let mut records = Vec::new();
        let mut err_count = 0.0;

        for project in &projects {
            match self.collect_project(cancel, &mut records, project).await {
                Ok(()) => {}
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) => {
                    error!(project, error = %err, "failed to collect jobs");
                    err_count += 1.0;
                }
            }
        }

        let mut obs = write_lock(&self.observations);
        let errors_total = obs.scrape_errors + err_count;
        *obs = JobObservations {
            records,
            scrape_duration: started.elapsed().as_secs_f64(),
            scrape_errors: errors_total,
        };
        drop(obs);

        debug!(projects = projects.len(), errors = err_count, "jobs collection completed");
        Ok(())
    }

    fn set_projects(&self, projects: Vec<String>) {
        *write_lock(&self.projects) = projects;
    }
}

fn record_from_job(project: &str, job: &Job, include_runner_details: bool) -> JobRecord {
    let artifact_size: u64 = job
        .artifacts
        .iter()
        .filter_map(|artifact| artifact.size)
        .sum();

    JobRecord {
        project: project.to_string(),
        ref_: job.ref_.clone(),
        stage: job.stage.clone(),
        name: job.name.clone(),
        runner_type: resolve_runner_type(job, include_runner_details).to_string(),
        status: job.status.clone(),
        failure_reason: job.failure_reason.clone().unwrap_or_default(),
        duration: job.duration.filter(|d| *d > 0.0),
        queued_duration: job.queued_duration.filter(|d| *d > 0.0),
        artifact_size: (artifact_size > 0).then_some(artifact_size as f64),
    }
}

/// Determines the runner type label from the job's runner field.
///
/// The job payload cannot reliably distinguish group-owned from
/// project-owned runners, so every non-shared runner is classified as
/// "project".
fn resolve_runner_type(job: &Job, include_details: bool) -> &'static str {
    let Some(runner) = &job.runner else {
        return "unknown";
    };
    if !include_details || runner.id == 0 {
        return "unknown";
    }
    if runner.is_shared {
        "instance"
    } else {
        "project"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::testutil;
    use crate::config::GitLabConfig;
    use crate::gitlab::types::{Artifact, Runner};

    fn test_collector() -> JobsCollector {
        let gitlab = GitLabConfig {
            token: "t".to_string(),
            ..Default::default()
        };
        let client = Arc::new(GitLabClient::new(&gitlab, None).unwrap());
        JobsCollector::new(
            client,
            JobsCollectorConfig::default(),
            vec!["demo/app".to_string()],
        )
    }

    fn job(name: &str, status: &str, runner: Option<Runner>) -> Job {
        Job {
            id: 1,
            name: name.to_string(),
            stage: "test".to_string(),
            status: status.to_string(),
            ref_: "main".to_string(),
            duration: Some(42.0),
            queued_duration: Some(1.5),
            failure_reason: None,
            runner,
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn test_runner_type_resolution() {
        let shared = job("a", "success", Some(Runner { id: 7, is_shared: true }));
        assert_eq!(resolve_runner_type(&shared, true), "instance");
        // Runner details disabled: always unknown.
        assert_eq!(resolve_runner_type(&shared, false), "unknown");

        let dedicated = job("a", "success", Some(Runner { id: 7, is_shared: false }));
        assert_eq!(resolve_runner_type(&dedicated, true), "project");

        let no_runner = job("a", "success", None);
        assert_eq!(resolve_runner_type(&no_runner, true), "unknown");

        let zero_id = job("a", "success", Some(Runner { id: 0, is_shared: false }));
        assert_eq!(resolve_runner_type(&zero_id, true), "unknown");
    }

    #[test]
    fn test_record_sums_artifact_sizes() {
        let mut j = job("build", "success", None);
        j.artifacts = vec![
            Artifact { size: Some(1000) },
            Artifact { size: Some(24) },
            Artifact { size: None },
        ];
        let record = record_from_job("demo/app", &j, true);
        assert_eq!(record.artifact_size, Some(1024.0));

        let empty = job("build", "success", None);
        assert_eq!(record_from_job("demo/app", &empty, true).artifact_size, None);
    }

    #[test]
    fn test_job_materialization() {
        let collector = test_collector();

        {
            let mut obs = collector.observations.write().unwrap();
            obs.records.push(record_from_job(
                "demo/app",
                &job("build", "success", Some(Runner { id: 1, is_shared: true })),
                true,
            ));
            obs.records.push(record_from_job(
                "demo/app",
                &job("build", "failed", Some(Runner { id: 1, is_shared: true })),
                true,
            ));
        }

        let families = collector.collect();
        let base = [
            ("project", "demo/app"),
            ("ref", "main"),
            ("stage", "test"),
            ("job_name", "build"),
        ];

        assert_eq!(
            testutil::counter_value(&families, "age_job_run_count", &base),
            Some(2.0)
        );

        let success: Vec<(&str, &str)> = base
            .iter()
            .copied()
            .chain([("runner_type", "instance"), ("status", "success")])
            .collect();
        let (count, sum) =
            testutil::histogram_stats(&families, "age_job_duration_seconds", &success).unwrap();
        assert_eq!(count, 1);
        assert!((sum - 42.0).abs() < 1e-9);

        let status: Vec<(&str, &str)> = base
            .iter()
            .copied()
            .chain([("status", "failed"), ("failure_reason", "")])
            .collect();
        assert_eq!(
            testutil::gauge_value(&families, "age_job_status", &status),
            Some(1.0)
        );
    }
}
