use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::TestReportsCollectorConfig;
use crate::error::{ExporterError, Result};
use crate::gitlab::types::TestReport;
use crate::gitlab::{GitLabClient, ListPipelinesOptions};

use super::{
    new_desc, read_lock, scrape_descs, snapshot_projects, write_lock, Collector, FamilyBuilder,
    LabeledValue,
};

/// How many recent pipelines to check for test reports per project and cycle.
const RECENT_PIPELINES: usize = 10;

const REPORT_LABELS: [&str; 2] = ["project", "ref"];
const SUITE_LABELS: [&str; 3] = ["project", "ref", "suite_name"];
const CASE_LABELS: [&str; 4] = ["project", "ref", "suite", "case_name"];

/// Fetches pipeline test reports and exposes metrics at the report, suite,
/// and (optionally) individual test case level. Case-level series are
/// high-cardinality and gated behind `include_test_cases`.
pub struct TestReportsCollector {
    client: Arc<GitLabClient>,
    config: TestReportsCollectorConfig,
    projects: RwLock<Vec<String>>,
    observations: RwLock<TestReportObservations>,
    descs: Vec<Desc>,
}

#[derive(Debug, Clone, Default)]
struct TestReportObservations {
    total_time: Vec<LabeledValue>,
    total_count: Vec<LabeledValue>,
    success_count: Vec<LabeledValue>,
    failed_count: Vec<LabeledValue>,
    skipped_count: Vec<LabeledValue>,
    error_count: Vec<LabeledValue>,
    suite_duration: Vec<LabeledValue>,
    suite_count: Vec<LabeledValue>,
    case_duration: Vec<LabeledValue>,
    case_status: Vec<LabeledValue>,
    scrape_duration: f64,
    scrape_errors: f64,
}

impl TestReportsCollector {
    pub fn new(
        client: Arc<GitLabClient>,
        config: TestReportsCollectorConfig,
        projects: Vec<String>,
    ) -> Self {
        let mut descs = vec![
            new_desc(
                "age_test_report_total_time_seconds",
                "Total test execution time in seconds.",
                &REPORT_LABELS,
            ),
            new_desc(
                "age_test_report_total_count",
                "Total number of tests in the report.",
                &REPORT_LABELS,
            ),
            new_desc(
                "age_test_report_success_count",
                "Number of successful tests.",
                &REPORT_LABELS,
            ),
            new_desc(
                "age_test_report_failed_count",
                "Number of failed tests.",
                &REPORT_LABELS,
            ),
            new_desc(
                "age_test_report_skipped_count",
                "Number of skipped tests.",
                &REPORT_LABELS,
            ),
            new_desc(
                "age_test_report_error_count",
                "Number of tests with errors.",
                &REPORT_LABELS,
            ),
            new_desc(
                "age_test_suite_duration_seconds",
                "Test suite execution duration in seconds.",
                &SUITE_LABELS,
            ),
            new_desc(
                "age_test_suite_count",
                "Number of tests in a suite.",
                &SUITE_LABELS,
            ),
            new_desc(
                "age_test_case_duration_seconds",
                "Individual test case execution duration in seconds.",
                &CASE_LABELS,
            ),
            new_desc(
                "age_test_case_status",
                "Test case status (1 = current status matches label, 0 otherwise).",
                &["project", "ref", "suite", "case_name", "status"],
            ),
        ];
        descs.extend(scrape_descs());

        Self {
            client,
            config,
            projects: RwLock::new(projects),
            observations: RwLock::new(TestReportObservations::default()),
            descs,
        }
    }

    async fn collect_project(
        &self,
        cancel: &CancellationToken,
        obs: &mut TestReportObservations,
        project: &str,
    ) -> Result<()> {
        let opts = ListPipelinesOptions {
            limit: Some(RECENT_PIPELINES),
            ..Default::default()
        };
        let pipelines = self.client.list_pipelines(cancel, project, &opts).await?;

        for pipeline in pipelines {
            let report = match self
                .client
                .get_pipeline_test_report(cancel, project, pipeline.id)
                .await
            {
                Ok(report) => report,
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) => {
                    debug!(project, pipeline = pipeline.id, error = %err, "no test report for pipeline");
                    continue;
                }
            };

            record_report(
                obs,
                project,
                &pipeline.ref_,
                &report,
                self.config.include_test_cases,
            );
        }

        Ok(())
    }
}

/// Records one pipeline's test report. Report and suite values are gauges
/// keyed by (project, ref); the newest pipeline processed last wins.
fn record_report(
    obs: &mut TestReportObservations,
    project: &str,
    ref_: &str,
    report: &TestReport,
    include_test_cases: bool,
) {
    let labels = vec![project.to_string(), ref_.to_string()];

    obs.total_time
        .push(LabeledValue::new(labels.clone(), report.total_time));
    obs.total_count
        .push(LabeledValue::new(labels.clone(), report.total_count as f64));
    obs.success_count
        .push(LabeledValue::new(labels.clone(), report.success_count as f64));
    obs.failed_count
        .push(LabeledValue::new(labels.clone(), report.failed_count as f64));
    obs.skipped_count
        .push(LabeledValue::new(labels.clone(), report.skipped_count as f64));
    obs.error_count
        .push(LabeledValue::new(labels, report.error_count as f64));

    for suite in &report.test_suites {
        let suite_labels = vec![project.to_string(), ref_.to_string(), suite.name.clone()];
        obs.suite_duration
            .push(LabeledValue::new(suite_labels.clone(), suite.total_time));
        obs.suite_count
            .push(LabeledValue::new(suite_labels, suite.total_count as f64));

        if include_test_cases {
            for case in &suite.test_cases {
                let case_labels = vec![
                    project.to_string(),
                    ref_.to_string(),
                    suite.name.clone(),
                    case.name.clone(),
                ];
                obs.case_duration
                    .push(LabeledValue::new(case_labels.clone(), case.execution_time));

                let mut status_labels = case_labels;
                status_labels.push(case.status.clone());
                obs.case_status.push(LabeledValue::new(status_labels, 1.0));
            }
        }
    }
}

#[async_trait]
impl Collector for TestReportsCollector {
    fn name(&self) -> &'static str {
        "test_reports"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn describe(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let obs = read_lock(&self.observations).clone();

        let builder = FamilyBuilder::new();
        builder.gauges(
            "age_test_report_total_time_seconds",
            "Total test execution time in seconds.",
            &REPORT_LABELS,
            &obs.total_time,
        );
        builder.gauges(
            "age_test_report_total_count",
            "Total number of tests in the report.",
            &REPORT_LABELS,
            &obs.total_count,
        );
        builder.gauges(
            "age_test_report_success_count",
            "Number of successful tests.",
            &REPORT_LABELS,
            &obs.success_count,
        );
        builder.gauges(
            "age_test_report_failed_count",
            "Number of failed tests.",
            &REPORT_LABELS,
            &obs.failed_count,
        );
        builder.gauges(
            "age_test_report_skipped_count",
            "Number of skipped tests.",
            &REPORT_LABELS,
            &obs.skipped_count,
        );
        builder.gauges(
            "age_test_report_error_count",
            "Number of tests with errors.",
            &REPORT_LABELS,
            &obs.error_count,
        );
        builder.gauges(
            "age_test_suite_duration_seconds",
            "Test suite execution duration in seconds.",
            &SUITE_LABELS,
            &obs.suite_duration,
        );
        builder.gauges(
            "age_test_suite_count",
            "Number of tests in a suite.",
            &SUITE_LABELS,
            &obs.suite_count,
        );
        builder.histograms(
            "age_test_case_duration_seconds",
            "Individual test case execution duration in seconds.",
            &CASE_LABELS,
            prometheus::DEFAULT_BUCKETS,
            &obs.case_duration,
        );
        builder.gauges(
            "age_test_case_status",
            "Test case status (1 = current status matches label, 0 otherwise).",
            &["project", "ref", "suite", "case_name", "status"],
            &obs.case_status,
        );
        builder.scrape_metrics(self.name(), obs.scrape_duration, obs.scrape_errors);
        builder.finish()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let started = std::time::Instant::now();
        let projects = snapshot_projects(&self.projects);

        let mut obs = TestReportObservations::default();
        let mut err_count = 0.0;

        for project in &projects {
            match self.collect_project(cancel, &mut obs, project).await {
                Ok(()) => {}
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) => {
                    error!(project, error = %err, "failed to collect test reports");
                    err_count += 1.0;
                }
            }
        }

        obs.scrape_duration = started.elapsed().as_secs_f64();
        obs.scrape_errors = read_lock(&self.observations).scrape_errors + err_count;
        *write_lock(&self.observations) = obs;

        debug!(projects = projects.len(), errors = err_count, "test_reports collection completed");
        Ok(())
    }

    fn set_projects(&self, projects: Vec<String>) {
        *write_lock(&self.projects) = projects;
    }
}
