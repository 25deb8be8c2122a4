use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ValueStreamCollectorConfig;
use crate::error::{ExporterError, Result};
use crate::gitlab::GitLabClient;

use super::{
    new_desc, read_lock, scrape_descs, snapshot_projects, write_lock, Collector, FamilyBuilder,
    LabeledValue,
};

/// Gathers Value Stream Analytics metrics (Premium tier): the median time
/// spent in each stage of the project's default value stream, plus the cycle
/// and lead time as the sum over stages.
///
/// The first value stream returned by the API is assumed to be the default.
pub struct ValueStreamCollector {
    client: Arc<GitLabClient>,
    config: ValueStreamCollectorConfig,
    projects: RwLock<Vec<String>>,
    observations: RwLock<ValueStreamObservations>,
    descs: Vec<Desc>,
}

#[derive(Debug, Clone, Default)]
struct ValueStreamObservations {
    stage_duration: Vec<LabeledValue>,
    cycle_time: Vec<LabeledValue>,
    lead_time: Vec<LabeledValue>,
    scrape_duration: f64,
    scrape_errors: f64,
}

impl ValueStreamCollector {
    pub fn new(
        client: Arc<GitLabClient>,
        config: ValueStreamCollectorConfig,
        projects: Vec<String>,
    ) -> Self {
        let mut descs = vec![
            new_desc(
                "age_value_stream_stage_duration_seconds",
                "Median time spent in a Value Stream Analytics stage in seconds.",
                &["project", "stage_name"],
            ),
            new_desc(
                "age_value_stream_cycle_time_seconds",
                "Total cycle time across all stages in seconds.",
                &["project"],
            ),
            new_desc(
                "age_value_stream_lead_time_seconds",
                "Total lead time from issue to production in seconds.",
                &["project"],
            ),
        ];
        descs.extend(scrape_descs());

        Self {
            client,
            config,
            projects: RwLock::new(projects),
            observations: RwLock::new(ValueStreamObservations::default()),
            descs,
        }
    }

    async fn collect_project(
        &self,
        cancel: &CancellationToken,
        obs: &mut ValueStreamObservations,
        project: &str,
    ) -> Result<()> {
        let streams = match self.client.list_value_streams(cancel, project).await {
            Ok(streams) => streams,
            Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
            Err(err) if matches!(err.status(), Some(403) | Some(404)) => {
                debug!(project, "value stream analytics not accessible for project");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let Some(default_stream) = streams.first() else {
            return Ok(());
        };

        let stages = self
            .client
            .list_value_stream_stages(cancel, project, default_stream.id)
            .await?;

        let mut total_cycle_time = 0.0;
        for stage in &stages {
            let median = match self
                .client
                .get_stage_median(cancel, project, default_stream.id, stage.id)
                .await
            {
                Ok(median) => median,
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) => {
                    warn!(project, stage = stage.display_name(), error = %err, "failed to fetch stage median");
                    continue;
                }
            };

            let duration = median.value.unwrap_or(0.0);
            obs.stage_duration.push(LabeledValue::new(
                vec![project.to_string(), stage.display_name().to_string()],
                duration,
            ));
            total_cycle_time += duration;
        }

        obs.cycle_time
            .push(LabeledValue::new(vec![project.to_string()], total_cycle_time));
        // Lead time mirrors cycle time for the default stream (issue to
        // production).
        obs.lead_time
            .push(LabeledValue::new(vec![project.to_string()], total_cycle_time));

        Ok(())
    }
}

#[async_trait]
impl Collector for ValueStreamCollector {
    fn name(&self) -> &'static str {
        "value_stream"
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
            "age_value_stream_stage_duration_seconds",
            "Median time spent in a Value Stream Analytics stage in seconds.",
            &["project", "stage_name"],
            &obs.stage_duration,
        );
        builder.gauges(
            "age_value_stream_cycle_time_seconds",
            "Total cycle time across all stages in seconds.",
            &["project"],
            &obs.cycle_time,
        );
        builder.gauges(
            "age_value_stream_lead_time_seconds",
            "Total lead time from issue to production in seconds.",
            &["project"],
            &obs.lead_time,
        );
        builder.scrape_metrics(self.name(), obs.scrape_duration, obs.scrape_errors);
        builder.finish()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let started = std::time::Instant::now();

        let has_value_stream = self
            .client
            .features()
            .map(|f| f.has_value_stream)
            .unwrap_or(false);
        if !has_value_stream {
            debug!("value stream analytics not available on this GitLab instance, skipping");
            let mut obs = write_lock(&self.observations);
            let errors = obs.scrape_errors;
            *obs = ValueStreamObservations {
                scrape_duration: started.elapsed().as_secs_f64(),
                scrape_errors: errors,
                ..Default::default()
            };
            return Ok(());
        }

        let projects = snapshot_projects(&self.projects);
        let mut obs = ValueStreamObservations::default();
        let mut err_count = 0.0;

        for project in &projects {
            match self.collect_project(cancel, &mut obs, project).await {
                Ok(()) => {}
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) => {
                    error!(project, error = %err, "failed to collect value stream analytics");
                    err_count += 1.0;
                }
            }
        }

        obs.scrape_duration = started.elapsed().as_secs_f64();
        obs.scrape_errors = read_lock(&self.observations).scrape_errors + err_count;
        *write_lock(&self.observations) = obs;

        debug!(projects = projects.len(), errors = err_count, "value_stream collection completed");
        Ok(())
    }

    fn set_projects(&self, projects: Vec<String>) {
        *write_lock(&self.projects) = projects;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::testutil;
    use crate::config::GitLabConfig;

    fn test_collector() -> ValueStreamCollector {
        let gitlab = GitLabConfig {
            token: "t".to_string(),
            ..Default::default()
        };
        let client = Arc::new(GitLabClient::new(&gitlab, None).unwrap());
        ValueStreamCollector::new(
            client,
            ValueStreamCollectorConfig::default(),
            vec!["demo/app".to_string()],
        )
    }

    #[test]
    fn test_cycle_and_lead_time_are_stage_sums() {
        let collector = test_collector();
        {
            let mut obs = collector.observations.write().unwrap();
            for (stage, duration) in [("issue", 3600.0), ("code", 1800.0), ("review", 600.0)] {
                obs.stage_duration.push(LabeledValue::new(
                    vec!["demo/app".to_string(), stage.to_string()],
                    duration,
                ));
            }
            obs.cycle_time
                .push(LabeledValue::new(vec!["demo/app".to_string()], 6000.0));
            obs.lead_time
                .push(LabeledValue::new(vec!["demo/app".to_string()], 6000.0));
        }

        let families = collector.collect();
        assert_eq!(
            testutil::gauge_value(
                &families,
                "age_value_stream_stage_duration_seconds",
                &[("project", "demo/app"), ("stage_name", "code")]
            ),
            Some(1800.0)
        );
        assert_eq!(
            testutil::gauge_value(
                &families,
                "age_value_stream_cycle_time_seconds",
                &[("project", "demo/app")]
            ),
            Some(6000.0)
        );
        assert_eq!(
            testutil::gauge_value(
                &families,
                "age_value_stream_lead_time_seconds",
                &[("project", "demo/app")]
            ),
            Some(6000.0)
        );
    }

    #[tokio::test]
    async fn test_run_without_capability_emits_nothing() {
        let collector = test_collector();
        collector.run(&CancellationToken::new()).await.unwrap();

        let families = collector.collect();
        assert!(testutil::family(&families, "age_value_stream_cycle_time_seconds").is_none());
    }
}
