use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::DoraCollectorConfig;
use crate::error::{ExporterError, Result};
use crate::gitlab::types::DoraPoint;
use crate::gitlab::GitLabClient;

use super::{
    new_desc, read_lock, scrape_descs, snapshot_projects, write_lock, Collector, FamilyBuilder,
    LabeledValue,
};

const ENV_LABELS: [&str; 2] = ["project", "environment_tier"];

const METRIC_KINDS: [&str; 4] = [
    "deployment_frequency",
    "lead_time_for_changes",
    "time_to_restore_service",
    "change_failure_rate",
];

/// Gathers DORA metrics (Ultimate tier). For each project and environment
/// tier, the most recent daily data point of each metric kind becomes a
/// gauge.
pub struct DoraCollector {
    client: Arc<GitLabClient>,
    config: DoraCollectorConfig,
    projects: RwLock<Vec<String>>,
    observations: RwLock<DoraObservations>,
    descs: Vec<Desc>,
}

#[derive(Debug, Clone, Default)]
struct DoraObservations {
    deployment_frequency: Vec<LabeledValue>,
    lead_time_for_changes: Vec<LabeledValue>,
    time_to_restore: Vec<LabeledValue>,
    change_failure_rate: Vec<LabeledValue>,
    scrape_duration: f64,
    scrape_errors: f64,
}

impl DoraCollector {
    pub fn new(
        client: Arc<GitLabClient>,
        config: DoraCollectorConfig,
        projects: Vec<String>,
    ) -> Self {
        let mut descs = vec![
            new_desc(
                "age_dora_deployment_frequency",
                "Number of deployments per day.",
                &ENV_LABELS,
            ),
            new_desc(
                "age_dora_lead_time_for_changes_seconds",
                "Median time from commit to deploy in seconds.",
                &ENV_LABELS,
            ),
            new_desc(
                "age_dora_time_to_restore_service_seconds",
                "Median time to restore service in seconds.",
                &ENV_LABELS,
            ),
            new_desc(
                "age_dora_change_failure_rate",
                "Percentage of deployments causing failures (0-100).",
                &ENV_LABELS,
            ),
        ];
        descs.extend(scrape_descs());

        Self {
            client,
            config,
            projects: RwLock::new(projects),
            observations: RwLock::new(DoraObservations::default()),
            descs,
        }
    }

    fn environment_tiers(&self) -> Vec<String> {
        if self.config.environment_tiers.is_empty() {
            vec!["production".to_string()]
        } else {
            self.config.environment_tiers.clone()
        }
    }
}

#[async_trait]
impl Collector for DoraCollector {
    fn name(&self) -> &'static str {
        "dora"
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
            "age_dora_deployment_frequency",
            "Number of deployments per day.",
            &ENV_LABELS,
            &obs.deployment_frequency,
        );
        builder.gauges(
            "age_dora_lead_time_for_changes_seconds",
            "Median time from commit to deploy in seconds.",
            &ENV_LABELS,
            &obs.lead_time_for_changes,
        );
        builder.gauges(
            "age_dora_time_to_restore_service_seconds",
            "Median time to restore service in seconds.",
            &ENV_LABELS,
            &obs.time_to_restore,
        );
        builder.gauges(
            "age_dora_change_failure_rate",
            "Percentage of deployments causing failures (0-100).",
            &ENV_LABELS,
            &obs.change_failure_rate,
        );
        builder.scrape_metrics(self.name(), obs.scrape_duration, obs.scrape_errors);
        builder.finish()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let started = std::time::Instant::now();

        // Defence in depth: the orchestrator only schedules this collector
        // when the capability is present.
        let has_dora = self.client.features().map(|f| f.has_dora).unwrap_or(false);
        if !has_dora {
            debug!("DORA metrics not available on this GitLab instance, skipping");
            let mut obs = write_lock(&self.observations);
            let errors = obs.scrape_errors;
            *obs = DoraObservations {
                scrape_duration: started.elapsed().as_secs_f64(),
                scrape_errors: errors,
                ..Default::default()
            };
            return Ok(());
        }

        let projects = snapshot_projects(&self.projects);
        let tiers = self.environment_tiers();

        let mut obs = DoraObservations::default();
        let mut err_count = 0.0;

        for project in &projects {
            if cancel.is_cancelled() {
                return Err(ExporterError::Cancelled);
            }

            for tier in &tiers {
                for metric in METRIC_KINDS {
                    let points = match self
                        .client
                        .get_dora_metrics(cancel, project, metric, tier)
                        .await
                    {
                        Ok(points) => points,
                        Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                        Err(err) if err.status() == Some(403) => {
                            // Licence-gated for this specific project; not an
                            // error.
                            debug!(project, metric, "DORA metric not accessible for project");
                            continue;
                        }
                        Err(err) => {
                            error!(project, metric, tier, error = %err, "failed to fetch DORA metric");
                            err_count += 1.0;
                            continue;
                        }
                    };

                    let Some(value) = latest_value(&points) else {
                        continue;
                    };
                    let labeled =
                        LabeledValue::new(vec![project.clone(), tier.clone()], value);

                    match metric {
                        "deployment_frequency" => obs.deployment_frequency.push(labeled),
                        "lead_time_for_changes" => obs.lead_time_for_changes.push(labeled),
                        "time_to_restore_service" => obs.time_to_restore.push(labeled),
                        "change_failure_rate" => obs.change_failure_rate.push(labeled),
                        _ => unreachable!("metric kinds are fixed"),
                    }
                }
            }
        }

        obs.scrape_duration = started.elapsed().as_secs_f64();
        obs.scrape_errors = read_lock(&self.observations).scrape_errors + err_count;
        *write_lock(&self.observations) = obs;

        debug!(projects = projects.len(), errors = err_count, "dora collection completed");
        Ok(())
    }

    fn set_projects(&self, projects: Vec<String>) {
        *write_lock(&self.projects) = projects;
    }
}

/// The value of the most recent data point: the literal last element of the
/// series. A null value counts as zero.
fn latest_value(points: &[DoraPoint]) -> Option<f64> {
    points.last().map(|p| p.value.unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::testutil;
    use crate::config::GitLabConfig;

    fn test_collector(tiers: Vec<String>) -> DoraCollector {
        let gitlab = GitLabConfig {
            token: "t".to_string(),
            ..Default::default()
        };
        let client = Arc::new(GitLabClient::new(&gitlab, None).unwrap());
        DoraCollector::new(
            client,
            DoraCollectorConfig {
                environment_tiers: tiers,
                ..Default::default()
            },
            vec!["demo/app".to_string()],
        )
    }

    fn point(date: &str, value: Option<f64>) -> DoraPoint {
        DoraPoint {
            date: date.to_string(),
            value,
        }
    }

    #[test]
    fn test_latest_value_prefers_most_recent() {
        let points = vec![
            point("2026-01-01", Some(1.0)),
            point("2026-01-02", Some(2.5)),
        ];
        assert_eq!(latest_value(&points), Some(2.5));
    }

    #[test]
    fn test_latest_value_treats_null_as_zero() {
        let points = vec![
            point("2026-01-01", Some(4.0)),
            point("2026-01-02", None),
        ];
        assert_eq!(latest_value(&points), Some(0.0));
        assert_eq!(latest_value(&[point("2026-01-01", None)]), Some(0.0));
        assert_eq!(latest_value(&[]), None);
    }

    #[test]
    fn test_environment_tiers_default_to_production() {
        let collector = test_collector(Vec::new());
        assert_eq!(collector.environment_tiers(), vec!["production"]);

        let collector = test_collector(vec!["staging".to_string()]);
        assert_eq!(collector.environment_tiers(), vec!["staging"]);
    }

    #[test]
    fn test_collect_materializes_gauges() {
        let collector = test_collector(Vec::new());
        {
            let mut obs = collector.observations.write().unwrap();
            obs.deployment_frequency.push(LabeledValue::new(
                vec!["demo/app".to_string(), "production".to_string()],
                3.2,
            ));
            obs.change_failure_rate.push(LabeledValue::new(
                vec!["demo/app".to_string(), "production".to_string()],
                12.5,
            ));
        }

        let families = collector.collect();
        let labels = [("project", "demo/app"), ("environment_tier", "production")];
        assert_eq!(
            testutil::gauge_value(&families, "age_dora_deployment_frequency", &labels),
            Some(3.2)
        );
        assert_eq!(
            testutil::gauge_value(&families, "age_dora_change_failure_rate", &labels),
            Some(12.5)
        );
    }

    /// With no detected features, a run produces no DORA series.
    #[tokio::test]
    async fn test_run_without_capability_emits_nothing() {
        let collector = test_collector(Vec::new());
        let cancel = CancellationToken::new();

        collector.run(&cancel).await.unwrap();

        let families = collector.collect();
        assert!(testutil::family(&families, "age_dora_deployment_frequency").is_none());
        // The scrape metrics are still present.
        assert!(testutil::family(&families, "age_scrape_duration_seconds").is_some());
    }
}
