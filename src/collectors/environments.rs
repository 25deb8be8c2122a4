use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::EnvironmentsCollectorConfig;
use crate::error::{ExporterError, Result};
use crate::gitlab::types::{Deployment, Environment};
use crate::gitlab::GitLabClient;

use super::{
    new_desc, read_lock, scrape_descs, snapshot_projects, write_lock, Collector, FamilyBuilder,
    LabeledValue,
};

/// How many recent deployments to examine per environment and cycle.
const RECENT_DEPLOYMENTS: usize = 10;

const ENV_LABELS: [&str; 2] = ["project", "environment"];

/// Fetches environment and deployment data: environment info, deployment
/// statuses, counts, and durations.
pub struct EnvironmentsCollector {
    client: Arc<GitLabClient>,
    config: EnvironmentsCollectorConfig,
    projects: RwLock<Vec<String>>,
    observations: RwLock<EnvironmentObservations>,
    descs: Vec<Desc>,
}

#[derive(Debug, Clone, Default)]
struct EnvironmentObservations {
    info: Vec<LabeledValue>,
    deploy_status: Vec<LabeledValue>,
    deploy_counts: Vec<LabeledValue>,
    deploy_duration: Vec<LabeledValue>,
    scrape_duration: f64,
    scrape_errors: f64,
}

impl EnvironmentsCollector {
    pub fn new(
        client: Arc<GitLabClient>,
        config: EnvironmentsCollectorConfig,
        projects: Vec<String>,
    ) -> Self {
        let mut descs = vec![
            new_desc(
                "age_environment_info",
                "Informational metric about the environment (always 1).",
                &["project", "environment", "tier"],
            ),
            new_desc(
                "age_environment_deployment_status",
                "Deployment status (1 = current status matches label, 0 otherwise).",
                &["project", "environment", "status"],
            ),
            new_desc(
                "age_environment_deployment_count",
                "Total deployments.",
                &ENV_LABELS,
            ),
            new_desc(
                "age_environment_deployment_duration_seconds",
                "Deployment duration in seconds.",
                &ENV_LABELS,
            ),
        ];
        descs.extend(scrape_descs());

        Self {
            client,
            config,
            projects: RwLock::new(projects),
            observations: RwLock::new(EnvironmentObservations::default()),
            descs,
        }
    }

    async fn collect_project(
        &self,
        cancel: &CancellationToken,
        obs: &mut EnvironmentObservations,
        project: &str,
    ) -> Result<()> {
        let environments = self.client.list_environments(cancel, project).await?;

        for environment in environments {
            if self.config.exclude_stopped && environment.state == "stopped" {
                continue;
            }

            obs.info.push(LabeledValue::new(
                vec![
                    project.to_string(),
                    environment.name.clone(),
                    environment_tier(&environment).to_string(),
                ],
                1.0,
            ));

            let deployments = match self
                .client
                .list_deployments(cancel, project, &environment.name, RECENT_DEPLOYMENTS)
                .await
            {
                Ok(deployments) => deployments,
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) => {
                    warn!(project, environment = %environment.name, error = %err, "failed to list deployments");
                    continue;
                }
            };

            record_deployments(obs, project, &environment.name, &deployments);
        }

        Ok(())
    }
}

fn record_deployments(
    obs: &mut EnvironmentObservations,
    project: &str,
    environment: &str,
    deployments: &[Deployment],
) {
    let mut count = 0.0;
    for deployment in deployments {
        obs.deploy_status.push(LabeledValue::new(
            vec![
                project.to_string(),
                environment.to_string(),
                deployment.status.clone(),
            ],
            1.0,
        ));
        count += 1.0;

        // Duration comes from the deployable (job) record when present.
        if let Some(duration) = deployment
            .deployable
            .as_ref()
            .and_then(|d| d.duration)
            .filter(|d| *d > 0.0)
        {
            obs.deploy_duration.push(LabeledValue::new(
                vec![project.to_string(), environment.to_string()],
                duration,
            ));
        }
    }

    if count > 0.0 {
        obs.deploy_counts.push(LabeledValue::new(
            vec![project.to_string(), environment.to_string()],
            count,
        ));
    }
}

/// The environment tier, falling back to "unknown" when the API omits it.
fn environment_tier(environment: &Environment) -> &str {
    environment
        .tier
        .as_deref()
        .filter(|t| !t.is_empty())
        .unwrap_or("unknown")
}

#[async_trait]
impl Collector for EnvironmentsCollector {
    fn name(&self) -> &'static str {
        "environments"
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
            "age_environment_info",
            "Informational metric about the environment (always 1).",
            &["project", "environment", "tier"],
            &obs.info,
        );
        builder.gauges(
            "age_environment_deployment_status",
            "Deployment status (1 = current status matches label, 0 otherwise).",
            &["project", "environment", "status"],
            &obs.deploy_status,
        );
        builder.counters(
            "age_environment_deployment_count",
            "Total deployments.",
            &ENV_LABELS,
            &obs.deploy_counts,
        );
        builder.histograms(
            "age_environment_deployment_duration_seconds",
            "Deployment duration in seconds.",
            &ENV_LABELS,
            prometheus::DEFAULT_BUCKETS,
            &obs.deploy_duration,
        );
        builder.scrape_metrics(self.name(), obs.scrape_duration, obs.scrape_errors);
        builder.finish()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let started = std::time::Instant::now();
        let projects = snapshot_projects(&self.projects);

        let mut obs = EnvironmentObservations::default();
        let mut err_count = 0.0;

        for project in &projects {
            match self.collect_project(cancel, &mut obs, project).await {
                Ok(()) => {}
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) => {
                    error!(project, error = %err, "failed to collect environments");
                    err_count += 1.0;
                }
            }
        }

        obs.scrape_duration = started.elapsed().as_secs_f64();
        obs.scrape_errors = read_lock(&self.observations).scrape_errors + err_count;
        *write_lock(&self.observations) = obs;

        debug!(projects = projects.len(), errors = err_count, "environments collection completed");
        Ok(())
    }

    fn set_projects(&self, projects: Vec<String>) {
        *write_lock(&self.projects) = projects;
    }
}
