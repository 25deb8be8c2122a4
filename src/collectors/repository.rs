use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::RepositoryCollectorConfig;
use crate::error::{ExporterError, Result};
use crate::gitlab::{GitLabClient, ListPipelinesOptions};

use super::{
    new_desc, read_lock, scrape_descs, snapshot_projects, write_lock, Collector, FamilyBuilder,
    LabeledValue,
};

/// Gathers repository analytics: language breakdown, repository size and
/// commit count, and the latest finished pipeline's coverage.
pub struct RepositoryCollector {
    client: Arc<GitLabClient>,
    config: RepositoryCollectorConfig,
    projects: RwLock<Vec<String>>,
    observations: RwLock<RepositoryObservations>,
    descs: Vec<Desc>,
}

#[derive(Debug, Clone, Default)]
struct RepositoryObservations {
    language_percentage: Vec<LabeledValue>,
    size_bytes: Vec<LabeledValue>,
    commit_count: Vec<LabeledValue>,
    coverage: Vec<LabeledValue>,
    scrape_duration: f64,
    scrape_errors: f64,
}

impl RepositoryCollector {
    pub fn new(
        client: Arc<GitLabClient>,
        config: RepositoryCollectorConfig,
        projects: Vec<String>,
    ) -> Self {
        let mut descs = vec![
            new_desc(
                "age_repository_language_percentage",
                "Percentage of repository code in a given language.",
                &["project", "language"],
            ),
            new_desc(
                "age_repository_size_bytes",
                "Total repository size in bytes.",
                &["project"],
            ),
            new_desc(
                "age_repository_commit_count",
                "Total number of commits in the repository.",
                &["project", "ref"],
            ),
            new_desc(
                "age_repository_coverage",
                "Latest test coverage percentage for the project.",
                &["project"],
            ),
        ];
        descs.extend(scrape_descs());

        Self {
            client,
            config,
            projects: RwLock::new(projects),
            observations: RwLock::new(RepositoryObservations::default()),
            descs,
        }
    }

    async fn collect_project(
        &self,
        cancel: &CancellationToken,
        obs: &mut RepositoryObservations,
        project: &str,
        err_count: &mut f64,
    ) -> Result<()> {
        match self.client.get_project_languages(cancel, project).await {
            Ok(languages) => {
                for (language, percentage) in languages {
                    obs.language_percentage.push(LabeledValue::new(
                        vec![project.to_string(), language],
                        percentage,
                    ));
                }
            }
            Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
            Err(err) => {
                error!(project, error = %err, "failed to get repository languages");
                *err_count += 1.0;
            }
        }

        match self.client.get_project(cancel, project, true).await {
            Ok(detail) => {
                if let Some(statistics) = detail.statistics {
                    obs.size_bytes.push(LabeledValue::new(
                        vec![project.to_string()],
                        statistics.repository_size as f64,
                    ));
                    obs.commit_count.push(LabeledValue::new(
                        vec![
                            project.to_string(),
                            detail.default_branch.unwrap_or_default(),
                        ],
                        statistics.commit_count as f64,
                    ));
                }
            }
            Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
            Err(err) => {
                error!(project, error = %err, "failed to get project statistics");
                *err_count += 1.0;
            }
        }

        if let Some(coverage) = self.latest_coverage(cancel, project).await? {
            obs.coverage
                .push(LabeledValue::new(vec![project.to_string()], coverage));
        }

        Ok(())
    }

    /// Coverage of the most recent finished pipeline. List entries lack the
    /// coverage field, so the full pipeline record is fetched.
    async fn latest_coverage(
        &self,
        cancel: &CancellationToken,
        project: &str,
    ) -> Result<Option<f64>> {
        let opts = ListPipelinesOptions {
            limit: Some(1),
            scope: Some("finished".to_string()),
            order_by: Some("updated_at".to_string()),
            sort: Some("desc".to_string()),
            ..Default::default()
        };

        let pipelines = match self.client.list_pipelines(cancel, project, &opts).await {
            Ok(pipelines) => pipelines,
            Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
            Err(err) => {
                warn!(project, error = %err, "failed to get latest pipeline for coverage");
                return Ok(None);
            }
        };

        let Some(latest) = pipelines.first() else {
            return Ok(None);
        };

        match self.client.get_pipeline(cancel, project, latest.id).await {
            Ok(pipeline) => Ok(pipeline
                .coverage
                .as_deref()
                .and_then(|raw| raw.trim().parse().ok())),
            Err(ExporterError::Cancelled) => Err(ExporterError::Cancelled),
            Err(err) => {
                warn!(project, pipeline = latest.id, error = %err, "failed to fetch pipeline for coverage");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Collector for RepositoryCollector {
    fn name(&self) -> &'static str {
        "repository"
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
            "age_repository_language_percentage",
            "Percentage of repository code in a given language.",
            &["project", "language"],
            &obs.language_percentage,
        );
        builder.gauges(
            "age_repository_size_bytes",
            "Total repository size in bytes.",
            &["project"],
            &obs.size_bytes,
        );
        builder.gauges(
            "age_repository_commit_count",
            "Total number of commits in the repository.",
            &["project", "ref"],
            &obs.commit_count,
        );
        builder.gauges(
            "age_repository_coverage",
            "Latest test coverage percentage for the project.",
            &["project"],
            &obs.coverage,
        );
        builder.scrape_metrics(self.name(), obs.scrape_duration, obs.scrape_errors);
        builder.finish()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let started = std::time::Instant::now();
        let projects = snapshot_projects(&self.projects);

        let mut obs = RepositoryObservations::default();
        let mut err_count = 0.0;

        for project in &projects {
            if cancel.is_cancelled() {
                return Err(ExporterError::Cancelled);
            }
            match self
                .collect_project(cancel, &mut obs, project, &mut err_count)
                .await
            {
                Ok(()) => {}
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) => {
                    error!(project, error = %err, "failed to collect repository metrics");
                    err_count += 1.0;
                }
            }
        }

        obs.scrape_duration = started.elapsed().as_secs_f64();
        obs.scrape_errors = read_lock(&self.observations).scrape_errors + err_count;
        *write_lock(&self.observations) = obs;

        debug!(projects = projects.len(), errors = err_count, "repository collection completed");
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

    fn test_collector() -> RepositoryCollector {
        let gitlab = GitLabConfig {
            token: "t".to_string(),
            ..Default::default()
        };
        let client = Arc::new(GitLabClient::new(&gitlab, None).unwrap());
        RepositoryCollector::new(
            client,
            RepositoryCollectorConfig::default(),
            vec!["demo/app".to_string()],
        )
    }

    #[test]
    fn test_collect_materializes_families() {
        let collector = test_collector();
        {
            let mut obs = collector.observations.write().unwrap();
            obs.language_percentage.push(LabeledValue::new(
                vec!["demo/app".to_string(), "Rust".to_string()],
                92.4,
            ));
            obs.language_percentage.push(LabeledValue::new(
                vec!["demo/app".to_string(), "Shell".to_string()],
                7.6,
            ));
            obs.size_bytes
                .push(LabeledValue::new(vec!["demo/app".to_string()], 123456.0));
            obs.commit_count.push(LabeledValue::new(
                vec!["demo/app".to_string(), "main".to_string()],
                420.0,
            ));
            obs.coverage
                .push(LabeledValue::new(vec!["demo/app".to_string()], 87.5));
        }

        let families = collector.collect();
        assert_eq!(
            testutil::gauge_value(
                &families,
                "age_repository_language_percentage",
                &[("project", "demo/app"), ("language", "Rust")]
            ),
            Some(92.4)
        );
        assert_eq!(
            testutil::gauge_value(&families, "age_repository_size_bytes", &[("project", "demo/app")]),
            Some(123456.0)
        );
        assert_eq!(
            testutil::gauge_value(
                &families,
                "age_repository_commit_count",
                &[("project", "demo/app"), ("ref", "main")]
            ),
            Some(420.0)
        );
        assert_eq!(
            testutil::gauge_value(&families, "age_repository_coverage", &[("project", "demo/app")]),
            Some(87.5)
        );
    }

    #[test]
    fn test_empty_observations_emit_only_scrape_metrics() {
        let collector = test_collector();
        let families = collector.collect();
        assert!(testutil::family(&families, "age_repository_coverage").is_none());
        assert!(testutil::family(&families, "age_scrape_duration_seconds").is_some());
    }
}
