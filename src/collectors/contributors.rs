use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::ContributorsCollectorConfig;
use crate::error::{ExporterError, Result};
use crate::gitlab::types::Contributor;
use crate::gitlab::GitLabClient;

use super::{
    new_desc, read_lock, scrape_descs, snapshot_projects, write_lock, Collector, FamilyBuilder,
    LabeledValue,
};

const AUTHOR_LABELS: [&str; 2] = ["project", "author"];

/// Gathers contributor analytics: commits, additions, and deletions per
/// author from the repository contributors endpoint.
pub struct ContributorsCollector {
    client: Arc<GitLabClient>,
    config: ContributorsCollectorConfig,
    projects: RwLock<Vec<String>>,
    observations: RwLock<ContributorObservations>,
    descs: Vec<Desc>,
}

#[derive(Debug, Clone, Default)]
struct ContributorObservations {
    commits: Vec<LabeledValue>,
    additions: Vec<LabeledValue>,
    deletions: Vec<LabeledValue>,
    scrape_duration: f64,
    scrape_errors: f64,
}

impl ContributorsCollector {
    pub fn new(
        client: Arc<GitLabClient>,
        config: ContributorsCollectorConfig,
        projects: Vec<String>,
    ) -> Self {
        let mut descs = vec![
            new_desc(
                "age_contributor_commits_count",
                "Total number of commits by contributor.",
                &AUTHOR_LABELS,
            ),
            new_desc(
                "age_contributor_additions",
                "Total number of line additions by contributor.",
                &AUTHOR_LABELS,
            ),
            new_desc(
                "age_contributor_deletions",
                "Total number of line deletions by contributor.",
                &AUTHOR_LABELS,
            ),
        ];
        descs.extend(scrape_descs());

        Self {
            client,
            config,
            projects: RwLock::new(projects),
            observations: RwLock::new(ContributorObservations::default()),
            descs,
        }
    }
}

fn record_contributors(
    obs: &mut ContributorObservations,
    project: &str,
    contributors: &[Contributor],
) {
    for contributor in contributors {
        let author = if contributor.name.is_empty() {
            contributor.email.clone()
        } else {
            contributor.name.clone()
        };
        let labels = vec![project.to_string(), author];

        obs.commits
            .push(LabeledValue::new(labels.clone(), contributor.commits as f64));
        obs.additions
            .push(LabeledValue::new(labels.clone(), contributor.additions as f64));
        obs.deletions
            .push(LabeledValue::new(labels, contributor.deletions as f64));
    }
}

#[async_trait]
impl Collector for ContributorsCollector {
    fn name(&self) -> &'static str {
        "contributors"
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
            "age_contributor_commits_count",
            "Total number of commits by contributor.",
            &AUTHOR_LABELS,
            &obs.commits,
        );
        builder.gauges(
            "age_contributor_additions",
            "Total number of line additions by contributor.",
            &AUTHOR_LABELS,
            &obs.additions,
        );
        builder.gauges(
            "age_contributor_deletions",
            "Total number of line deletions by contributor.",
            &AUTHOR_LABELS,
            &obs.deletions,
        );
        builder.scrape_metrics(self.name(), obs.scrape_duration, obs.scrape_errors);
        builder.finish()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let started = std::time::Instant::now();
        let projects = snapshot_projects(&self.projects);

        let mut obs = ContributorObservations::default();
        let mut err_count = 0.0;

        for project in &projects {
            if cancel.is_cancelled() {
                return Err(ExporterError::Cancelled);
            }

            match self.client.get_contributors(cancel, project).await {
                Ok(contributors) => record_contributors(&mut obs, project, &contributors),
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) if err.status() == Some(404) => {
                    // Empty repositories have no contributors endpoint.
                    debug!(project, "contributors endpoint not found (empty repo?)");
                }
                Err(err) => {
                    error!(project, error = %err, "failed to fetch contributors");
                    err_count += 1.0;
                }
            }
        }

        obs.scrape_duration = started.elapsed().as_secs_f64();
        obs.scrape_errors = read_lock(&self.observations).scrape_errors + err_count;
        *write_lock(&self.observations) = obs;

        debug!(projects = projects.len(), errors = err_count, "contributors collection completed");
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

    fn contributor(name: &str, email: &str, commits: i64) -> Contributor {
        Contributor {
            name: name.to_string(),
            email: email.to_string(),
            commits,
            additions: commits * 10,
            deletions: commits * 2,
        }
    }

    #[test]
    fn test_author_falls_back_to_email() {
        let mut obs = ContributorObservations::default();
        record_contributors(
            &mut obs,
            "demo/app",
            &[
                contributor("Alice", "alice@example.com", 5),
                contributor("", "bot@example.com", 2),
            ],
        );

        assert_eq!(obs.commits[0].labels, vec!["demo/app", "Alice"]);
        assert_eq!(obs.commits[1].labels, vec!["demo/app", "bot@example.com"]);
    }

    #[test]
    fn test_collect_materializes_families() {
        let gitlab = GitLabConfig {
            token: "t".to_string(),
            ..Default::default()
        };
        let client = Arc::new(GitLabClient::new(&gitlab, None).unwrap());
        let collector = ContributorsCollector::new(
            client,
            ContributorsCollectorConfig::default(),
            vec!["demo/app".to_string()],
        );

        {
            let mut obs = collector.observations.write().unwrap();
            record_contributors(&mut obs, "demo/app", &[contributor("Alice", "a@e.com", 5)]);
        }

        let families = collector.collect();
        let labels = [("project", "demo/app"), ("author", "Alice")];
        assert_eq!(
            testutil::gauge_value(&families, "age_contributor_commits_count", &labels),
            Some(5.0)
        );
        assert_eq!(
            testutil::gauge_value(&families, "age_contributor_additions", &labels),
            Some(50.0)
        );
        assert_eq!(
            testutil::gauge_value(&families, "age_contributor_deletions", &labels),
            Some(10.0)
        );
    }
}
