use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::CodeReviewCollectorConfig;
use crate::error::{ExporterError, Result};
use crate::gitlab::types::MergeRequest;
use crate::gitlab::{GitLabClient, ListMergeRequestsOptions};

use super::{
    new_desc, read_lock, scrape_descs, snapshot_projects, write_lock, Collector, FamilyBuilder,
    LabeledValue,
};

/// How many MRs to examine per state, project and cycle.
const RECENT_MRS: usize = 100;

/// Buckets for review turnaround (5 minutes to 1 week).
const TURNAROUND_BUCKETS: [f64; 11] = [
    300.0, 600.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0, 43200.0, 86400.0, 172800.0, 604800.0,
];

const REVIEWER_LABELS: [&str; 2] = ["project", "reviewer"];

/// Gathers code review analytics (Premium tier): pending reviews, review
/// requests, approvals, and a turnaround approximation.
///
/// Turnaround uses the same `user_notes_count` arithmetic as the MR
/// collector's time-to-first-review and credits the first listed reviewer.
pub struct CodeReviewCollector {
    client: Arc<GitLabClient>,
    config: CodeReviewCollectorConfig,
    projects: RwLock<Vec<String>>,
    observations: RwLock<CodeReviewObservations>,
    descs: Vec<Desc>,
}

#[derive(Debug, Clone, Default)]
struct CodeReviewObservations {
    turnaround: Vec<LabeledValue>,
    approval_count: Vec<LabeledValue>,
    pending_count: Vec<LabeledValue>,
    requested_count: Vec<LabeledValue>,
    scrape_duration: f64,
    scrape_errors: f64,
}

impl CodeReviewCollector {
    pub fn new(
        client: Arc<GitLabClient>,
        config: CodeReviewCollectorConfig,
        projects: Vec<String>,
    ) -> Self {
        let mut descs = vec![
            new_desc(
                "age_review_turnaround_seconds",
                "Time taken for a reviewer to provide a review in seconds.",
                &REVIEWER_LABELS,
            ),
            new_desc(
                "age_review_approval_count",
                "Total number of approvals by reviewer.",
                &REVIEWER_LABELS,
            ),
            new_desc(
                "age_review_pending_count",
                "Number of merge requests awaiting review.",
                &["project"],
            ),
            new_desc(
                "age_review_requested_count",
                "Total number of review requests received by reviewer.",
                &REVIEWER_LABELS,
            ),
        ];
        descs.extend(scrape_descs());

        Self {
            client,
            config,
            projects: RwLock::new(projects),
            observations: RwLock::new(CodeReviewObservations::default()),
            descs,
        }
    }

    async fn collect_project(
        &self,
        cancel: &CancellationToken,
        obs: &mut CodeReviewObservations,
        project: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let opened = self
            .client
            .list_merge_requests(cancel, project, &state_opts("opened"))
            .await?;

        let merged = match self
            .client
            .list_merge_requests(cancel, project, &state_opts("merged"))
            .await
        {
            Ok(merged) => merged,
            Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
            Err(err) => {
                error!(project, error = %err, "failed to list merged MRs for code review");
                obs.scrape_errors += 1.0;
                Vec::new()
            }
        };

        record_project(obs, project, &opened, &merged, now);
        Ok(())
    }
}

fn state_opts(state: &str) -> ListMergeRequestsOptions {
    ListMergeRequestsOptions {
        limit: Some(RECENT_MRS),
        state: Some(state.to_string()),
        order_by: Some("updated_at".to_string()),
        sort: Some("desc".to_string()),
        updated_after: None,
    }
}

/// Derives code-review observations for one project from its opened and
/// recently merged MRs.
fn record_project(
    obs: &mut CodeReviewObservations,
    project: &str,
    opened: &[MergeRequest],
    merged: &[MergeRequest],
    now: DateTime<Utc>,
) {
    let mut pending_reviews = 0.0;
    let mut requested: HashMap<String, f64> = HashMap::new();
    let mut approvals: HashMap<String, f64> = HashMap::new();

    for mr in opened {
        // Opened MRs with reviewers assigned are awaiting review.
        if !mr.reviewers.is_empty() {
            pending_reviews += 1.0;
        }
        for reviewer in &mr.reviewers {
            *requested.entry(reviewer.username.clone()).or_default() += 1.0;
        }

        if mr.user_notes_count > 0 {
            if let (Some(created_at), Some(reviewer)) = (mr.created_at, mr.reviewers.first()) {
                let total = (now - created_at).num_seconds() as f64;
                let approx = total / (mr.user_notes_count as f64 + 1.0);
                obs.turnaround.push(LabeledValue::new(
                    vec![project.to_string(), reviewer.username.clone()],
                    approx,
                ));
            }
        }
    }

    for mr in merged {
        // Credit the merger with the approval.
        if let Some(merged_by) = &mr.merged_by {
            *approvals.entry(merged_by.username.clone()).or_default() += 1.0;
        }

        if mr.user_notes_count > 0 {
            if let (Some(merged_at), Some(created_at), Some(reviewer)) =
                (mr.merged_at, mr.created_at, mr.reviewers.first())
            {
                let total = (merged_at - created_at).num_seconds() as f64;
                let approx = total / (mr.user_notes_count as f64 + 1.0);
                obs.turnaround.push(LabeledValue::new(
                    vec![project.to_string(), reviewer.username.clone()],
                    approx,
                ));
            }
        }

        for reviewer in &mr.reviewers {
            *requested.entry(reviewer.username.clone()).or_default() += 1.0;
        }
    }

    obs.pending_count
        .push(LabeledValue::new(vec![project.to_string()], pending_reviews));
    for (reviewer, count) in approvals {
        obs.approval_count
            .push(LabeledValue::new(vec![project.to_string(), reviewer], count));
    }
    for (reviewer, count) in requested {
        obs.requested_count
            .push(LabeledValue::new(vec![project.to_string(), reviewer], count));
    }
}

#[async_trait]
impl Collector for CodeReviewCollector {
    fn name(&self) -> &'static str {
        "code_review"
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
        builder.histograms(
            "age_review_turnaround_seconds",
            "Time taken for a reviewer to provide a review in seconds.",
            &REVIEWER_LABELS,
            &TURNAROUND_BUCKETS,
            &obs.turnaround,
        );
        builder.counters(
            "age_review_approval_count",
            "Total number of approvals by reviewer.",
            &REVIEWER_LABELS,
            &obs.approval_count,
        );
        builder.gauges(
            "age_review_pending_count",
            "Number of merge requests awaiting review.",
            &["project"],
            &obs.pending_count,
        );
        builder.counters(
            "age_review_requested_count",
            "Total number of review requests received by reviewer.",
            &REVIEWER_LABELS,
            &obs.requested_count,
        );
        builder.scrape_metrics(self.name(), obs.scrape_duration, obs.scrape_errors);
        builder.finish()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let started = std::time::Instant::now();

        let has_code_review = self
            .client
            .features()
            .map(|f| f.has_code_review)
            .unwrap_or(false);
        if !has_code_review {
            debug!("code review analytics not available on this GitLab instance, skipping");
            let mut obs = write_lock(&self.observations);
            let errors = obs.scrape_errors;
            *obs = CodeReviewObservations {
                scrape_duration: started.elapsed().as_secs_f64(),
                scrape_errors: errors,
                ..Default::default()
            };
            return Ok(());
        }

        let projects = snapshot_projects(&self.projects);
        let now = Utc::now();

        let mut obs = CodeReviewObservations::default();
        let mut err_count = 0.0;

        for project in &projects {
            if cancel.is_cancelled() {
                return Err(ExporterError::Cancelled);
            }
            match self.collect_project(cancel, &mut obs, project, now).await {
                Ok(()) => {}
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) => {
                    error!(project, error = %err, "failed to list MRs for code review");
                    err_count += 1.0;
                }
            }
        }

        err_count += obs.scrape_errors;
        obs.scrape_duration = started.elapsed().as_secs_f64();
        obs.scrape_errors = read_lock(&self.observations).scrape_errors + err_count;
        *write_lock(&self.observations) = obs;

        debug!(projects = projects.len(), errors = err_count, "code_review collection completed");
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
    use crate::gitlab::types::User;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn mr(state: &str, reviewers: &[&str], notes: i64) -> MergeRequest {
        MergeRequest {
            iid: 1,
            state: state.to_string(),
            target_branch: "main".to_string(),
            created_at: Some(t0()),
            merged_at: (state == "merged").then(|| t0() + chrono::Duration::seconds(7200)),
            closed_at: None,
            user_notes_count: notes,
            changes_count: None,
            reviewers: reviewers
                .iter()
                .map(|name| User {
                    username: name.to_string(),
                })
                .collect(),
            merged_by: (state == "merged").then(|| User {
                username: "maintainer".to_string(),
            }),
        }
    }

    #[test]
    fn test_pending_and_requested_counts() {
        let mut obs = CodeReviewObservations::default();
        let opened = vec![
            mr("opened", &["alice"], 0),
            mr("opened", &["alice", "bob"], 0),
            mr("opened", &[], 0),
        ];

        record_project(&mut obs, "demo/app", &opened, &[], t0());

        assert_eq!(obs.pending_count[0].value, 2.0);

        let alice = obs
            .requested_count
            .iter()
            .find(|v| v.labels[1] == "alice")
            .unwrap();
        assert_eq!(alice.value, 2.0);
        let bob = obs
            .requested_count
            .iter()
            .find(|v| v.labels[1] == "bob")
            .unwrap();
        assert_eq!(bob.value, 1.0);
    }

    #[test]
    fn test_approvals_credit_the_merger() {
        let mut obs = CodeReviewObservations::default();
        let merged = vec![mr("merged", &["alice"], 0), mr("merged", &[], 0)];

        record_project(&mut obs, "demo/app", &[], &merged, t0());

        assert_eq!(obs.approval_count.len(), 1);
        assert_eq!(obs.approval_count[0].labels, vec!["demo/app", "maintainer"]);
        assert_eq!(obs.approval_count[0].value, 2.0);
    }

    #[test]
    fn test_turnaround_uses_first_reviewer() {
        let mut obs = CodeReviewObservations::default();
        // Merged 7200s after creation with 3 notes: 7200 / 4 = 1800.
        let merged = vec![mr("merged", &["alice", "bob"], 3)];

        record_project(&mut obs, "demo/app", &[], &merged, t0());

        assert_eq!(obs.turnaround.len(), 1);
        assert_eq!(obs.turnaround[0].labels, vec!["demo/app", "alice"]);
        assert!((obs.turnaround[0].value - 1800.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_turnaround_without_notes_or_reviewers() {
        let mut obs = CodeReviewObservations::default();
        record_project(
            &mut obs,
            "demo/app",
            &[mr("opened", &["alice"], 0)],
            &[mr("merged", &[], 5)],
            t0(),
        );
        assert!(obs.turnaround.is_empty());
    }

    #[test]
    fn test_collect_materializes_families() {
        let gitlab = GitLabConfig {
            token: "t".to_string(),
            ..Default::default()
        };
        let client = Arc::new(GitLabClient::new(&gitlab, None).unwrap());
        let collector = CodeReviewCollector::new(
            client,
            CodeReviewCollectorConfig::default(),
            vec!["demo/app".to_string()],
        );

        {
            let mut obs = collector.observations.write().unwrap();
            record_project(
                &mut obs,
                "demo/app",
                &[mr("opened", &["alice"], 0)],
                &[mr("merged", &["alice"], 3)],
                t0() + chrono::Duration::seconds(3600),
            );
        }

        let families = collector.collect();
        assert_eq!(
            testutil::gauge_value(&families, "age_review_pending_count", &[("project", "demo/app")]),
            Some(1.0)
        );
        assert_eq!(
            testutil::counter_value(
                &families,
                "age_review_approval_count",
                &[("project", "demo/app"), ("reviewer", "maintainer")]
            ),
            Some(1.0)
        );
        let (count, _) = testutil::histogram_stats(
            &families,
            "age_review_turnaround_seconds",
            &[("project", "demo/app"), ("reviewer", "alice")],
        )
        .unwrap();
        assert_eq!(count, 1);
    }
}
