use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::MergeRequestsCollectorConfig;
use crate::error::{ExporterError, Result};
use crate::gitlab::types::MergeRequest;
use crate::gitlab::{GitLabClient, ListMergeRequestsOptions};
use crate::store::{last_updated_key, Store};

use super::{
    new_desc, read_lock, scrape_descs, snapshot_projects, write_lock, Collector, FamilyBuilder,
    LabeledValue,
};

/// How many recently-updated MRs to fetch per project and cycle.
const RECENT_MRS: usize = 100;

/// Upper bound on MR records retained per project.
const MAX_RECORDS: usize = 1000;

/// Fallback buckets for the time-based MR histograms (1 minute to 1 week).
const DEFAULT_TIME_BUCKETS: [f64; 12] = [
    60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0, 43200.0, 86400.0, 172800.0,
    604800.0,
];

const BRANCH_LABELS: [&str; 2] = ["project", "target_branch"];
const STATUS_LABELS: [&str; 3] = ["project", "target_branch", "state"];

/// Gathers merge-request analytics: time to merge, review approximations,
/// state counts and throughput.
///
/// Time-to-first-review and review-cycles are arithmetic approximations over
/// `user_notes_count`; exact values would require a discussions call per MR.
pub struct MergeRequestsCollector {
    client: Arc<GitLabClient>,
    config: MergeRequestsCollectorConfig,
    store: Arc<dyn Store>,
    projects: RwLock<Vec<String>>,
    observations: RwLock<MergeRequestObservations>,
    buckets: Vec<f64>,
    descs: Vec<Desc>,
}

/// One tracked merge request, keyed by IID per project and retained across
/// cycles so incremental fetches merge.
#[derive(Debug, Clone)]
struct MergeRequestRecord {
    target_branch: String,
    state: String,
    created_at: Option<DateTime<Utc>>,
    merged_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    user_notes_count: i64,
    changes_count: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct MergeRequestObservations {
    records: HashMap<String, BTreeMap<i64, MergeRequestRecord>>,

    time_to_merge: Vec<LabeledValue>,
    time_to_first_review: Vec<LabeledValue>,
    review_cycles: Vec<LabeledValue>,
    changes_count: Vec<LabeledValue>,
    notes_count: Vec<LabeledValue>,
    open_duration: Vec<LabeledValue>,
    status: Vec<LabeledValue>,
    throughput: Vec<LabeledValue>,

    scrape_duration: f64,
    scrape_errors: f64,
}

impl MergeRequestsCollector {
    pub fn new(
        client: Arc<GitLabClient>,
        config: MergeRequestsCollectorConfig,
        store: Arc<dyn Store>,
        projects: Vec<String>,
    ) -> Self {
        let buckets = if config.histogram_buckets.is_empty() {
            DEFAULT_TIME_BUCKETS.to_vec()
        } else {
            config.histogram_buckets.clone()
        };

        let mut descs = vec![
            new_desc(
                "age_mr_time_to_merge_seconds",
                "Time from MR creation to merge in seconds.",
                &BRANCH_LABELS,
            ),
            new_desc(
                "age_mr_time_to_first_review_seconds",
                "Time from MR creation to first review activity in seconds.",
                &BRANCH_LABELS,
            ),
            new_desc(
                "age_mr_review_cycles_count",
                "Number of review cycles per merge request.",
                &BRANCH_LABELS,
            ),
            new_desc(
                "age_mr_changes_count",
                "Number of changes (files changed) per merge request.",
                &BRANCH_LABELS,
            ),
            new_desc(
                "age_mr_notes_count",
                "Number of notes (comments) per merge request.",
                &BRANCH_LABELS,
            ),
            new_desc(
                "age_mr_open_duration_seconds",
                "Duration a merge request has been or was open in seconds.",
                &BRANCH_LABELS,
            ),
            new_desc(
                "age_mr_status",
                "Current state of merge requests (1 = active).",
                &STATUS_LABELS,
            ),
            new_desc(
                "age_mr_throughput_count",
                "Total number of merge requests merged.",
                &BRANCH_LABELS,
            ),
        ];
        descs.extend(scrape_descs());

        Self {
            client,
            config,
            store,
            projects: RwLock::new(projects),
            observations: RwLock::new(MergeRequestObservations::default()),
            buckets,
            descs,
        }
    }

    async fn collect_project(
        &self,
        cancel: &CancellationToken,
        records: &mut HashMap<String, BTreeMap<i64, MergeRequestRecord>>,
        project: &str,
    ) -> Result<()> {
        let store_key = last_updated_key(project, "merge_requests");
        let updated_after = match self.store.get_last_updated(&store_key).await {
            Ok(at) => at,
            Err(err) => {
                warn!(project, error = %err, "failed to read last-updated state, fetching all");
                None
            }
        };
        let cycle_started = Utc::now();

        let opts = ListMergeRequestsOptions {
            limit: Some(RECENT_MRS),
            state: Some("all".to_string()),
            order_by: Some("updated_at".to_string()),
            sort: Some("desc".to_string()),
            updated_after,
        };
        let mrs = self.client.list_merge_requests(cancel, project, &opts).await?;

        let project_records = records.entry(project.to_string()).or_default();
        for mr in mrs {
            project_records.insert(mr.iid, record_from_mr(&mr));
        }
        while project_records.len() > MAX_RECORDS {
            project_records.pop_first();
        }

        if let Err(err) = self.store.set_last_updated(&store_key, cycle_started).await {
            warn!(project, error = %err, "failed to persist last-updated state");
        }

        Ok(())
    }
}

#[async_trait]
impl Collector for MergeRequestsCollector {
    fn name(&self) -> &'static str {
        "merge_requests"
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
            "age_mr_time_to_merge_seconds",
            "Time from MR creation to merge in seconds.",
            &BRANCH_LABELS,
            &self.buckets,
            &obs.time_to_merge,
        );
        builder.histograms(
            "age_mr_time_to_first_review_seconds",
            "Time from MR creation to first review activity in seconds.",
            &BRANCH_LABELS,
            &self.buckets,
            &obs.time_to_first_review,
        );
        builder.histograms(
            "age_mr_review_cycles_count",
            "Number of review cycles per merge request.",
            &BRANCH_LABELS,
            prometheus::DEFAULT_BUCKETS,
            &obs.review_cycles,
        );
        builder.histograms(
            "age_mr_changes_count",
            "Number of changes (files changed) per merge request.",
            &BRANCH_LABELS,
            prometheus::DEFAULT_BUCKETS,
            &obs.changes_count,
        );
        builder.histograms(
            "age_mr_notes_count",
            "Number of notes (comments) per merge request.",
            &BRANCH_LABELS,
            prometheus::DEFAULT_BUCKETS,
            &obs.notes_count,
        );
        builder.histograms(
            "age_mr_open_duration_seconds",
            "Duration a merge request has been or was open in seconds.",
            &BRANCH_LABELS,
            &self.buckets,
            &obs.open_duration,
        );
        builder.gauges(
            "age_mr_status",
            "Current state of merge requests (1 = active).",
            &STATUS_LABELS,
            &obs.status,
        );
        builder.counters(
            "age_mr_throughput_count",
            "Total number of merge requests merged.",
            &BRANCH_LABELS,
            &obs.throughput,
        );
        builder.scrape_metrics(self.name(), obs.scrape_duration, obs.scrape_errors);
        builder.finish()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let started = std::time::Instant::now();
        let projects = snapshot_projects(&self.projects);

        let mut records = read_lock(&self.observations).records.clone();
        let mut err_count = 0.0;

        for project in &projects {
            match self.collect_project(cancel, &mut records, project).await {
                Ok(()) => {}
                Err(ExporterError::Cancelled) => return Err(ExporterError::Cancelled),
                Err(err) => {
                    error!(project, error = %err, "failed to list merge requests");
                    err_count += 1.0;
                }
            }
        }

        let mut obs = derive_observations(records, Utc::now());
        obs.scrape_duration = started.elapsed().as_secs_f64();
        obs.scrape_errors = read_lock(&self.observations).scrape_errors + err_count;
        *write_lock(&self.observations) = obs;

        debug!(projects = projects.len(), errors = err_count, "merge_requests collection completed");
        Ok(())
    }

    fn set_projects(&self, projects: Vec<String>) {
        *write_lock(&self.projects) = projects;
    }
}

fn record_from_mr(mr: &MergeRequest) -> MergeRequestRecord {
    MergeRequestRecord {
        target_branch: mr.target_branch.clone(),
        state: mr.state.clone(),
        created_at: mr.created_at,
        merged_at: mr.merged_at,
        closed_at: mr.closed_at,
        user_notes_count: mr.user_notes_count,
        changes_count: mr.changes_count.clone(),
    }
}

/// Derives every MR metric observation from the tracked record set.
///
/// The derivation rules are contracts:
///   time_to_merge      = merged_at - created_at (merged MRs)
///   open_duration      = merged: time_to_merge; closed: closed_at -
///                        created_at; opened: now - created_at
///   time_to_first_review ~= (end_time - created_at) / (notes + 1),
///                        emitted only when notes > 0
///   review_cycles      ~= (notes + 1) / 2, integer division
fn derive_observations(
    records: HashMap<String, BTreeMap<i64, MergeRequestRecord>>,
    now: DateTime<Utc>,
) -> MergeRequestObservations {
    let mut obs = MergeRequestObservations::default();

    for (project, project_records) in &records {
        let mut throughput: HashMap<String, f64> = HashMap::new();
        let mut status_counts: HashMap<(String, String), f64> = HashMap::new();

        for record in project_records.values() {
            let labels = vec![project.clone(), record.target_branch.clone()];

            *status_counts
                .entry((record.target_branch.clone(), record.state.clone()))
                .or_default() += 1.0;

            obs.notes_count
                .push(LabeledValue::new(labels.clone(), record.user_notes_count as f64));

            if let Some(changes) = record
                .changes_count
                .as_deref()
                .and_then(parse_changes_count)
            {
                obs.changes_count.push(LabeledValue::new(labels.clone(), changes));
            }

            match record.state.as_str() {
                "merged" => {
                    if let (Some(merged_at), Some(created_at)) =
                        (record.merged_at, record.created_at)
                    {
                        let ttm = (merged_at - created_at).num_seconds() as f64;
                        obs.time_to_merge.push(LabeledValue::new(labels.clone(), ttm));
                        obs.open_duration.push(LabeledValue::new(labels.clone(), ttm));
                    }
                    *throughput.entry(record.target_branch.clone()).or_default() += 1.0;
                }
                "closed" => {
                    if let (Some(closed_at), Some(created_at)) =
                        (record.closed_at, record.created_at)
                    {
                        let open = (closed_at - created_at).num_seconds() as f64;
                        obs.open_duration.push(LabeledValue::new(labels.clone(), open));
                    }
                }
                "opened" => {
                    if let Some(created_at) = record.created_at {
                        let open = (now - created_at).num_seconds() as f64;
                        obs.open_duration.push(LabeledValue::new(labels.clone(), open));
                    }
                }
                _ => {}
            }

            if record.user_notes_count > 0 {
                if let Some(created_at) = record.created_at {
                    let end_time = record.merged_at.or(record.closed_at).unwrap_or(now);
                    let total = (end_time - created_at).num_seconds() as f64;
                    let approx_first = total / (record.user_notes_count as f64 + 1.0);
                    obs.time_to_first_review
                        .push(LabeledValue::new(labels.clone(), approx_first));
                }

                let cycles = ((record.user_notes_count + 1) / 2) as f64;
                obs.review_cycles.push(LabeledValue::new(labels, cycles));
            }
        }

        for ((branch, state), count) in status_counts {
            obs.status.push(LabeledValue::new(
                vec![project.clone(), branch, state],
                count,
            ));
        }
        for (branch, count) in throughput {
            obs.throughput
                .push(LabeledValue::new(vec![project.clone(), branch], count));
        }
    }

    obs.records = records;
    obs
}

/// Parses the leading decimal digits of the API's string-valued changes
/// count, so "500+" yields 500. Returns `None` when no leading digits exist.
fn parse_changes_count(raw: &str) -> Option<f64> {
    let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}
