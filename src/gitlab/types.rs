use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Version information reported by `/api/v4/version`.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub revision: Option<String>,
}

/// A GitLab project as returned by the projects API.
#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: i64,
    pub path_with_namespace: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub archived: bool,
    /// Present only when the project was fetched with `statistics=true`.
    #[serde(default)]
    pub statistics: Option<ProjectStatistics>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectStatistics {
    #[serde(default)]
    pub repository_size: u64,
    #[serde(default)]
    pub commit_count: u64,
}

/// A pipeline as it appears in list responses. List entries lack duration,
/// queued duration, and coverage; fetch the full [`Pipeline`] for those.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineInfo {
    pub id: i64,
    #[serde(rename = "ref")]
    pub ref_: String,
    pub status: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Full pipeline details from `GET /projects/:id/pipelines/:pipeline_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    #[serde(default)]
    pub project_id: i64,
    #[serde(rename = "ref")]
    pub ref_: String,
    pub status: String,
    #[serde(default)]
    pub source: Option<String>,
    /// Execution duration in seconds. Absent while the pipeline is running.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub queued_duration: Option<f64>,
    /// Coverage percentage as a string, e.g. "87.5".
    #[serde(default)]
    pub coverage: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A bridge (trigger) job, used to discover downstream pipelines.
#[derive(Debug, Clone, Deserialize)]
pub struct Bridge {
    pub name: String,
    #[serde(default)]
    pub downstream_pipeline: Option<DownstreamPipeline>,
}

/// The pipeline triggered by a bridge job, possibly in another project.
#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamPipeline {
    pub id: i64,
    #[serde(default)]
    pub project_id: i64,
    #[serde(rename = "ref")]
    pub ref_: String,
    pub status: String,
}

/// A job within a pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub stage: String,
    pub status: String,
    #[serde(rename = "ref", default)]
    pub ref_: String,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub queued_duration: Option<f64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub runner: Option<Runner>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Runner {
    pub id: i64,
    #[serde(default)]
    pub is_shared: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    #[serde(default)]
    pub size: Option<u64>,
}

/// A merge request from the project merge requests API.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeRequest {
    pub iid: i64,
    pub state: String,
    pub target_branch: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_notes_count: i64,
    /// String-valued in the API; may carry a "+" suffix, e.g. "500+".
    #[serde(default)]
    pub changes_count: Option<String>,
    #[serde(default)]
    pub reviewers: Vec<User>,
    #[serde(default)]
    pub merged_by: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub username: String,
}

/// A deployment environment.
#[derive(Debug, Clone, Deserialize)]
pub struct Environment {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub tier: Option<String>,
}

/// A deployment into an environment.
#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub status: String,
    #[serde(default)]
    pub deployable: Option<Deployable>,
}

/// The CI job that performed a deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct Deployable {
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Pipeline test report summary.
#[derive(Debug, Clone, Deserialize)]
pub struct TestReport {
    #[serde(default)]
    pub total_time: f64,
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub success_count: i64,
    #[serde(default)]
    pub failed_count: i64,
    #[serde(default)]
    pub skipped_count: i64,
    #[serde(default)]
    pub error_count: i64,
    #[serde(default)]
    pub test_suites: Vec<TestSuite>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestSuite {
    pub name: String,
    #[serde(default)]
    pub total_time: f64,
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub execution_time: f64,
}

/// A commit from the repository commits API.
#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    pub id: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A contributor record from the repository contributors API.
#[derive(Debug, Clone, Deserialize)]
pub struct Contributor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub commits: i64,
    #[serde(default)]
    pub additions: i64,
    #[serde(default)]
    pub deletions: i64,
}

/// A single DORA metric data point. The value is null on days without data.
#[derive(Debug, Clone, Deserialize)]
pub struct DoraPoint {
    pub date: String,
    #[serde(default)]
    pub value: Option<f64>,
}

/// A value stream from Value Stream Analytics.
#[derive(Debug, Clone, Deserialize)]
pub struct ValueStream {
    pub id: i64,
    pub name: String,
}

/// A Value Stream Analytics stage.
#[derive(Debug, Clone, Deserialize)]
pub struct ValueStreamStage {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ValueStreamStage {
    /// Display name, preferring `name` and falling back to `title`.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(self.title.as_deref())
            .unwrap_or("")
    }
}

/// The median duration of a Value Stream Analytics stage, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct StageMedian {
    #[serde(default)]
    pub value: Option<f64>,
}

/// Language breakdown as returned by the project languages API.
pub type Languages = HashMap<String, f64>;
