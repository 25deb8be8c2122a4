//! Typed REST calls against the GitLab v4 API. Pagination is handled by the
//! client's paging helper; every page acquires its own rate-limit token.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

use super::client::{encode_project, GitLabClient};
use super::types::{
    Bridge, Commit, Contributor, Deployment, DoraPoint, Environment, Job, Languages, MergeRequest,
    Pipeline, PipelineInfo, Project, StageMedian, TestReport, ValueStream, ValueStreamStage,
    VersionInfo,
};

/// Filters for listing pipelines.
#[derive(Debug, Clone, Default)]
pub struct ListPipelinesOptions {
    /// Stop after this many pipelines. `None` fetches every page.
    pub limit: Option<usize>,
    /// Only pipelines updated after this instant (incremental fetch).
    pub updated_after: Option<DateTime<Utc>>,
    /// Pipeline scope filter, e.g. "finished".
    pub scope: Option<String>,
    pub order_by: Option<String>,
    pub sort: Option<String>,
}

/// Filters for listing merge requests.
#[derive(Debug, Clone, Default)]
pub struct ListMergeRequestsOptions {
    pub limit: Option<usize>,
    /// MR state filter: "opened", "closed", "merged" or "all".
    pub state: Option<String>,
    pub order_by: Option<String>,
    pub sort: Option<String>,
    pub updated_after: Option<DateTime<Utc>>,
}

/// Filters for listing projects visible to the token.
#[derive(Debug, Clone, Default)]
pub struct ListProjectsOptions {
    pub search: Option<String>,
    pub archived: Option<bool>,
}

impl GitLabClient {
    // ----------------------------------------------------------------------
    // Instance
    // ----------------------------------------------------------------------

    /// `GET /version`. Startup fails when this call fails.
    pub async fn get_version(&self, cancel: &CancellationToken) -> Result<VersionInfo> {
        let (version, _) = self.get_json(cancel, "version", &[]).await?;
        Ok(version)
    }

    // ----------------------------------------------------------------------
    // Projects
    // ----------------------------------------------------------------------

    /// Lists all projects visible to the authenticated user.
    pub async fn list_projects(
        &self,
        cancel: &CancellationToken,
        opts: &ListProjectsOptions,
    ) -> Result<Vec<Project>> {
        let query = project_filter_query(opts);
        self.fetch_paged(cancel, "projects", &query, None).await
    }

    /// Lists the projects owned by a group, optionally including subgroups.
    pub async fn list_group_projects(
        &self,
        cancel: &CancellationToken,
        group: &str,
        include_subgroups: bool,
        opts: &ListProjectsOptions,
    ) -> Result<Vec<Project>> {
        let mut query = project_filter_query(opts);
        if include_subgroups {
            query.push(("include_subgroups", "true".to_string()));
        }
        let path = format!("groups/{}/projects", encode_project(group));
        self.fetch_paged(cancel, &path, &query, None).await
    }

    /// Lists the projects owned by a user.
    pub async fn list_user_projects(
        &self,
        cancel: &CancellationToken,
        user: &str,
        opts: &ListProjectsOptions,
    ) -> Result<Vec<Project>> {
        let query = project_filter_query(opts);
        let path = format!("users/{}/projects", encode_project(user));
        self.fetch_paged(cancel, &path, &query, None).await
    }

    /// Fetches a single project, optionally with statistics (sizes, commit
    /// counts).
    pub async fn get_project(
        &self,
        cancel: &CancellationToken,
        project: &str,
        statistics: bool,
    ) -> Result<Project> {
        let path = format!("projects/{}", encode_project(project));
        let mut query = Vec::new();
        if statistics {
            query.push(("statistics", "true".to_string()));
        }
        let (project, _) = self.get_json(cancel, &path, &query).await?;
        Ok(project)
    }

    // ----------------------------------------------------------------------
    // Pipelines
    // ----------------------------------------------------------------------

    /// Lists pipelines for a project, newest first.
    pub async fn list_pipelines(
        &self,
        cancel: &CancellationToken,
        project: &str,
        opts: &ListPipelinesOptions,
    ) -> Result<Vec<PipelineInfo>> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(updated_after) = opts.updated_after {
            query.push(("updated_after", updated_after.to_rfc3339()));
        }
        if let Some(scope) = &opts.scope {
            query.push(("scope", scope.clone()));
        }
        if let Some(order_by) = &opts.order_by {
            query.push(("order_by", order_by.clone()));
        }
        if let Some(sort) = &opts.sort {
            query.push(("sort", sort.clone()));
        }

        let path = format!("projects/{}/pipelines", encode_project(project));
        self.fetch_paged(cancel, &path, &query, opts.limit).await
    }

    /// Fetches the full details of a single pipeline. List entries lack
    /// duration, queued duration, and coverage.
    pub async fn get_pipeline(
        &self,
        cancel: &CancellationToken,
        project: &str,
        pipeline_id: i64,
    ) -> Result<Pipeline> {
        let path = format!(
            "projects/{}/pipelines/{pipeline_id}",
            encode_project(project)
        );
        let (pipeline, _) = self.get_json(cancel, &path, &[]).await?;
        Ok(pipeline)
    }

    // ----------------------------------------------------------------------
    // Jobs & bridges
    // ----------------------------------------------------------------------

    /// Lists all jobs for a pipeline, paginating automatically.
    pub async fn list_pipeline_jobs(
        &self,
        cancel: &CancellationToken,
        project: &str,
        pipeline_id: i64,
    ) -> Result<Vec<Job>> {
        let path = format!(
            "projects/{}/pipelines/{pipeline_id}/jobs",
            encode_project(project)
        );
        self.fetch_paged(cancel, &path, &[], None).await
    }

    /// Lists all bridge (trigger) jobs for a pipeline. These are used to
    /// discover child/downstream pipelines.
    pub async fn list_pipeline_bridges(
        &self,
        cancel: &CancellationToken,
        project: &str,
        pipeline_id: i64,
    ) -> Result<Vec<Bridge>> {
        let path = format!(
            "projects/{}/pipelines/{pipeline_id}/bridges",
            encode_project(project)
        );
        self.fetch_paged(cancel, &path, &[], None).await
    }

    // ----------------------------------------------------------------------
    // Test reports
    // ----------------------------------------------------------------------

    /// Fetches the test report summary for a pipeline.
    pub async fn get_pipeline_test_report(
        &self,
        cancel: &CancellationToken,
        project: &str,
        pipeline_id: i64,
    ) -> Result<TestReport> {
        let path = format!(
            "projects/{}/pipelines/{pipeline_id}/test_report",
            encode_project(project)
        );
        let (report, _) = self.get_json(cancel, &path, &[]).await?;
        Ok(report)
    }

    // ----------------------------------------------------------------------
    // Merge requests
    // ----------------------------------------------------------------------

    /// Lists merge requests for a project matching the given filters.
    pub async fn list_merge_requests(
        &self,
        cancel: &CancellationToken,
        project: &str,
        opts: &ListMergeRequestsOptions,
    ) -> Result<Vec<MergeRequest>> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(state) = &opts.state {
            query.push(("state", state.clone()));
        }
        if let Some(order_by) = &opts.order_by {
            query.push(("order_by", order_by.clone()));
        }
        if let Some(sort) = &opts.sort {
            query.push(("sort", sort.clone()));
        }
        if let Some(updated_after) = opts.updated_after {
            query.push(("updated_after", updated_after.to_rfc3339()));
        }

        let path = format!("projects/{}/merge_requests", encode_project(project));
        self.fetch_paged(cancel, &path, &query, opts.limit).await
    }

    /// Fetches a single merge request by IID.
    pub async fn get_merge_request(
        &self,
        cancel: &CancellationToken,
        project: &str,
        mr_iid: i64,
    ) -> Result<MergeRequest> {
        let path = format!(
            "projects/{}/merge_requests/{mr_iid}",
            encode_project(project)
        );
        let (mr, _) = self.get_json(cancel, &path, &[]).await?;
        Ok(mr)
    }

    // ----------------------------------------------------------------------
    // Environments & deployments
    // ----------------------------------------------------------------------

    /// Lists all environments for a project.
    pub async fn list_environments(
        &self,
        cancel: &CancellationToken,
        project: &str,
    ) -> Result<Vec<Environment>> {
        let path = format!("projects/{}/environments", encode_project(project));
        self.fetch_paged(cancel, &path, &[], None).await
    }

    /// Lists deployments for an environment, newest first.
    pub async fn list_deployments(
        &self,
        cancel: &CancellationToken,
        project: &str,
        environment: &str,
        limit: usize,
    ) -> Result<Vec<Deployment>> {
        let query = vec![
            ("environment", environment.to_string()),
            ("order_by", "created_at".to_string()),
            ("sort", "desc".to_string()),
        ];
        let path = format!("projects/{}/deployments", encode_project(project));
        self.fetch_paged(cancel, &path, &query, Some(limit)).await
    }

    // ----------------------------------------------------------------------
    // Repository
    // ----------------------------------------------------------------------

    /// Returns the language breakdown for a project as percentages.
    pub async fn get_project_languages(
        &self,
        cancel: &CancellationToken,
        project: &str,
    ) -> Result<Languages> {
        let path = format!("projects/{}/languages", encode_project(project));
        let (languages, _) = self.get_json(cancel, &path, &[]).await?;
        Ok(languages)
    }

    /// Lists commits for a project on the given ref.
    pub async fn list_commits(
        &self,
        cancel: &CancellationToken,
        project: &str,
        ref_name: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Commit>> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(ref_name) = ref_name {
            query.push(("ref_name", ref_name.to_string()));
        }
        let path = format!("projects/{}/repository/commits", encode_project(project));
        self.fetch_paged(cancel, &path, &query, limit).await
    }

    /// Calls the repository contributors endpoint. Returns a 404 API error
    /// for empty repositories.
    pub async fn get_contributors(
        &self,
        cancel: &CancellationToken,
        project: &str,
    ) -> Result<Vec<Contributor>> {
        let path = format!(
            "projects/{}/repository/contributors",
            encode_project(project)
        );
        self.fetch_paged(cancel, &path, &[], None).await
    }

    // ----------------------------------------------------------------------
    // DORA metrics
    // ----------------------------------------------------------------------

    /// Fetches a daily-interval DORA metric series for a project. `metric`
    /// is one of: deployment_frequency, lead_time_for_changes,
    /// time_to_restore_service, change_failure_rate.
    pub async fn get_dora_metrics(
        &self,
        cancel: &CancellationToken,
        project: &str,
        metric: &str,
        environment_tier: &str,
    ) -> Result<Vec<DoraPoint>> {
        let path = format!("projects/{}/dora/metrics", encode_project(project));
        let query = vec![
            ("metric", metric.to_string()),
            ("environment_tier", environment_tier.to_string()),
            ("interval", "daily".to_string()),
        ];
        let (points, _) = self.get_json(cancel, &path, &query).await?;
        Ok(points)
    }

    // ----------------------------------------------------------------------
    // Value Stream Analytics
    // ----------------------------------------------------------------------

    /// Lists the value streams configured for a project.
    pub async fn list_value_streams(
        &self,
        cancel: &CancellationToken,
        project: &str,
    ) -> Result<Vec<ValueStream>> {
        let path = format!(
            "projects/{}/analytics/value_stream_analytics/value_streams",
            encode_project(project)
        );
        let (streams, _) = self.get_json(cancel, &path, &[]).await?;
        Ok(streams)
    }

    /// Lists the stages of a value stream.
    pub async fn list_value_stream_stages(
        &self,
        cancel: &CancellationToken,
        project: &str,
        value_stream_id: i64,
    ) -> Result<Vec<ValueStreamStage>> {
        let path = format!(
            "projects/{}/analytics/value_stream_analytics/value_streams/{value_stream_id}/stages",
            encode_project(project)
        );
        let (stages, _) = self.get_json(cancel, &path, &[]).await?;
        Ok(stages)
    }

    /// Fetches the median duration of a value stream stage.
    pub async fn get_stage_median(
        &self,
        cancel: &CancellationToken,
        project: &str,
        value_stream_id: i64,
        stage_id: i64,
    ) -> Result<StageMedian> {
        let path = format!(
            "projects/{}/analytics/value_stream_analytics/value_streams/{value_stream_id}/stages/{stage_id}/median",
            encode_project(project)
        );
        let (median, _) = self.get_json(cancel, &path, &[]).await?;
        Ok(median)
    }
}

fn project_filter_query(opts: &ListProjectsOptions) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(search) = &opts.search {
        if !search.is_empty() {
            query.push(("search", search.clone()));
        }
    }
    if let Some(archived) = opts.archived {
        query.push(("archived", archived.to_string()));
    }
    query
}
