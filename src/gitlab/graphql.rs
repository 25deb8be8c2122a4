//! GraphQL batch transport. A single POST to `/api/graphql` fetches a
//! project together with its most recent pipelines, replacing the list
//! round-trip of the REST path when enabled in configuration.

use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{ExporterError, Result};

use super::client::GitLabClient;

const PROJECT_PIPELINES_QUERY: &str = r#"
query($path: ID!, $first: Int!) {
  project(fullPath: $path) {
    id
    fullPath
    pipelines(first: $first) {
      nodes {
        id
        status
        source
        ref
        duration
        queuedDuration
        createdAt
      }
    }
  }
}
"#;

/// A project and its most recent pipelines, fetched in one round trip.
#[derive(Debug, Clone)]
pub struct ProjectWithPipelines {
    pub full_path: String,
    pub pipelines: Vec<GraphQlPipeline>,
}

/// GraphQL representation of a pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQlPipeline {
    /// Global ID, e.g. "gid://gitlab/Ci::Pipeline/123".
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(rename = "ref", default)]
    pub ref_: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub queued_duration: Option<f64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl GraphQlPipeline {
    /// Extracts the numeric pipeline ID from the global ID.
    pub fn numeric_id(&self) -> Option<i64> {
        self.id.rsplit('/').next()?.parse().ok()
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<GraphQlData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlData {
    #[serde(default)]
    project: Option<GraphQlProject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlProject {
    full_path: String,
    #[serde(default)]
    pipelines: Option<PipelineConnection>,
}

#[derive(Debug, Deserialize)]
struct PipelineConnection {
    #[serde(default)]
    nodes: Vec<GraphQlPipeline>,
}

impl GitLabClient {
    /// Fetches a project with its most recent pipelines in a single GraphQL
    /// round trip. `first` bounds the number of pipelines returned.
    pub async fn fetch_project_with_pipelines(
        &self,
        cancel: &CancellationToken,
        project_path: &str,
        first: usize,
    ) -> Result<ProjectWithPipelines> {
        let endpoint = self
            .base_url
            .join("api/graphql")
            .map_err(|e| ExporterError::Config(format!("invalid GraphQL URL: {e}")))?;

        let body = json!({
            "query": PROJECT_PIPELINES_QUERY,
            "variables": {
                "path": project_path,
                "first": first as i64,
            },
        });

        let response = self
            .dispatch(cancel, Method::POST, endpoint, Some(&body))
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExporterError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: GraphQlResponse = response.json().await?;

        if !parsed.errors.is_empty() {
            let messages: Vec<String> = parsed.errors.into_iter().map(|e| e.message).collect();
            return Err(ExporterError::GraphQl(messages.join(", ")));
        }

        let project = parsed
            .data
            .ok_or(ExporterError::NoResponseData)?
            .project
            .ok_or_else(|| ExporterError::GraphQl(format!("project '{project_path}' not found")))?;

        Ok(ProjectWithPipelines {
            full_path: project.full_path,
            pipelines: project.pipelines.map(|p| p.nodes).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_id_from_gid() {
        let pipeline = GraphQlPipeline {
            id: "gid://gitlab/Ci::Pipeline/123".to_string(),
            status: "SUCCESS".to_string(),
            source: None,
            ref_: None,
            duration: None,
            queued_duration: None,
            created_at: None,
        };
        assert_eq!(pipeline.numeric_id(), Some(123));
    }

    #[test]
    fn test_numeric_id_from_plain_id() {
        let pipeline = GraphQlPipeline {
            id: "456".to_string(),
            status: "FAILED".to_string(),
            source: None,
            ref_: None,
            duration: None,
            queued_duration: None,
            created_at: None,
        };
        assert_eq!(pipeline.numeric_id(), Some(456));
    }

    #[test]
    fn test_response_parsing() {
        let payload = r#"{
            "data": {
                "project": {
                    "fullPath": "team/api",
                    "pipelines": {
                        "nodes": [
                            {
                                "id": "gid://gitlab/Ci::Pipeline/100",
                                "status": "SUCCESS",
                                "source": "push",
                                "ref": "main",
                                "duration": 120,
                                "queuedDuration": 3.0,
                                "createdAt": "2026-01-01T00:00:00Z"
                            }
                        ]
                    }
                }
            }
        }"#;

        let parsed: GraphQlResponse = serde_json::from_str(payload).unwrap();
        let project = parsed.data.unwrap().project.unwrap();
        assert_eq!(project.full_path, "team/api");
        let nodes = project.pipelines.unwrap().nodes;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].numeric_id(), Some(100));
        assert_eq!(nodes[0].queued_duration, Some(3.0));
    }

    #[test]
    fn test_error_response_parsing() {
        let payload = r#"{"errors": [{"message": "not found"}, {"message": "denied"}]}"#;
        let parsed: GraphQlResponse = serde_json::from_str(payload).unwrap();
        assert!(parsed.data.is_none());
        assert_eq!(parsed.errors.len(), 2);
    }
}
