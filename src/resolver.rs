//! Expands the configured explicit project list and wildcard rules into the
//! deduplicated, ordered set of project paths to monitor.

use indexmap::IndexSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ExporterError, Result};
use crate::gitlab::{GitLabClient, ListProjectsOptions};

/// Resolves the full set of project paths: explicit entries first in
/// declaration order, then wildcard expansions in declaration order.
/// A wildcard that fails to expand is logged and skipped; an empty final set
/// fails startup since there is nothing to monitor.
pub async fn resolve_projects(
    client: &GitLabClient,
    cfg: &Config,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let mut resolved: IndexSet<String> = IndexSet::new();

    for project in &cfg.projects {
        if !project.name.is_empty() {
            resolved.insert(project.name.clone());
        }
    }

    for wildcard in &cfg.wildcards {
        let opts = ListProjectsOptions {
            search: if wildcard.search.is_empty() {
                None
            } else {
                Some(wildcard.search.clone())
            },
            archived: Some(wildcard.archived),
        };

        let listed = match wildcard.owner.kind.as_str() {
            "group" => {
                client
                    .list_group_projects(
                        cancel,
                        &wildcard.owner.name,
                        wildcard.owner.include_subgroups,
                        &opts,
                    )
                    .await
            }
            "user" => {
                client
                    .list_user_projects(cancel, &wildcard.owner.name, &opts)
                    .await
            }
            other => {
                warn!(owner = %wildcard.owner.name, kind = other, "unknown wildcard owner kind, skipping");
                continue;
            }
        };

        match listed {
            Ok(projects) => {
                info!(
                    owner = %wildcard.owner.name,
                    count = projects.len(),
                    "expanded wildcard"
                );
                for project in projects {
                    resolved.insert(project.path_with_namespace);
                }
            }
            Err(err) => {
                warn!(
                    owner = %wildcard.owner.name,
                    error = %err,
                    "failed to expand wildcard, skipping"
                );
            }
        }
    }

    if resolved.is_empty() {
        return Err(ExporterError::Config(
            "no projects configured or discovered".to_string(),
        ));
    }

    Ok(resolved.into_iter().collect())
}

/// Deduplicates project paths preserving first occurrence. Explicit entries
/// come before wildcard expansions.
#[cfg(test)]
fn dedup_preserving_order(paths: impl IntoIterator<Item = String>) -> Vec<String> {
    let set: IndexSet<String> = paths.into_iter().collect();
    set.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_keeps_first_occurrence_order() {
        let merged = dedup_preserving_order(
            [
                "team/api",
                "team/web",
                "team/api",
                "platform/infra",
                "team/web",
            ]
            .into_iter()
            .map(String::from),
        );
        assert_eq!(merged, vec!["team/api", "team/web", "platform/infra"]);
    }

    #[test]
    fn test_dedup_of_empty_input_is_empty() {
        assert!(dedup_preserving_order(Vec::<String>::new()).is_empty());
    }
}
