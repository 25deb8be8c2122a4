use std::sync::OnceLock;
use std::time::Duration;

use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::GitLabConfig;
use crate::error::{ExporterError, Result};
use crate::metrics::ApiMetrics;

use super::rate_limiter::RateLimiter;
use super::tier::DetectedFeatures;

const USER_AGENT: &str = concat!("amazing-gitlab-exporter/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Entry point for all GitLab API interactions: a reqwest transport, the
/// process-wide rate limiter, and the detected tier features.
///
/// Every call acquires a rate-limit token before dispatch and feeds the
/// response headers back into the limiter afterwards, success or failure.
pub struct GitLabClient {
    pub(crate) http: reqwest::Client,
    pub(crate) base_url: Url,
    pub(crate) api_url: Url,
    pub(crate) token: String,
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) features: OnceLock<DetectedFeatures>,
    pub(crate) rest_page_size: usize,
    pub(crate) graphql_page_size: usize,
    pub(crate) use_graphql: bool,
    pub(crate) metrics: Option<ApiMetrics>,
}

/// Pagination info extracted from GitLab's response headers.
pub(crate) struct PageInfo {
    pub next_page: Option<u64>,
}

impl GitLabClient {
    /// Creates a client configured against the given GitLab instance.
    pub fn new(cfg: &GitLabConfig, metrics: Option<ApiMetrics>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT);

        if !cfg.enable_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if !cfg.ca_cert_path.is_empty() {
            let pem = std::fs::read(&cfg.ca_cert_path).map_err(|e| {
                ExporterError::Config(format!(
                    "failed to read CA certificate {}: {e}",
                    cfg.ca_cert_path
                ))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ExporterError::Config(format!("invalid CA certificate {}: {e}", cfg.ca_cert_path))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder
            .build()
            .map_err(|e| ExporterError::Config(format!("failed to create HTTP client: {e}")))?;

        let base_url = Url::parse(&cfg.url)
            .map_err(|e| ExporterError::Config(format!("invalid GitLab URL: {e}")))?;
        let api_url = base_url
            .join("api/v4/")
            .map_err(|e| ExporterError::Config(format!("invalid API base URL: {e}")))?;

        Ok(Self {
            http,
            base_url,
            api_url,
            token: cfg.token.clone(),
            rate_limiter: RateLimiter::new(
                cfg.max_requests_per_second,
                cfg.burst_requests_per_second,
            ),
            features: OnceLock::new(),
            rest_page_size: cfg.rest_page_size,
            graphql_page_size: cfg.graphql_page_size,
            use_graphql: cfg.use_graphql,
            metrics,
        })
    }

    /// The rate limiter associated with this client.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Detected tier features, or `None` if detection has not run yet.
    pub fn features(&self) -> Option<&DetectedFeatures> {
        self.features.get()
    }

    /// Stores the detected features so collectors can gate themselves.
    /// Later calls are ignored; detection runs once at startup.
    pub fn set_features(&self, features: DetectedFeatures) {
        let _ = self.features.set(features);
    }

    /// Whether the GraphQL batch transport is enabled in configuration.
    pub fn use_graphql(&self) -> bool {
        self.use_graphql
    }

    /// The configured upper bound on GraphQL page sizes.
    pub fn graphql_page_size(&self) -> usize {
        self.graphql_page_size
    }

    /// Issues a rate-limited request and feeds response headers back to the
    /// limiter. `url` must be absolute (API or GraphQL endpoint).
    pub(crate) async fn dispatch(
        &self,
        cancel: &CancellationToken,
        method: Method,
        url: Url,
        body: Option<&serde_json::Value>,
    ) -> Result<Response> {
        self.rate_limiter.wait(cancel).await?;

        let endpoint = endpoint_label(url.path());
        let started = std::time::Instant::now();

        let mut request = self.http.request(method.clone(), url);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        match request.send().await {
            Ok(response) => {
                self.rate_limiter.update_from_headers(response.headers());
                if let Some(metrics) = &self.metrics {
                    metrics.observe(
                        method.as_str(),
                        &endpoint,
                        response.status().as_u16(),
                        started.elapsed(),
                    );
                }
                Ok(response)
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe(method.as_str(), &endpoint, 0, started.elapsed());
                }
                Err(err.into())
            }
        }
    }

    /// GET a REST path (relative to `/api/v4/`), decoding the JSON body.
    /// Non-2xx responses become [`ExporterError::Api`] carrying the status.
    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<(T, PageInfo)> {
        let url = self.rest_url(path, query)?;
        let response = self.dispatch(cancel, Method::GET, url, None).await?;

        let status = response.status();
        let page_info = PageInfo {
            next_page: next_page(response.headers()),
        };

        if !status.is_success() {
            let message = truncate(&response.text().await.unwrap_or_default(), 256);
            return Err(ExporterError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<T>().await?;
        Ok((body, page_info))
    }

    /// GET a REST path returning only the status code and raw body. Used by
    /// tier probes, where a 403 is a signal rather than an error.
    pub(crate) async fn get_raw(
        &self,
        cancel: &CancellationToken,
        path: &str,
    ) -> Result<(u16, String)> {
        let url = self.rest_url(path, &[])?;
        let response = self.dispatch(cancel, Method::GET, url, None).await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok((status, body))
    }

    /// Repeatedly fetches pages until the server reports no next page or
    /// `limit` items have been collected. Each page is a separate rate-limit
    /// acquisition.
    pub(crate) async fn fetch_paged<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        path: &str,
        base_query: &[(&str, String)],
        limit: Option<usize>,
    ) -> Result<Vec<T>> {
        let per_page = match limit {
            Some(limit) => limit.min(self.rest_page_size).max(1),
            None => self.rest_page_size,
        };

        let mut all: Vec<T> = Vec::new();
        let mut page: u64 = 1;

        loop {
            let mut query: Vec<(&str, String)> = base_query.to_vec();
            query.push(("per_page", per_page.to_string()));
            query.push(("page", page.to_string()));

            let (mut items, info): (Vec<T>, PageInfo) =
                self.get_json(cancel, path, &query).await?;
            all.append(&mut items);

            if let Some(limit) = limit {
                if all.len() >= limit {
                    all.truncate(limit);
                    return Ok(all);
                }
            }

            match info.next_page {
                Some(next) => page = next,
                None => return Ok(all),
            }
        }
    }

    fn rest_url(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self
            .api_url
            .join(path)
            .map_err(|e| ExporterError::Config(format!("invalid API path {path}: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }
}

/// Percent-encodes a project path for use as a single URL segment.
pub(crate) fn encode_project(project: &str) -> String {
    urlencoding::encode(project).into_owned()
}

/// Reduces a request path to a low-cardinality endpoint label by replacing
/// identifier segments with ":id".
fn endpoint_label(path: &str) -> String {
    let path = path.strip_prefix("/api/v4/").unwrap_or(path);
    path.split('/')
        .map(|segment| {
            if segment.chars().all(|c| c.is_ascii_digit()) && !segment.is_empty() {
                ":id"
            } else if segment.contains("%2F") {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn next_page(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get("x-next-page")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GitLabConfig;

    fn test_config() -> GitLabConfig {
        GitLabConfig {
            url: "https://gitlab.example.com".to_string(),
            token: "glpat-test".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_client_builds_api_url() {
        let client = GitLabClient::new(&test_config(), None).unwrap();
        assert_eq!(client.api_url.as_str(), "https://gitlab.example.com/api/v4/");
    }

    #[test]
    fn test_client_rejects_invalid_url() {
        let mut cfg = test_config();
        cfg.url = "not a url".to_string();
        assert!(GitLabClient::new(&cfg, None).is_err());
    }

    #[test]
    fn test_rest_url_with_query() {
        let client = GitLabClient::new(&test_config(), None).unwrap();
        let url = client
            .rest_url(
                "projects/group%2Fapp/pipelines",
                &[("per_page", "10".to_string())],
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://gitlab.example.com/api/v4/projects/group%2Fapp/pipelines?per_page=10"
        );
    }

    #[test]
    fn test_encode_project() {
        assert_eq!(encode_project("group/sub/app"), "group%2Fsub%2Fapp");
        assert_eq!(encode_project("plain"), "plain");
    }

    #[test]
    fn test_endpoint_label_normalizes_identifiers() {
        assert_eq!(
            endpoint_label("/api/v4/projects/group%2Fapp/pipelines/123"),
            "projects/:id/pipelines/:id"
        );
        assert_eq!(
            endpoint_label("/api/v4/projects/42/dora/metrics"),
            "projects/:id/dora/metrics"
        );
        assert_eq!(endpoint_label("/api/v4/version"), "version");
    }

    #[test]
    fn test_next_page_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(next_page(&headers), None);

        headers.insert("x-next-page", "2".parse().unwrap());
        assert_eq!(next_page(&headers), Some(2));

        headers.insert("x-next-page", "".parse().unwrap());
        assert_eq!(next_page(&headers), None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 5), "hello");
        // Multi-byte characters are not split.
        let s = "héllo";
        assert!(truncate(s, 2).len() <= 2);
    }
}
