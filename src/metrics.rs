use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

use crate::error::Result;

/// Counters fed by the GitLab client for every outbound API request.
#[derive(Clone)]
pub struct ApiMetrics {
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
}

impl ApiMetrics {
    pub fn new() -> Self {
        let requests_total = IntCounterVec::new(
            Opts::new("age_api_requests_total", "Total GitLab API requests made."),
            &["method", "endpoint", "status_code"],
        )
        .expect("valid metric definition");

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "age_api_request_duration_seconds",
                "Duration of GitLab API requests.",
            ),
            &["method", "endpoint"],
        )
        .expect("valid metric definition");

        Self {
            requests_total,
            request_duration,
        }
    }

    /// Record one completed (or failed) API request. A status of zero means
    /// the request never produced an HTTP response.
    pub fn observe(&self, method: &str, endpoint: &str, status: u16, elapsed: Duration) {
        let status_label = if status == 0 {
            "error".to_string()
        } else {
            status.to_string()
        };
        self.requests_total
            .with_label_values(&[method, endpoint, &status_label])
            .inc();
        self.request_duration
            .with_label_values(&[method, endpoint])
            .observe(elapsed.as_secs_f64());
    }
}

impl Default for ApiMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-level operational metrics owned by the orchestrator.
#[derive(Clone)]
pub struct OperationalMetrics {
    pub projects_tracked: IntGauge,
    pub gitlab_tier: IntGauge,
    pub collector_enabled: IntGaugeVec,
    pub api: ApiMetrics,
}

impl OperationalMetrics {
    pub fn new() -> Self {
        let projects_tracked = IntGauge::new(
            "age_projects_tracked",
            "Number of GitLab projects being monitored.",
        )
        .expect("valid metric definition");

        let gitlab_tier = IntGauge::new(
            "age_gitlab_tier",
            "Detected GitLab tier (0=Free, 1=Premium, 2=Ultimate).",
        )
        .expect("valid metric definition");

        let collector_enabled = IntGaugeVec::new(
            Opts::new(
                "age_collector_enabled",
                "Whether a collector is enabled (1) or disabled (0).",
            ),
            &["collector_type"],
        )
        .expect("valid metric definition");

        Self {
            projects_tracked,
            gitlab_tier,
            collector_enabled,
            api: ApiMetrics::new(),
        }
    }

    /// Register every operational metric with the given Prometheus registry.
    pub fn register_on(&self, registry: &Registry) -> Result<()> {
        registry
            .register(Box::new(self.projects_tracked.clone()))
            .map_err(|e| crate::error::ExporterError::Config(e.to_string()))?;
        registry
            .register(Box::new(self.gitlab_tier.clone()))
            .map_err(|e| crate::error::ExporterError::Config(e.to_string()))?;
        registry
            .register(Box::new(self.collector_enabled.clone()))
            .map_err(|e| crate::error::ExporterError::Config(e.to_string()))?;
        registry
            .register(Box::new(self.api.requests_total.clone()))
            .map_err(|e| crate::error::ExporterError::Config(e.to_string()))?;
        registry
            .register(Box::new(self.api.request_duration.clone()))
            .map_err(|e| crate::error::ExporterError::Config(e.to_string()))?;
        Ok(())
    }
}

impl Default for OperationalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_metrics_status_labels() {
        let metrics = ApiMetrics::new();
        metrics.observe("GET", "projects/:id/pipelines", 200, Duration::from_millis(12));
        metrics.observe("GET", "projects/:id/pipelines", 200, Duration::from_millis(8));
        metrics.observe("GET", "projects/:id/pipelines", 0, Duration::from_millis(3));

        let ok = metrics
            .requests_total
            .with_label_values(&["GET", "projects/:id/pipelines", "200"]);
        assert_eq!(ok.get(), 2);

        let errored = metrics
            .requests_total
            .with_label_values(&["GET", "projects/:id/pipelines", "error"]);
        assert_eq!(errored.get(), 1);
    }

    #[test]
    fn test_operational_metrics_register() {
        let registry = Registry::new();
        let metrics = OperationalMetrics::new();
        metrics.register_on(&registry).unwrap();

        metrics.projects_tracked.set(3);
        metrics.gitlab_tier.set(2);
        metrics.collector_enabled.with_label_values(&["dora"]).set(0);

        let families = registry.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"age_projects_tracked"));
        assert!(names.contains(&"age_gitlab_tier"));
        assert!(names.contains(&"age_collector_enabled"));
    }
}
