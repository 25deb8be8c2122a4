use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ExporterError, Result};

use super::client::GitLabClient;

/// Licensing level of the GitLab instance, derived from feature probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Premium,
    Ultimate,
}

impl Tier {
    /// Numeric encoding used by the `age_gitlab_tier` gauge.
    pub fn as_i64(self) -> i64 {
        match self {
            Tier::Free => 0,
            Tier::Premium => 1,
            Tier::Ultimate => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Tier::Free => "Free",
            Tier::Premium => "Premium",
            Tier::Ultimate => "Ultimate",
        }
    }
}

/// Instance capabilities determined by probing feature-gated endpoints once
/// at startup. Stored on the client so collectors can gate themselves.
#[derive(Debug, Clone)]
pub struct DetectedFeatures {
    pub version: String,
    /// DORA metrics API available (Ultimate tier).
    pub has_dora: bool,
    /// Value Stream Analytics available (Premium+).
    pub has_value_stream: bool,
    /// MR analytics endpoint available (Premium+).
    pub has_mr_analytics: bool,
    /// Code Review Analytics available (Premium+).
    pub has_code_review: bool,
    pub tier: Tier,
}

/// Probes a GitLab instance to discover available features and the effective
/// licence tier.
///
/// Probes use a dummy project id because the existence of the endpoint, not
/// a successful response, is the signal: 403 means licence-gated, most other
/// statuses mean the route exists.
pub struct TierDetector<'a> {
    client: &'a GitLabClient,
}

impl<'a> TierDetector<'a> {
    pub fn new(client: &'a GitLabClient) -> Self {
        Self { client }
    }

    /// Runs detection. Starts with a `/version` call to verify connectivity
    /// (failure here is fatal), then probes tier-specific endpoints.
    pub async fn detect(&self, cancel: &CancellationToken) -> Result<DetectedFeatures> {
        let version = self
            .client
            .get_version(cancel)
            .await
            .map_err(|e| ExporterError::TierDetection(format!("version check failed: {e}")))?;
        info!(version = %version.version, "connected to GitLab instance");

        let has_dora = self.probe_dora(cancel).await;
        if has_dora {
            info!("DORA metrics available (Ultimate tier detected)");
        }

        let has_value_stream = self
            .probe(cancel, "projects/0/analytics/value_stream_analytics/stages", "value_stream")
            .await;
        let has_mr_analytics = self
            .probe(cancel, "projects/0/analytics/merge_request_analytics", "mr_analytics")
            .await;
        let has_code_review = self
            .probe(cancel, "projects/0/analytics/code_review", "code_review")
            .await;

        let tier = derive_tier(has_dora, has_value_stream, has_mr_analytics, has_code_review);
        info!(
            tier = tier.name(),
            dora = has_dora,
            value_stream = has_value_stream,
            mr_analytics = has_mr_analytics,
            code_review = has_code_review,
            "tier detection completed"
        );

        Ok(DetectedFeatures {
            version: version.version,
            has_dora,
            has_value_stream,
            has_mr_analytics,
            has_code_review,
            tier,
        })
    }

    async fn probe_dora(&self, cancel: &CancellationToken) -> bool {
        match self.client.get_raw(cancel, "projects/0/dora/metrics").await {
            Ok((status, _)) => dora_endpoint_available(status),
            Err(err) => {
                debug!(error = %err, "DORA probe: request failed");
                false
            }
        }
    }

    async fn probe(&self, cancel: &CancellationToken, path: &str, label: &str) -> bool {
        match self.client.get_raw(cancel, path).await {
            Ok((status, _)) => endpoint_available(status),
            Err(err) => {
                debug!(probe = label, error = %err, "probe: request failed");
                false
            }
        }
    }
}

/// For the DORA endpoint, a 200/400/404/422 response means the endpoint
/// exists even though the dummy project does not; 403 means licence-gated.
fn dora_endpoint_available(status: u16) -> bool {
    matches!(status, 200 | 400 | 404 | 422)
}

/// For the premium analytics endpoints, any response except 403 means the
/// route exists.
fn endpoint_available(status: u16) -> bool {
    status != 403
}

/// Presence of DORA implies Ultimate; any premium analytics implies Premium.
fn derive_tier(
    has_dora: bool,
    has_value_stream: bool,
    has_mr_analytics: bool,
    has_code_review: bool,
) -> Tier {
    if has_dora {
        Tier::Ultimate
    } else if has_value_stream || has_mr_analytics || has_code_review {
        Tier::Premium
    } else {
        Tier::Free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dora_probe_status_mapping() {
        assert!(dora_endpoint_available(200));
        assert!(dora_endpoint_available(400));
        assert!(dora_endpoint_available(404));
        assert!(dora_endpoint_available(422));
        assert!(!dora_endpoint_available(403));
        assert!(!dora_endpoint_available(500));
    }

    #[test]
    fn test_premium_probe_status_mapping() {
        assert!(endpoint_available(200));
        assert!(endpoint_available(404));
        assert!(endpoint_available(422));
        assert!(!endpoint_available(403));
    }

    #[test]
    fn test_derive_tier() {
        assert_eq!(derive_tier(true, false, false, false), Tier::Ultimate);
        assert_eq!(derive_tier(true, true, true, true), Tier::Ultimate);
        assert_eq!(derive_tier(false, true, false, false), Tier::Premium);
        assert_eq!(derive_tier(false, false, true, false), Tier::Premium);
        assert_eq!(derive_tier(false, false, false, true), Tier::Premium);
        assert_eq!(derive_tier(false, false, false, false), Tier::Free);
    }

    #[test]
    fn test_tier_encoding() {
        assert_eq!(Tier::Free.as_i64(), 0);
        assert_eq!(Tier::Premium.as_i64(), 1);
        assert_eq!(Tier::Ultimate.as_i64(), 2);
        assert_eq!(Tier::Ultimate.name(), "Ultimate");
    }
}
