//! CPU profiling endpoint, mounted under `/debug/pprof/` when enabled.

use std::time::Duration;

use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use pprof::protos::Message;
use serde::Deserialize;
use tracing::error;

/// Sampling frequency in Hz while a profile is being captured.
const SAMPLE_FREQUENCY: i32 = 99;

const MAX_PROFILE_SECONDS: u64 = 60;

#[derive(Debug, Deserialize)]
pub struct ProfileParams {
    /// How long to sample, default 30 seconds, capped at 60.
    pub seconds: Option<u64>,
}

/// Captures a CPU profile and returns it in pprof protobuf format,
/// compatible with `go tool pprof` and friends.
pub async fn handle_profile(Query(params): Query<ProfileParams>) -> Response {
    let seconds = params.seconds.unwrap_or(30).min(MAX_PROFILE_SECONDS);

    let guard = match pprof::ProfilerGuard::new(SAMPLE_FREQUENCY) {
        Ok(guard) => guard,
        Err(err) => {
            error!(error = %err, "failed to start profiler");
            return (StatusCode::INTERNAL_SERVER_ERROR, "profiler unavailable").into_response();
        }
    };

    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let profile = match guard.report().build().and_then(|report| report.pprof()) {
        Ok(profile) => profile,
        Err(err) => {
            error!(error = %err, "failed to build profile");
            return (StatusCode::INTERNAL_SERVER_ERROR, "profile failed").into_response();
        }
    };

    let mut body = Vec::new();
    if let Err(err) = profile.write_to_vec(&mut body) {
        error!(error = %err, "failed to serialize profile");
        return (StatusCode::INTERNAL_SERVER_ERROR, "profile failed").into_response();
    }

    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response()
}
