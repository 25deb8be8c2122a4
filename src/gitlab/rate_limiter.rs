use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExporterError, Result};

/// Combines a local token bucket with header-aware backoff derived from
/// GitLab's `RateLimit-Remaining` and `RateLimit-Reset` response headers.
///
/// Safe for concurrent use; every outbound request across all collectors
/// goes through the same instance so the bucket bounds total API load.
pub struct RateLimiter {
    state: Mutex<State>,
}

struct State {
    /// Tokens currently available. Refilled lazily on each acquisition.
    tokens: f64,
    capacity: f64,
    /// Tokens added per second. Zero or below disables local pacing.
    refill_per_second: f64,
    last_refill: Instant,

    /// Last observed RateLimit-Remaining value, -1 when unknown.
    header_remaining: i64,
    /// Last observed RateLimit-Reset value (unix epoch seconds), 0 when unknown.
    header_reset_epoch: i64,

    /// Deadline before which no request may be sent. Only ever extended.
    backoff_until: Option<Instant>,
}

impl RateLimiter {
    /// Creates a rate limiter with the given requests-per-second and burst.
    /// A zero `rps` disables local rate limiting.
    pub fn new(rps: u32, burst: u32) -> Self {
        let burst = burst.max(1);
        Self {
            state: Mutex::new(State {
                tokens: burst as f64,
                capacity: burst as f64,
                refill_per_second: rps as f64,
                last_refill: Instant::now(),
                header_remaining: -1,
                header_reset_epoch: 0,
                backoff_until: None,
            }),
        }
    }

    /// Blocks until the limiter allows one more request, honouring both the
    /// header-derived backoff and the local token bucket. Cancellation during
    /// a sleep returns [`ExporterError::Cancelled`] without consuming a token.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let delay = {
                let mut state = self.state.lock().expect("rate limiter lock");
                state.next_delay(Instant::now())
            };

            let Some(delay) = delay else {
                return Ok(());
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(ExporterError::Cancelled),
            }
        }
    }

    /// Inspects response headers and extends the backoff deadline when the
    /// remote limit is close to exhaustion. Called after every response,
    /// success or failure. Unparseable headers are ignored.
    ///
    /// Recognised headers:
    ///   Retry-After         - seconds to wait (sent on 429 responses)
    ///   RateLimit-Remaining - requests remaining in the current window
    ///   RateLimit-Reset     - unix epoch timestamp when the window resets
    pub fn update_from_headers(&self, headers: &HeaderMap) {
        let mut state = self.state.lock().expect("rate limiter lock");
        let now = Instant::now();

        // Retry-After takes priority: it is the server telling us exactly
        // how long to stay away.
        if let Some(seconds) = header_i64(headers, "retry-after") {
            if seconds > 0 {
                let until = now + Duration::from_secs(seconds as u64);
                if state.extend_backoff(until) {
                    warn!(retry_after_seconds = seconds, "rate limited, backing off");
                }
                return;
            }
        }

        let Some(remaining) = header_i64(headers, "ratelimit-remaining") else {
            return;
        };
        state.header_remaining = remaining;

        let Some(reset_epoch) = header_i64(headers, "ratelimit-reset") else {
            return;
        };
        state.header_reset_epoch = reset_epoch;

        let until_reset = reset_epoch - unix_now();
        if remaining <= 0 {
            // Exhausted: nothing may be sent until the window resets.
            if until_reset > 0 {
                let until = now + Duration::from_secs(until_reset as u64);
                if state.extend_backoff(until) {
                    warn!(
                        reset_in_seconds = until_reset,
                        "remote rate limit exhausted, backing off until reset"
                    );
                }
            }
        } else if remaining < 10 {
            // Nearly exhausted: spread the remaining budget over the window.
            if until_reset > 0 {
                let per_request = (until_reset as f64 / (remaining as f64 + 1.0)).ceil();
                let until = now + Duration::from_secs_f64(per_request);
                if state.extend_backoff(until) {
                    debug!(
                        remaining,
                        delay_seconds = per_request,
                        "remote rate limit nearly exhausted, throttling"
                    );
                }
            }
        }
    }

    /// Last observed `RateLimit-Remaining` value, or -1 if no header has been
    /// seen yet.
    pub fn remaining(&self) -> i64 {
        self.state.lock().expect("rate limiter lock").header_remaining
    }

    /// Unix epoch at which the remote window resets, or 0 when unknown.
    pub fn reset_epoch(&self) -> i64 {
        self.state.lock().expect("rate limiter lock").header_reset_epoch
    }
}

impl State {
    /// Returns how long the caller must sleep before retrying, or `None`
    /// when a token was consumed and the request may proceed.
    fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        if let Some(until) = self.backoff_until {
            if now < until {
                return Some(until - now);
            }
        }

        if self.refill_per_second <= 0.0 {
            return None;
        }

        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 - 1e-9 {
            self.tokens -= 1.0;
            None
        } else {
            let needed = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(needed / self.refill_per_second))
        }
    }

    /// Moves the backoff deadline forward, never backward. Returns true when
    /// the deadline actually changed.
    fn extend_backoff(&mut self, until: Instant) -> bool {
        match self.backoff_until {
            Some(existing) if existing >= until => false,
            _ => {
                self.backoff_until = Some(until);
                true
            }
        }
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
