//! GitLab API access: REST and GraphQL transports, rate limiting, and tier
//! detection.

pub mod client;
pub mod graphql;
pub mod rate_limiter;
pub mod rest;
pub mod tier;
pub mod types;

pub use client::GitLabClient;
pub use rate_limiter::RateLimiter;
pub use rest::{ListMergeRequestsOptions, ListPipelinesOptions, ListProjectsOptions};
pub use tier::{DetectedFeatures, Tier, TierDetector};
