use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::exporter::Exporter;

#[derive(Parser)]
#[command(name = "amazing-gitlab-exporter")]
#[command(author, version, about = "Prometheus exporter for GitLab CI/CD and analytics metrics", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the exporter
    Run {
        /// Path to the YAML configuration file
        #[arg(short, long, env = "AGE_CONFIG")]
        config: Option<PathBuf>,

        /// GitLab instance URL
        #[arg(long, env = "AGE_GITLAB_URL")]
        gitlab_url: Option<String>,

        /// GitLab personal access token
        #[arg(long, env = "AGE_GITLAB_TOKEN")]
        gitlab_token: Option<String>,

        /// Log level (trace, debug, info, warn, error)
        #[arg(long, env = "AGE_LOG_LEVEL")]
        log_level: Option<String>,

        /// HTTP listen address (e.g. 0.0.0.0:8080)
        #[arg(long, env = "AGE_LISTEN_ADDRESS")]
        listen_address: Option<String>,
    },
    /// Print version information
    Version,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                config,
                gitlab_url,
                gitlab_token,
                log_level,
                listen_address,
            } => {
                let mut cfg = Config::load(config.as_deref())?;
                cfg.apply_env_overrides();

                // CLI flags take precedence over file and environment.
                if let Some(url) = gitlab_url {
                    cfg.gitlab.url = url;
                }
                if let Some(token) = gitlab_token {
                    cfg.gitlab.token = token;
                }
                if let Some(level) = log_level {
                    cfg.log.level = level;
                }
                if let Some(addr) = listen_address {
                    cfg.server.listen_address = addr;
                }

                cfg.validate()?;
                init_tracing(&cfg.log.level, &cfg.log.format);

                info!(version = env!("CARGO_PKG_VERSION"), "starting amazing-gitlab-exporter");

                let mut exporter = Exporter::new(cfg)
                    .await
                    .context("initializing exporter")?;
                exporter.run().await.context("running exporter")?;

                Ok(())
            }
            Commands::Version => {
                println!("amazing-gitlab-exporter {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Initialises the tracing subscriber from the configured level and format.
/// `RUST_LOG` overrides the configured level when set.
fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
