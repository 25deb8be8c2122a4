use anyhow::Result;
use clap::Parser;

use amazing_gitlab_exporter::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    Cli::parse().execute().await
}
