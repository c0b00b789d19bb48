use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use common::prelude::Clerk;
use git_remote_nightmarket::git::Git;
use git_remote_nightmarket::helper::RefHelper;
use git_remote_nightmarket::protocol;

/// git remote helper for nightmarket:: URLs.
///
/// Invoked by git with the remote name and the address part of the URL
/// (the configuration path).
#[derive(Debug, Parser)]
struct Args {
    remote: String,
    url: String,
}

fn init_logging() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();
    // stdout carries the protocol; all diagnostics go to stderr
    tracing_subscriber::fmt()
        .compact()
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .init();
}

async fn run(args: Args) -> Result<()> {
    // git usually strips the "nightmarket::" prefix before invoking us,
    // but accept the full URL form too
    let config_path = args
        .url
        .strip_prefix("nightmarket::")
        .unwrap_or(&args.url)
        .to_string();
    let clerk = Clerk::load(std::path::Path::new(&config_path))?;

    let git_dir = std::env::var("GIT_DIR").context("no GIT_DIR specified")?;
    let git_dir = PathBuf::from(git_dir);
    std::fs::read_dir(&git_dir).context("cannot access GIT_DIR")?;

    let mut helper = RefHelper::new(clerk, Git::new(), git_dir, args.remote);
    let stdin = BufReader::new(tokio::io::stdin());
    protocol::mainloop(stdin, tokio::io::stdout(), &mut helper).await
}

#[tokio::main]
async fn main() {
    init_logging();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!("nightmarket: {e:#}");
        std::process::exit(1);
    }
}
