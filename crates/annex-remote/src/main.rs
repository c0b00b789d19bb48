use std::sync::Arc;

use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use git_annex_remote_nightmarket::helper::BlobRemote;
use git_annex_remote_nightmarket::protocol;

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

#[tokio::main]
async fn main() {
    init_logging();
    if std::env::args().len() != 1 {
        eprintln!("git-annex-remote-nightmarket expected zero arguments");
        std::process::exit(1);
    }
    let remote = Arc::new(BlobRemote::new());
    let stdin = BufReader::new(tokio::io::stdin());
    if let Err(e) = protocol::mainloop(remote, stdin, tokio::io::stdout()).await {
        tracing::error!("git-annex-remote-nightmarket loop error: {e:#}");
        std::process::exit(1);
    }
}
