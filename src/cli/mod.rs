pub mod config_cmd;
pub mod index;
pub mod repos;
pub mod search;
pub mod style;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use rockskip::Service;
use rockskip::config::Config;
use rockskip::git::GitCli;
use rockskip::parser::TreeSitterParser;

/// Loads configuration for the current directory.
pub fn load_config() -> Result<Config> {
    let cwd = std::env::current_dir().context("Cannot determine current directory")?;
    Ok(Config::load(&cwd)?)
}

/// Repositories are identified by their canonical directory path.
pub fn repo_name(path: &str) -> Result<String> {
    let canonical = std::fs::canonicalize(path)
        .with_context(|| format!("Repository directory {path} not found"))?;
    Ok(canonical.to_string_lossy().into_owned())
}

pub fn start_service(config: Config) -> Result<(Service, Arc<GitCli>)> {
    let git = Arc::new(GitCli::new());
    let service = Service::new(config, git.clone(), TreeSitterParser::factory())?;
    Ok((service, git))
}

/// Cancels the returned token on Ctrl-C.
pub fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", style::warn("Interrupted, stopping..."));
            cancel.cancel();
        }
    });
    token
}
