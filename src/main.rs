use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::config_cmd::ConfigArgs;
use cli::index::IndexArgs;
use cli::repos::ReposCommands;
use cli::search::SearchCmdArgs;

#[derive(Parser)]
#[command(
    name = "rockskip",
    about = "Versioned symbol index over git history",
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("ROCKSKIP_BUILD_TARGET"),
        ", built ",
        env!("ROCKSKIP_BUILD_DATE"),
        ")"
    )
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a commit and any of its first-parent ancestors not indexed yet
    Index(IndexArgs),
    /// Search symbols at a commit, indexing it first if needed
    Search(SearchCmdArgs),
    /// Manage indexed repositories
    Repos {
        #[command(subcommand)]
        command: ReposCommands,
    },
    /// Inspect configuration (.rockskip.json)
    Config(ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Index(args)) => cli::index::run(args).await,
        Some(Commands::Search(args)) => cli::search::run(args).await,
        Some(Commands::Repos { command }) => cli::repos::run(command).await,
        Some(Commands::Config(args)) => cli::config_cmd::run(args),
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}
