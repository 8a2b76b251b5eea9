use anyhow::Result;
use clap::Args;

use super::style;

#[derive(Args)]
pub struct IndexArgs {
    /// Path to the git repository
    pub repo: String,
    /// Commit or revision to index
    #[arg(default_value = "HEAD")]
    pub commit: String,
    /// Print statistics as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: IndexArgs) -> Result<()> {
    let repo = super::repo_name(&args.repo)?;
    let (service, git) = super::start_service(super::load_config()?)?;
    let commit = git.resolve_revision(&repo, &args.commit).await?;
    let cancel = super::cancel_on_interrupt();

    let result = service.index(&repo, &commit, &cancel).await;
    service.shutdown().await;
    let stats = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    if stats.commits_indexed == 0 {
        println!(
            "{}",
            style::dim(&format!("{} is already indexed.", style::short_hash(&commit)))
        );
        return Ok(());
    }
    println!(
        "{} {} commit{} up to {} in {} ms",
        style::success("Indexed"),
        stats.commits_indexed,
        if stats.commits_indexed == 1 { "" } else { "s" },
        style::short_hash(&commit),
        stats.duration_ms,
    );
    println!(
        "  {}",
        style::dim(&format!(
            "+{} symbols, -{} symbols",
            stats.symbols_added, stats.symbols_deleted
        ))
    );
    if stats.symbols_missing > 0 {
        println!(
            "  {}",
            style::warn(&format!(
                "{} deleted symbols were not found in the index",
                stats.symbols_missing
            ))
        );
    }
    Ok(())
}
