use anyhow::Result;
use clap::Subcommand;
use dialoguer::{Confirm, MultiSelect};

use rockskip::Service;
use rockskip::storage::RepoRecord;

use super::style;

#[derive(Subcommand)]
pub enum ReposCommands {
    /// List indexed repositories, most recently used first
    List,
    /// Delete index data for repositories
    Delete {
        /// Repository names to delete (interactive picker if omitted)
        names: Vec<String>,
    },
}

pub async fn run(command: ReposCommands) -> Result<()> {
    let (service, _) = super::start_service(super::load_config()?)?;
    let result = match command {
        ReposCommands::List => list(&service).await,
        ReposCommands::Delete { names } => {
            if names.is_empty() {
                delete_interactive(&service).await
            } else {
                delete_names(&service, names).await
            }
        }
    };
    service.shutdown().await;
    result
}

async fn list(service: &Service) -> Result<()> {
    let repos = service.list_repos().await?;
    if repos.is_empty() {
        println!("No indexed repositories found.");
        return Ok(());
    }

    println!("{}\n", style::heading("Indexed repositories:"));
    for repo in &repos {
        println!("  {}", repo.name);
        println!("    {}", style::dim(&describe(repo)));
    }
    println!(
        "\nTotal: {} repositor{}",
        repos.len(),
        if repos.len() == 1 { "y" } else { "ies" },
    );
    Ok(())
}

async fn delete_interactive(service: &Service) -> Result<()> {
    let repos = service.list_repos().await?;
    if repos.is_empty() {
        println!("No indexed repositories found.");
        return Ok(());
    }

    let items: Vec<String> = repos
        .iter()
        .map(|r| format!("{} ({})", r.name, describe(r)))
        .collect();
    let selections = MultiSelect::new()
        .with_prompt("Select repositories to delete")
        .items(&items)
        .interact()?;
    if selections.is_empty() {
        println!("No repositories selected.");
        return Ok(());
    }

    let names = selections.iter().map(|&i| repos[i].name.clone()).collect();
    delete_names(service, names).await
}

async fn delete_names(service: &Service, names: Vec<String>) -> Result<()> {
    println!("Will delete index data for:");
    for name in &names {
        println!("  {name}");
    }
    if !Confirm::new()
        .with_prompt("Proceed?")
        .default(true)
        .interact()?
    {
        println!("{}", style::warn("Cancelled."));
        return Ok(());
    }

    for name in &names {
        match service.delete_repo(name).await {
            Ok(true) => println!("  {}", style::success(&format!("Deleted: {name}"))),
            Ok(false) => println!("  {}", style::warn(&format!("Not indexed: {name}"))),
            Err(e) => println!(
                "  {}",
                style::error(&format!("Failed to delete {name}: {e:#}"))
            ),
        }
    }
    Ok(())
}

fn describe(repo: &RepoRecord) -> String {
    format!(
        "{} commit{}, {} symbol rows",
        repo.commits,
        if repo.commits == 1 { "" } else { "s" },
        repo.symbols
    )
}
