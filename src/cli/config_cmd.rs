use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

use rockskip::config::{CONFIG_FILENAME, Config, global_config_path};

use super::style;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate a config file (.rockskip.json locally, or global with --global)
    Validate {
        /// Directory containing .rockskip.json (defaults to current directory)
        #[arg(long)]
        path: Option<String>,
        /// Validate the global config file instead of a local one
        #[arg(long, short)]
        global: bool,
    },
    /// Show resolved configuration (defaults merged with overrides)
    Show {
        /// Directory containing .rockskip.json (defaults to current directory)
        #[arg(long)]
        path: Option<String>,
    },
}

pub fn run(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { path, global } => {
            let file = if global {
                let Some(file) = global_config_path() else {
                    println!(
                        "{}",
                        style::error("Could not determine config directory for this platform.")
                    );
                    return Ok(());
                };
                file
            } else {
                local_dir(path).join(CONFIG_FILENAME)
            };
            validate(&file)
        }
        ConfigCommand::Show { path } => {
            let config = Config::load(&local_dir(path))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!(
                "{}",
                style::dim(&format!(
                    "database: {}",
                    config.storage.resolved_db_path().display()
                ))
            );
            Ok(())
        }
    }
}

fn local_dir(path: Option<String>) -> PathBuf {
    PathBuf::from(path.unwrap_or_else(|| ".".to_string()))
}

fn validate(file: &Path) -> Result<()> {
    match Config::validate_file(file) {
        Ok(_) => {
            println!("{} {}", style::success("Valid:"), file.display());
            Ok(())
        }
        Err(e) => {
            println!("{} {e}", style::error("Invalid:"));
            std::process::exit(1);
        }
    }
}
