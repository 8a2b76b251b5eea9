use std::time::Duration;

use anyhow::Result;
use clap::Args;

use rockskip::parser::Symbol;
use rockskip::search::SearchArgs;

use super::style;

#[derive(Args)]
pub struct SearchCmdArgs {
    /// Path to the git repository
    pub repo: String,
    /// Substring (or regular expression with --regexp) to match symbol names
    #[arg(default_value = "")]
    pub query: String,
    /// Commit or revision to search at
    #[arg(long, default_value = "HEAD")]
    pub commit: String,
    /// Treat the query as a regular expression
    #[arg(short = 'r', long)]
    pub regexp: bool,
    /// Match names and paths case-sensitively
    #[arg(short = 'c', long)]
    pub case_sensitive: bool,
    /// Only paths matching this regular expression (repeatable)
    #[arg(short = 'i', long = "include")]
    pub include: Vec<String>,
    /// Skip paths matching this regular expression
    #[arg(short = 'e', long = "exclude")]
    pub exclude: Option<String>,
    /// Only files of this language (repeatable)
    #[arg(short = 'l', long = "lang")]
    pub langs: Vec<String>,
    /// Skip files of this language (repeatable)
    #[arg(long = "exclude-lang")]
    pub exclude_langs: Vec<String>,
    /// Maximum number of results; 0 for no limit
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
    /// Give up after this many seconds, indexing included (0 for no limit)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
    /// Print results as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: SearchCmdArgs) -> Result<()> {
    let repo = super::repo_name(&args.repo)?;
    let config = super::load_config()?;
    let limit = args.limit.unwrap_or(config.search.default_limit);
    let (service, git) = super::start_service(config)?;
    let commit = git.resolve_revision(&repo, &args.commit).await?;
    let cancel = super::cancel_on_interrupt();

    let query = SearchArgs {
        repo,
        commit,
        query: args.query,
        is_regexp: args.regexp,
        case_sensitive: args.case_sensitive,
        include_patterns: args.include,
        exclude_pattern: args.exclude,
        include_langs: args.langs,
        exclude_langs: args.exclude_langs,
        limit,
        timeout: args.timeout.map(Duration::from_secs),
    };
    let result = service.search(query, &cancel).await;
    service.shutdown().await;
    let symbols = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&symbols)?);
        return Ok(());
    }
    if symbols.is_empty() {
        println!("No symbols found.");
        return Ok(());
    }
    for symbol in &symbols {
        println!("{}", format_symbol(symbol));
    }
    if limit > 0 && symbols.len() == limit {
        println!(
            "{}",
            style::dim(&format!("(showing the first {limit}; raise --limit for more)"))
        );
    }
    Ok(())
}

fn format_symbol(symbol: &Symbol) -> String {
    let mut line = format!(
        "{}  {}",
        style::location(&symbol.path, symbol.line),
        style::symbol_name(&symbol.name)
    );
    if !symbol.kind.is_empty() {
        line.push_str(&format!(" {}", style::dim(&symbol.kind)));
    }
    if let Some(parent) = &symbol.parent {
        line.push_str(&format!(" {}", style::dim(&format!("in {parent}"))));
    }
    line
}
