pub mod languages;
pub mod pool;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::ParserConfig;
pub use languages::TreeSitterParser;
pub use pool::{ParserFactory, ParserLease, ParserPool};

/// Placeholder ctags-style extractors use for unnamed functions.
const ANONYMOUS_PREFIX: &str = "__anon";

/// Bytes inspected when sniffing for binary content.
const BINARY_SNIFF_LEN: usize = 256;

/// A symbol as reported by an extractor for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub name: String,
    pub path: String,
    /// 1-based line of the definition
    pub line: usize,
    pub kind: String,
    pub language: String,
    pub parent: Option<String>,
    pub parent_kind: Option<String>,
    pub signature: Option<String>,
    pub pattern: Option<String>,
    pub file_limited: bool,
}

/// A single-file symbol extractor. Instances are not shared between threads;
/// the pool hands each one to a single caller at a time.
pub trait Parser: Send {
    fn parse(&mut self, path: &str, content: &[u8]) -> Result<Vec<Symbol>>;

    /// Releases whatever backs the instance. Called before a failed instance
    /// is discarded.
    fn close(&mut self) {}
}

/// Filtering front-end to the parser pool. Rejections yield no symbols rather
/// than errors, and a failing parser instance is replaced without failing the
/// caller.
#[derive(Clone)]
pub struct SymbolParser {
    pool: ParserPool,
    max_file_size: u64,
    max_symbols: usize,
}

impl SymbolParser {
    pub fn new(pool: ParserPool, config: &ParserConfig) -> Self {
        Self {
            pool,
            max_file_size: config.max_file_size,
            max_symbols: config.max_symbols,
        }
    }

    pub fn pool(&self) -> &ParserPool {
        &self.pool
    }

    pub async fn parse(
        &self,
        path: &str,
        content: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Symbol>> {
        if content.len() as u64 > self.max_file_size {
            tracing::debug!(path = %path, size = content.len(), "Skipping oversized file");
            return Ok(Vec::new());
        }
        if is_probably_binary(&content) {
            tracing::debug!(path = %path, "Skipping binary file");
            return Ok(Vec::new());
        }

        let mut lease = self.pool.acquire(cancel).await?;
        let Some(mut parser) = lease.take() else {
            anyhow::bail!("parser lease for {path} was empty");
        };

        let owned_path = path.to_string();
        let joined = tokio::task::spawn_blocking(move || {
            let result = parser.parse(&owned_path, &content);
            (parser, result)
        })
        .await;

        // A lease dropped without its parser hands the pool a recreate slot.
        let symbols = match joined {
            Ok((parser, Ok(symbols))) => {
                lease.restore(parser);
                symbols
            }
            Ok((mut parser, Err(e))) => {
                tracing::warn!(path = %path, error = %e, "Parser failed, replacing instance");
                parser.close();
                return Ok(Vec::new());
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Parser panicked, replacing instance");
                return Ok(Vec::new());
            }
        };
        drop(lease);

        if symbols.len() > self.max_symbols {
            tracing::debug!(
                path = %path,
                count = symbols.len(),
                limit = self.max_symbols,
                "Discarding symbols from noisy file"
            );
            return Ok(Vec::new());
        }

        Ok(symbols.into_iter().filter(keep_symbol).collect())
    }
}

pub fn is_probably_binary(content: &[u8]) -> bool {
    content.iter().take(BINARY_SNIFF_LEN).any(|b| *b == 0)
}

fn is_anonymous(name: &str) -> bool {
    name.starts_with(ANONYMOUS_PREFIX)
}

fn keep_symbol(symbol: &Symbol) -> bool {
    if symbol.name.is_empty() || is_anonymous(&symbol.name) {
        return false;
    }
    !symbol.parent.as_deref().is_some_and(is_anonymous)
}
