pub mod python;
pub mod rust_lang;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tree_sitter::{Node, Tree};

use super::{Parser, ParserFactory, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Method,
    Struct,
    Enum,
    Variant,
    Trait,
    Impl,
    Module,
    Type,
    Constant,
    Field,
    Class,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Struct => "struct",
            Self::Enum => "enum",
            Self::Variant => "enumerator",
            Self::Trait => "interface",
            Self::Impl => "implementation",
            Self::Module => "module",
            Self::Type => "typedef",
            Self::Constant => "constant",
            Self::Field => "field",
            Self::Class => "class",
        }
    }
}

/// Enclosing definition of a nested symbol.
#[derive(Debug, Clone)]
pub struct Scope {
    pub name: String,
    pub kind: SymbolKind,
}

impl Scope {
    pub fn new(name: impl Into<String>, kind: SymbolKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Collects flat symbols for one file.
pub struct SymbolSink<'a> {
    path: &'a str,
    language: &'static str,
    source: &'a [u8],
    symbols: Vec<Symbol>,
}

impl<'a> SymbolSink<'a> {
    pub fn new(path: &'a str, language: &'static str, source: &'a [u8]) -> Self {
        Self {
            path,
            language,
            source,
            symbols: Vec::new(),
        }
    }

    pub fn source(&self) -> &'a [u8] {
        self.source
    }

    pub fn text(&self, node: Node) -> String {
        node.utf8_text(self.source).unwrap_or("").to_string()
    }

    pub fn push(
        &mut self,
        node: Node,
        name: String,
        kind: SymbolKind,
        scope: Option<&Scope>,
        signature: Option<String>,
        file_limited: bool,
    ) {
        self.symbols.push(Symbol {
            name,
            path: self.path.to_string(),
            line: node.start_position().row + 1,
            kind: kind.as_str().to_string(),
            language: self.language.to_string(),
            parent: scope.map(|s| s.name.clone()),
            parent_kind: scope.map(|s| s.kind.as_str().to_string()),
            signature,
            pattern: Some(line_pattern(self.source, node.start_byte())),
            file_limited,
        });
    }

    pub fn finish(self) -> Vec<Symbol> {
        self.symbols
    }
}

/// ctags-style search pattern for the line containing `offset`.
fn line_pattern(source: &[u8], offset: usize) -> String {
    let offset = offset.min(source.len());
    let start = source[..offset]
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);
    let end = source[offset..]
        .iter()
        .position(|b| *b == b'\n')
        .map_or(source.len(), |i| offset + i);
    let line = String::from_utf8_lossy(&source[start..end]);
    let line = line.trim_end_matches('\r');
    let escaped = line.replace('\\', "\\\\").replace('/', "\\/");
    format!("/^{escaped}$/")
}

pub trait LanguageExtractor: Send + Sync {
    fn language(&self) -> tree_sitter::Language;
    fn name(&self) -> &'static str;
    fn extensions(&self) -> &[&str];
    fn extract(&self, tree: &Tree, sink: &mut SymbolSink);
}

/// `Parser` backed by tree-sitter grammars. Files in languages without an
/// extractor produce no symbols.
pub struct TreeSitterParser {
    parser: tree_sitter::Parser,
    extractors: Vec<Box<dyn LanguageExtractor>>,
}

impl TreeSitterParser {
    pub fn new() -> Self {
        Self {
            parser: tree_sitter::Parser::new(),
            extractors: vec![
                Box::new(rust_lang::RustExtractor),
                Box::new(python::PythonExtractor),
            ],
        }
    }

    pub fn factory() -> ParserFactory {
        Arc::new(|| Ok(Box::new(TreeSitterParser::new()) as Box<dyn Parser>))
    }

    fn extractor_index(&self, path: &str) -> Option<usize> {
        let ext = Path::new(path).extension()?.to_str()?;
        self.extractors
            .iter()
            .position(|e| e.extensions().contains(&ext))
    }
}

impl Default for TreeSitterParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for TreeSitterParser {
    fn parse(&mut self, path: &str, content: &[u8]) -> Result<Vec<Symbol>> {
        let Some(index) = self.extractor_index(path) else {
            return Ok(Vec::new());
        };
        let extractor = &self.extractors[index];
        let name = extractor.name();

        self.parser
            .set_language(&extractor.language())
            .with_context(|| format!("Failed to load {name} grammar"))?;
        let tree = self
            .parser
            .parse(content, None)
            .with_context(|| format!("tree-sitter produced no tree for {path}"))?;

        let mut sink = SymbolSink::new(path, name, content);
        extractor.extract(&tree, &mut sink);
        Ok(sink.finish())
    }

    fn close(&mut self) {
        self.parser.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_pattern() {
        let src = b"fn a() {}\nfn b(x: &str) -> a/b {}\n";
        assert_eq!(line_pattern(src, 0), "/^fn a() {}$/");
        assert_eq!(line_pattern(src, 13), "/^fn b(x: &str) -> a\\/b {}$/");
    }

    #[test]
    fn test_unknown_extension_yields_nothing() {
        let mut parser = TreeSitterParser::new();
        assert!(parser.parse("notes.txt", b"fn main() {}").unwrap().is_empty());
        assert!(parser.parse("Makefile", b"all:").unwrap().is_empty());
    }

    #[test]
    fn test_switches_languages() {
        let mut parser = TreeSitterParser::new();
        let rust = parser.parse("a.rs", b"fn alpha() {}\n").unwrap();
        let python = parser.parse("b.py", b"def beta():\n    pass\n").unwrap();
        assert_eq!(rust[0].name, "alpha");
        assert_eq!(rust[0].language, "rust");
        assert_eq!(python[0].name, "beta");
        assert_eq!(python[0].language, "python");
    }
}
