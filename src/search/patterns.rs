use anyhow::Result;
use regex::RegexBuilder;

use crate::error::RockskipError;

/// How a path pattern is evaluated in SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatcher {
    /// `^literal` patterns: a bounded prefix comparison.
    Prefix(String),
    /// `\.ext$` patterns: a suffix comparison.
    Suffix(String),
    Regex(String),
}

impl PathMatcher {
    pub fn compile(pattern: &str, case_sensitive: bool) -> Result<Self> {
        validate(pattern, case_sensitive)?;

        if let Some(rest) = pattern.strip_prefix('^') {
            if let Some(prefix) = unescape_literal(rest) {
                if case_sensitive || prefix.is_ascii() {
                    return Ok(Self::Prefix(fold(prefix, case_sensitive)));
                }
            }
        }
        if let Some(ext) = extension_suffix(pattern) {
            return Ok(Self::Suffix(fold(format!(".{ext}"), case_sensitive)));
        }
        Ok(Self::Regex(with_case(pattern, case_sensitive)))
    }

    /// SQL condition over `column`, with the comparison value bound to
    /// `param` by the caller.
    pub fn condition(&self, column: &str, param: &str, case_sensitive: bool) -> String {
        let column = if case_sensitive {
            column.to_string()
        } else {
            format!("lower({column})")
        };
        match self {
            Self::Prefix(_) => format!("substr({column}, 1, length({param})) = {param}"),
            Self::Suffix(_) => format!("substr({column}, -length({param})) = {param}"),
            Self::Regex(_) => format!("{column} REGEXP {param}"),
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Prefix(s) | Self::Suffix(s) | Self::Regex(s) => s,
        }
    }
}

/// Compiles `pattern` to report syntax errors before the query runs.
pub fn validate(pattern: &str, case_sensitive: bool) -> Result<()> {
    RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|e| RockskipError::invalid_pattern(pattern, e))?;
    Ok(())
}

pub fn with_case(pattern: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        pattern.to_string()
    } else {
        format!("(?i){pattern}")
    }
}

/// SQLite's `lower()` only folds ASCII, so literals are folded the same way.
/// Non-ASCII literals that need folding go through `REGEXP` instead.
fn fold(literal: String, case_sensitive: bool) -> String {
    if case_sensitive {
        literal
    } else {
        literal.to_ascii_lowercase()
    }
}

fn is_meta(c: char) -> bool {
    matches!(
        c,
        '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
    )
}

/// The literal text matched by `pattern`, if it contains no regex operators.
/// Escaped punctuation counts as literal.
fn unescape_literal(pattern: &str) -> Option<String> {
    let mut literal = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars.next()?;
                if escaped.is_ascii_alphanumeric() {
                    // \d, \w, \b ... are classes, not literals
                    return None;
                }
                literal.push(escaped);
            }
            c if is_meta(c) => return None,
            c => literal.push(c),
        }
    }
    if literal.is_empty() { None } else { Some(literal) }
}

/// Extension of `\.ext$` or `.*\.ext$`.
fn extension_suffix(pattern: &str) -> Option<&str> {
    let rest = pattern.strip_prefix(".*").unwrap_or(pattern);
    let ext = rest.strip_prefix("\\.")?.strip_suffix('$')?;
    if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some(ext)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_fast_path() {
        assert_eq!(
            PathMatcher::compile("^src/", true).unwrap(),
            PathMatcher::Prefix("src/".to_string())
        );
        assert_eq!(
            PathMatcher::compile(r"^cmd/main\.go", true).unwrap(),
            PathMatcher::Prefix("cmd/main.go".to_string())
        );
        assert_eq!(
            PathMatcher::compile("^Src/", false).unwrap(),
            PathMatcher::Prefix("src/".to_string())
        );
        // Operators after the anchor disqualify the fast path.
        assert!(matches!(
            PathMatcher::compile("^src/.*", true).unwrap(),
            PathMatcher::Regex(_)
        ));
        assert!(matches!(
            PathMatcher::compile(r"^\d+", true).unwrap(),
            PathMatcher::Regex(_)
        ));
    }

    #[test]
    fn test_suffix_fast_path() {
        assert_eq!(
            PathMatcher::compile(r"\.go$", true).unwrap(),
            PathMatcher::Suffix(".go".to_string())
        );
        assert_eq!(
            PathMatcher::compile(r".*\.TXT$", false).unwrap(),
            PathMatcher::Suffix(".txt".to_string())
        );
        // Without the end anchor it is an ordinary regex.
        assert_eq!(
            PathMatcher::compile(r".*\.txt", true).unwrap(),
            PathMatcher::Regex(r".*\.txt".to_string())
        );
        assert!(matches!(
            PathMatcher::compile(r"\.(go|rs)$", true).unwrap(),
            PathMatcher::Regex(_)
        ));
    }

    #[test]
    fn test_non_ascii_prefix_folds_through_regex() {
        assert_eq!(
            PathMatcher::compile("^Über/", false).unwrap(),
            PathMatcher::Regex("(?i)^Über/".to_string())
        );
        assert_eq!(
            PathMatcher::compile("^Über/", true).unwrap(),
            PathMatcher::Prefix("Über/".to_string())
        );
    }

    #[test]
    fn test_regex_case_folding() {
        assert_eq!(
            PathMatcher::compile("internal", false).unwrap(),
            PathMatcher::Regex("(?i)internal".to_string())
        );
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = PathMatcher::compile("src/(", true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RockskipError>(),
            Some(RockskipError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_condition_sql() {
        let prefix = PathMatcher::compile("^a/", false).unwrap();
        assert_eq!(
            prefix.condition("path", "?3", false),
            "substr(lower(path), 1, length(?3)) = ?3"
        );
        let suffix = PathMatcher::compile(r"\.rs$", true).unwrap();
        assert_eq!(suffix.condition("path", "?4", true), "substr(path, -length(?4)) = ?4");
    }
}
