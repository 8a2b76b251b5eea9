use owo_colors::{OwoColorize, Stream::Stdout};

pub fn heading(text: &str) -> String {
    text.if_supports_color(Stdout, |t| t.bold()).to_string()
}

pub fn success(text: &str) -> String {
    text.if_supports_color(Stdout, |t| t.green()).to_string()
}

pub fn dim(text: &str) -> String {
    text.if_supports_color(Stdout, |t| t.dimmed()).to_string()
}

pub fn warn(text: &str) -> String {
    text.if_supports_color(Stdout, |t| t.yellow()).to_string()
}

pub fn error(text: &str) -> String {
    text.if_supports_color(Stdout, |t| t.red()).to_string()
}

/// `path:line` prefix of a search result.
pub fn location(path: &str, line: usize) -> String {
    let text = if line > 0 {
        format!("{path}:{line}")
    } else {
        path.to_string()
    };
    text.if_supports_color(Stdout, |t| t.cyan()).to_string()
}

pub fn symbol_name(name: &str) -> String {
    name.if_supports_color(Stdout, |t| t.bold()).to_string()
}

pub fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
