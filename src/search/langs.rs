/// A language name, its accepted aliases and the file extensions it covers.
pub struct LanguageSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub extensions: &'static [&'static str],
}

const LANGUAGES: &[LanguageSpec] = &[
    LanguageSpec { name: "c", aliases: &[], extensions: &["c", "h"] },
    LanguageSpec { name: "c#", aliases: &["csharp", "cs"], extensions: &["cs"] },
    LanguageSpec {
        name: "c++",
        aliases: &["cpp", "cxx"],
        extensions: &["cc", "cpp", "cxx", "hh", "hpp", "hxx"],
    },
    LanguageSpec { name: "css", aliases: &[], extensions: &["css"] },
    LanguageSpec { name: "go", aliases: &["golang"], extensions: &["go"] },
    LanguageSpec { name: "haskell", aliases: &["hs"], extensions: &["hs"] },
    LanguageSpec { name: "html", aliases: &[], extensions: &["html", "htm"] },
    LanguageSpec { name: "java", aliases: &[], extensions: &["java"] },
    LanguageSpec {
        name: "javascript",
        aliases: &["js"],
        extensions: &["js", "jsx", "mjs", "cjs"],
    },
    LanguageSpec { name: "json", aliases: &[], extensions: &["json"] },
    LanguageSpec { name: "kotlin", aliases: &["kt"], extensions: &["kt", "kts"] },
    LanguageSpec { name: "markdown", aliases: &["md"], extensions: &["md", "markdown"] },
    LanguageSpec { name: "php", aliases: &[], extensions: &["php"] },
    LanguageSpec { name: "protobuf", aliases: &["proto"], extensions: &["proto"] },
    LanguageSpec { name: "python", aliases: &["py"], extensions: &["py", "pyi"] },
    LanguageSpec { name: "ruby", aliases: &["rb"], extensions: &["rb"] },
    LanguageSpec { name: "rust", aliases: &["rs"], extensions: &["rs"] },
    LanguageSpec { name: "scala", aliases: &[], extensions: &["scala", "sc"] },
    LanguageSpec { name: "shell", aliases: &["sh", "bash"], extensions: &["sh", "bash"] },
    LanguageSpec { name: "sql", aliases: &[], extensions: &["sql"] },
    LanguageSpec { name: "swift", aliases: &[], extensions: &["swift"] },
    LanguageSpec { name: "text", aliases: &["txt"], extensions: &["txt"] },
    LanguageSpec { name: "toml", aliases: &[], extensions: &["toml"] },
    LanguageSpec {
        name: "typescript",
        aliases: &["ts"],
        extensions: &["ts", "tsx", "mts", "cts"],
    },
    LanguageSpec { name: "yaml", aliases: &["yml"], extensions: &["yaml", "yml"] },
];

/// Looks up a language by name or alias, ignoring case.
pub fn find(name: &str) -> Option<&'static LanguageSpec> {
    let name = name.trim().to_ascii_lowercase();
    LANGUAGES
        .iter()
        .find(|lang| lang.name == name || lang.aliases.contains(&name.as_str()))
}

/// Language of `path` by extension.
pub fn for_path(path: &str) -> Option<&'static LanguageSpec> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = file_name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    LANGUAGES
        .iter()
        .find(|lang| lang.extensions.contains(&ext.as_str()))
}

/// Dotted extensions of every known language in `names`, deduplicated.
/// Unknown names are skipped.
pub fn extensions_of(names: &[String]) -> Vec<String> {
    let mut extensions: Vec<String> = Vec::new();
    for lang in names.iter().filter_map(|name| find(name)) {
        for ext in lang.extensions {
            let dotted = format!(".{ext}");
            if !extensions.contains(&dotted) {
                extensions.push(dotted);
            }
        }
    }
    extensions
}

/// Every known language with the file globs it covers, ordered by name.
pub fn list() -> Vec<(&'static str, Vec<String>)> {
    LANGUAGES
        .iter()
        .map(|lang| {
            let globs = lang.extensions.iter().map(|ext| format!("*.{ext}")).collect();
            (lang.name, globs)
        })
        .collect()
}
