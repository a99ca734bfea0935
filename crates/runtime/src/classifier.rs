//! Path-based change categorisation.
//!
//! Categories are decided from the path alone, never from file contents.
//! Precedence when several rules match: test > critical > doc > config >
//! source > other.  User globs from `[classifier]` are consulted before the
//! built-in rules of the same category.

use std::fmt;

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};

use waypoint_config::ClassifierConfig;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeCategory {
    Source,
    Test,
    Config,
    Doc,
    Critical,
    Other,
}

impl fmt::Display for ChangeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Source => "source",
            Self::Test => "test",
            Self::Config => "config",
            Self::Doc => "doc",
            Self::Critical => "critical",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

// ── Built-in rules ───────────────────────────────────────────────────────────

const TEST_DIRS: &[&str] = &["test", "tests", "__tests__", "spec", "specs", "testing"];

const TEST_FILE_PATTERN: &str = r"(?x)
    ^test_.+\.py$
  | _test\.(py|go|rs|exs|c|cpp|cc|dart)$
  | \.(test|spec)\.(js|jsx|ts|tsx|mjs|cjs|rb)$
  | _spec\.rb$
  | Tests?\.(java|kt|cs|swift|scala|php)$
";

const CRITICAL_FILES: &[&str] = &[
    "Cargo.toml",
    "Cargo.lock",
    "build.rs",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "go.mod",
    "go.sum",
    "requirements.txt",
    "pyproject.toml",
    "setup.py",
    "setup.cfg",
    "Pipfile",
    "Pipfile.lock",
    "poetry.lock",
    "Gemfile",
    "Gemfile.lock",
    "pom.xml",
    "build.gradle",
    "build.gradle.kts",
    "settings.gradle",
    "settings.gradle.kts",
    "composer.json",
    "composer.lock",
    "mix.exs",
    "mix.lock",
    "Makefile",
    "CMakeLists.txt",
    "Dockerfile",
    "docker-compose.yml",
    "docker-compose.yaml",
    ".gitmodules",
];

const DOC_EXTENSIONS: &[&str] = &["md", "markdown", "rst", "adoc", "asciidoc", "txt", "org"];

const DOC_STEMS: &[&str] = &["README", "LICENSE", "CHANGELOG", "CONTRIBUTING", "AUTHORS", "NOTICE"];

const CONFIG_EXTENSIONS: &[&str] = &[
    "toml", "yaml", "yml", "json", "ini", "cfg", "conf", "env", "properties", "plist",
];

const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "py", "pyi", "js", "jsx", "mjs", "cjs", "ts", "tsx", "go", "java", "kt", "kts", "scala",
    "swift", "c", "h", "cc", "cpp", "cxx", "hpp", "hh", "cs", "fs", "rb", "php", "pl", "lua", "sh",
    "bash", "zsh", "fish", "ex", "exs", "erl", "hrl", "hs", "ml", "mli", "clj", "cljs", "dart",
    "r", "jl", "sql", "vue", "svelte", "m", "mm", "zig", "nim", "css", "scss", "sass", "less",
    "html", "proto",
];

// ── Classifier ───────────────────────────────────────────────────────────────

pub struct Classifier {
    test_globs: GlobSet,
    critical_globs: GlobSet,
    doc_globs: GlobSet,
    config_globs: GlobSet,
    test_file: Regex,
}

impl Classifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, EngineError> {
        let test_file = Regex::new(TEST_FILE_PATTERN)
            .map_err(|err| EngineError::Configuration(format!("test file pattern: {err}")))?;
        Ok(Self {
            test_globs: build_globset("test_globs", &config.test_globs)?,
            critical_globs: build_globset("critical_globs", &config.critical_globs)?,
            doc_globs: build_globset("doc_globs", &config.doc_globs)?,
            config_globs: build_globset("config_globs", &config.config_globs)?,
            test_file,
        })
    }

    /// Categorise a `/`-separated path relative to the repository root.
    pub fn classify(&self, path: &str) -> ChangeCategory {
        let path = path.trim_start_matches("./");
        let (dirs, file_name) = match path.rsplit_once('/') {
            Some((dirs, name)) => (dirs, name),
            None => ("", path),
        };
        let extension = file_name
            .rsplit_once('.')
            .filter(|(stem, _)| !stem.is_empty())
            .map(|(_, ext)| ext.to_ascii_lowercase());

        if self.test_globs.is_match(path) || self.is_builtin_test(dirs, file_name) {
            return ChangeCategory::Test;
        }
        if self.critical_globs.is_match(path) || CRITICAL_FILES.contains(&file_name) {
            return ChangeCategory::Critical;
        }
        if self.doc_globs.is_match(path) || is_builtin_doc(dirs, file_name, extension.as_deref()) {
            return ChangeCategory::Doc;
        }
        if self.config_globs.is_match(path) || is_builtin_config(file_name, extension.as_deref()) {
            return ChangeCategory::Config;
        }
        match extension.as_deref() {
            Some(ext) if SOURCE_EXTENSIONS.contains(&ext) => ChangeCategory::Source,
            _ => ChangeCategory::Other,
        }
    }

    fn is_builtin_test(&self, dirs: &str, file_name: &str) -> bool {
        dirs.split('/').any(|dir| TEST_DIRS.contains(&dir)) || self.test_file.is_match(file_name)
    }
}

fn is_builtin_doc(dirs: &str, file_name: &str, extension: Option<&str>) -> bool {
    if extension.is_some_and(|ext| DOC_EXTENSIONS.contains(&ext)) {
        return true;
    }
    let stem = file_name.split('.').next().unwrap_or(file_name);
    if DOC_STEMS.iter().any(|doc| doc.eq_ignore_ascii_case(stem)) {
        return true;
    }
    dirs.split('/').next().is_some_and(|top| top == "docs" || top == "doc")
}

fn is_builtin_config(file_name: &str, extension: Option<&str>) -> bool {
    if extension.is_some_and(|ext| CONFIG_EXTENSIONS.contains(&ext)) {
        return true;
    }
    // Dotfiles such as .editorconfig, .prettierrc, .env.local
    file_name.starts_with('.')
        && (file_name.ends_with("rc")
            || file_name.starts_with(".env")
            || file_name.ends_with("config")
            || file_name.ends_with("ignore"))
}

pub(crate) fn build_globset(field: &str, patterns: &[String]) -> Result<GlobSet, EngineError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| {
            EngineError::Configuration(format!("invalid {field} pattern '{pattern}': {err}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|err| EngineError::Configuration(format!("{field}: {err}")))
}
