//! Path filtering and context tagging for file events.

use std::path::Path;

use devlens_model::ContextTag;
use once_cell::sync::Lazy;
use regex::Regex;

/// Globs ignored by default: dependency and build trees, VCS metadata,
/// logs, and OS/editor droppings.
pub const DEFAULT_IGNORE: &[&str] = &[
    "**/target/**",
    "**/node_modules/**",
    "**/.git/**",
    "**/dist/**",
    "**/out/**",
    "**/coverage/**",
    "**/.idea/**",
    "**/.vscode/**",
    "**/__pycache__/**",
    "**/*.log",
    "**/.DS_Store",
    "**/*.swp",
    "**/*~",
];

/// Compiled ignore set plus tagging rules.
#[derive(Debug)]
pub struct PathClassifier {
    ignore: Vec<Regex>,
}

impl PathClassifier {
    /// Build from glob patterns; invalid patterns are skipped with the
    /// defaults always applied first.
    pub fn new(extra_ignore: &[String]) -> Self {
        let ignore = DEFAULT_IGNORE
            .iter()
            .copied()
            .map(str::to_string)
            .chain(extra_ignore.iter().cloned())
            .filter_map(|glob| Regex::new(&glob_to_regex(&glob)).ok())
            .collect();
        Self { ignore }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        let normalized = normalize(path);
        self.ignore.iter().any(|re| re.is_match(&normalized))
    }

    /// Classify a path. Tags are hints for the analyzers, not gates.
    pub fn context_tag(&self, path: &Path) -> ContextTag {
        let normalized = normalize(path);
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if TEST_PATH.is_match(&normalized) || TEST_FILE.is_match(&file_name) {
            return ContextTag::Test;
        }
        if CONFIG_FILE.is_match(&file_name)
            || matches!(extension.as_str(), "toml" | "ini" | "env" | "properties")
        {
            return ContextTag::Config;
        }
        if DOCS_PATH.is_match(&normalized)
            || matches!(extension.as_str(), "md" | "rst" | "adoc")
        {
            return ContextTag::Docs;
        }
        if BUILD_FILE.is_match(&file_name) || BUILD_PATH.is_match(&normalized) {
            return ContextTag::Build;
        }
        ContextTag::Source
    }
}

static TEST_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|/)(tests?|__tests__|spec)(/|$)").expect("test path regex")
});
static TEST_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(_test\.[a-z]+|\.test\.[a-z]+|\.spec\.[a-z]+|^test_)")
        .expect("test file regex")
});
static CONFIG_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(package\.json|tsconfig\.json|\.env.*|.*rc|.*\.config\.[a-z]+|settings\.[a-z]+)$",
    )
    .expect("config file regex")
});
static DOCS_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|/)(docs?|documentation)(/|$)").expect("docs regex"));
static BUILD_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(makefile|dockerfile|justfile|cmakelists\.txt|.*\.mk|.*\.gradle)$")
        .expect("build file regex")
});
static BUILD_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|/)(build|ci|\.github)(/|$)").expect("build path regex"));

fn normalize(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Minimal glob support: `**` spans directories, `*` stops at separators.
fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following separator so `**/x` matches `x`.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        regex.push_str("(.*/)?");
                    } else {
                        regex.push_str(".*");
                    }
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' => {
                regex.push('\\');
                regex.push(ch);
            }
            other => regex.push(other),
        }
    }
    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn classifier() -> PathClassifier {
        PathClassifier::new(&[])
    }

    #[test]
    fn default_ignores_cover_dependency_dirs() {
        let c = classifier();
        assert!(c.is_ignored(&PathBuf::from("project/target/debug/app")));
        assert!(c.is_ignored(&PathBuf::from("web/node_modules/lodash/index.js")));
        assert!(c.is_ignored(&PathBuf::from(".git/objects/ab/cdef")));
        assert!(c.is_ignored(&PathBuf::from("server/app.log")));
        assert!(!c.is_ignored(&PathBuf::from("src/main.rs")));
    }

    #[test]
    fn extra_ignore_globs_are_honored() {
        let c = PathClassifier::new(&["**/generated/**".to_string()]);
        assert!(c.is_ignored(&PathBuf::from("src/generated/schema.rs")));
        assert!(!c.is_ignored(&PathBuf::from("src/handwritten/schema.rs")));
    }

    #[test]
    fn context_tags_follow_path_rules() {
        let c = classifier();
        assert_eq!(c.context_tag(&PathBuf::from("src/lib.rs")), ContextTag::Source);
        assert_eq!(
            c.context_tag(&PathBuf::from("tests/integration.rs")),
            ContextTag::Test
        );
        assert_eq!(
            c.context_tag(&PathBuf::from("src/auth/login.spec.ts")),
            ContextTag::Test
        );
        assert_eq!(c.context_tag(&PathBuf::from("Cargo.toml")), ContextTag::Config);
        assert_eq!(c.context_tag(&PathBuf::from(".eslintrc")), ContextTag::Config);
        assert_eq!(c.context_tag(&PathBuf::from("docs/guide.md")), ContextTag::Docs);
        assert_eq!(c.context_tag(&PathBuf::from("Dockerfile")), ContextTag::Build);
        assert_eq!(
            c.context_tag(&PathBuf::from(".github/workflows/ci.yml")),
            ContextTag::Build
        );
    }
}
