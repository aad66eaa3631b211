//! Conventional Commits parsing and a lightweight commit risk score.

use devlens_model::CommitStats;
use once_cell::sync::Lazy;
use regex::Regex;

static CONVENTIONAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<type>[A-Za-z]+)(?:\((?P<scope>[^)]+)\))?(?P<breaking>!)?:\s+(?P<subject>.+)$",
    )
    .expect("conventional commit regex")
});

const KNOWN_TYPES: &[&str] = &[
    "feat", "fix", "docs", "style", "refactor", "perf", "test", "build", "ci",
    "chore", "revert", "hotfix",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConventionalCommit {
    pub commit_type: String,
    pub scope: Option<String>,
    pub breaking: bool,
    pub subject: String,
}

/// Parse the first line of a commit message as a Conventional Commit.
/// Unknown type tokens are rejected so prose like `update: notes` does not
/// count.
pub fn parse(message: &str) -> Option<ConventionalCommit> {
    let first_line = message.lines().next()?.trim();
    let captures = CONVENTIONAL.captures(first_line)?;
    let commit_type = captures.name("type")?.as_str().to_lowercase();
    if !KNOWN_TYPES.contains(&commit_type.as_str()) {
        return None;
    }
    Some(ConventionalCommit {
        commit_type,
        scope: captures.name("scope").map(|m| m.as_str().to_string()),
        breaking: captures.name("breaking").is_some()
            || message.contains("BREAKING CHANGE"),
        subject: captures.name("subject")?.as_str().to_string(),
    })
}

/// Risk in 0..=1 from change size and commit intent.
pub fn risk_score(
    stats: &CommitStats,
    conventional: Option<&ConventionalCommit>,
) -> f64 {
    let base = match conventional.map(|c| c.commit_type.as_str()) {
        Some("docs") => 0.1,
        Some("style") => 0.1,
        Some("test") => 0.15,
        Some("chore") => 0.2,
        Some("ci") => 0.25,
        Some("build") => 0.3,
        Some("fix") => 0.35,
        Some("feat") => 0.45,
        Some("refactor") | Some("perf") => 0.5,
        Some("revert") => 0.6,
        Some("hotfix") => 0.7,
        _ => 0.4,
    };
    let churn_factor = (stats.churn() as f64 / 2_000.0).min(1.0) * 0.3;
    let files_factor = (stats.files as f64 / 50.0).min(1.0) * 0.15;
    let breaking = if conventional.is_some_and(|c| c.breaking) {
        0.25
    } else {
        0.0
    };
    (base + churn_factor + files_factor + breaking).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_type_scope_subject() {
        let parsed = parse("feat(auth): add login").expect("parses");
        assert_eq!(parsed.commit_type, "feat");
        assert_eq!(parsed.scope.as_deref(), Some("auth"));
        assert_eq!(parsed.subject, "add login");
        assert!(!parsed.breaking);
    }

    #[test]
    fn parses_breaking_marker() {
        let parsed = parse("refactor(core)!: drop legacy api").expect("parses");
        assert!(parsed.breaking);
    }

    #[test]
    fn rejects_non_conventional_messages() {
        assert!(parse("merged the thing").is_none());
        assert!(parse("update: notes").is_none());
        assert!(parse("WIP").is_none());
    }

    #[test]
    fn only_first_line_is_parsed() {
        let parsed = parse("fix: crash\n\nlong body here").expect("parses");
        assert_eq!(parsed.subject, "crash");
    }

    #[test]
    fn risk_grows_with_churn_and_breaking() {
        let small = CommitStats { adds: 10, dels: 2, files: 1 };
        let huge = CommitStats { adds: 3_000, dels: 1_500, files: 80 };
        let fix = parse("fix: crash").unwrap();
        let breaking = parse("feat!: new api").unwrap();

        let low = risk_score(&small, Some(&fix));
        let high = risk_score(&huge, Some(&fix));
        assert!(low < high);

        let risky = risk_score(&small, Some(&breaking));
        assert!(risky > risk_score(&small, Some(&fix)));

        for stats in [&small, &huge] {
            for conv in [Some(&fix), Some(&breaking), None] {
                let risk = risk_score(stats, conv);
                assert!((0.0..=1.0).contains(&risk));
            }
        }
    }
}
