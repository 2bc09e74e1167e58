use glob::{MatchOptions, Pattern};

use crate::error::KeelResult;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A set of glob patterns matched against slash separated, repository relative paths.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    patterns: Vec<Pattern>,
}

impl PathMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> KeelResult<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::new(p.as_ref().trim_start_matches("./")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `path` matches at least one pattern.
    pub fn matches(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        self.patterns
            .iter()
            .any(|p| p.matches_with(path, MATCH_OPTIONS))
    }

    /// Whether every path matches at least one pattern. False for an empty input.
    pub fn matches_all<S: AsRef<str>>(&self, paths: &[S]) -> bool {
        !paths.is_empty() && paths.iter().all(|p| self.matches(p.as_ref()))
    }

    /// Whether at least one path matches at least one pattern.
    pub fn matches_any<S: AsRef<str>>(&self, paths: &[S]) -> bool {
        paths.iter().any(|p| self.matches(p.as_ref()))
    }
}
