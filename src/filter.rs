//! Regular-expression selection of relative file paths.

use regex::Regex;

use crate::error::{AssetError, Result};

/// Compiled path filter. An empty expression selects everything.
#[derive(Debug, Clone)]
pub struct PathFilter {
    regex: Option<Regex>,
}

impl PathFilter {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Ok(Self { regex: None });
        }
        let regex = Regex::new(pattern).map_err(|source| AssetError::InvalidFilter {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { regex: Some(regex) })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.as_ref().map_or(true, |r| r.is_match(path))
    }

    /// Keep the matching paths, preserving their order.
    pub fn apply(&self, paths: &[String]) -> Vec<String> {
        paths.iter().filter(|p| self.matches(p)).cloned().collect()
    }
}

/// Compile `pattern` and select the matching subsequence of `paths`.
pub fn filter(paths: &[String], pattern: &str) -> Result<Vec<String>> {
    Ok(PathFilter::new(pattern)?.apply(paths))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> Vec<String> {
        ["docs/a.md", "img/logo.png", "README.md", "docs/b.yaml"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn empty_pattern_is_identity() {
        assert_eq!(filter(&paths(), "").unwrap(), paths());
    }

    #[test]
    fn pattern_keeps_matching_subsequence_in_order() {
        assert_eq!(
            filter(&paths(), r"\.md$").unwrap(),
            vec!["docs/a.md".to_string(), "README.md".to_string()]
        );
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = filter(&paths(), "(unclosed").unwrap_err();
        assert!(matches!(err, AssetError::InvalidFilter { .. }));
    }
}
