//! Whitelist/blacklist rules over catalog format tokens.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FormatRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(flatten)]
    filter: FormatFilter,
}

fn normalize_token(token: &str) -> String {
    token.trim().to_ascii_lowercase()
}

impl FormatFilter {
    pub fn new<I, E, S>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            include: include.into_iter().map(|s| normalize_token(s.as_ref())).collect(),
            exclude: exclude.into_iter().map(|s| normalize_token(s.as_ref())).collect(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: FormatRulesFile = serde_yaml::from_str(text).context("parsing format rules")?;
        Ok(Self::new(file.filter.include, file.filter.exclude))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Accepts when no token is excluded and, if a whitelist is configured,
    /// at least one token is on it.
    pub fn accepts<S: AsRef<str>>(&self, tokens: &[S]) -> bool {
        let tokens = tokens
            .iter()
            .map(|t| normalize_token(t.as_ref()))
            .collect::<Vec<_>>();

        if tokens.iter().any(|t| self.exclude.contains(t)) {
            return false;
        }
        self.include.is_empty() || tokens.iter().any(|t| self.include.contains(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vinyl_only() -> FormatFilter {
        FormatFilter::new(["Vinyl", "LP"], ["Unofficial Release", "Test Pressing"])
    }

    #[test]
    fn whitelist_requires_a_matching_token() {
        let filter = vinyl_only();
        assert!(filter.accepts(&["vinyl", "Album"]));
        assert!(filter.accepts(&[" LP "]));
        assert!(!filter.accepts(&["CD", "Album"]));
        assert!(!filter.accepts::<&str>(&[]));
    }

    #[test]
    fn blacklist_wins_over_whitelist() {
        let filter = vinyl_only();
        assert!(!filter.accepts(&["Vinyl", "Unofficial Release"]));
    }

    #[test]
    fn empty_whitelist_accepts_anything_not_excluded() {
        let filter = FormatFilter::new(Vec::<String>::new(), vec!["Cassette".to_string()]);
        assert!(filter.accepts(&["CD"]));
        assert!(!filter.accepts(&["cassette"]));
    }

    #[test]
    fn rules_load_from_yaml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("formats.yaml");
        std::fs::write(
            &path,
            "version: 1\ninclude:\n  - Vinyl\nexclude:\n  - Promo\n",
        )
        .expect("write rules");

        let filter = FormatFilter::from_yaml_file(&path).expect("load rules");
        assert_eq!(filter.include, vec!["vinyl".to_string()]);
        assert_eq!(filter.exclude, vec!["promo".to_string()]);
    }
}
