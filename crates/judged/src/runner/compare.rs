//! Output comparison

use serde::{Deserialize, Serialize};

/// How produced output is matched against the expected answer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparisonPolicy {
    /// Ignore trailing whitespace on each line and trailing blank lines
    #[default]
    TrailingWhitespace,
    /// Compare whitespace-separated tokens
    Tokens,
}

impl ComparisonPolicy {
    /// Compare raw output bytes, decoded lossily as UTF-8
    pub fn matches(&self, produced: &[u8], expected: &[u8]) -> bool {
        let produced = String::from_utf8_lossy(produced);
        let expected = String::from_utf8_lossy(expected);
        match self {
            ComparisonPolicy::TrailingWhitespace => compare_lines(&produced, &expected),
            ComparisonPolicy::Tokens => compare_tokens(&produced, &expected),
        }
    }
}

/// Line comparison insensitive to trailing whitespace and trailing blank lines
pub fn compare_lines(actual: &str, expected: &str) -> bool {
    significant_lines(actual) == significant_lines(expected)
}

/// Token comparison; any run of whitespace separates tokens
pub fn compare_tokens(actual: &str, expected: &str) -> bool {
    actual.split_whitespace().eq(expected.split_whitespace())
}

fn significant_lines(s: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = s.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}
