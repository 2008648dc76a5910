//! Dependency version ranges
//!
//! Ranges are checked with `semver::VersionReq`. Manifests written for
//! npm-style tooling are accepted too: `||` alternatives, space-separated
//! comparators, `x` wildcards and `a - b` hyphen ranges are rewritten into
//! the comparator syntax `semver` understands. A bare version such as
//! `1.2.3` keeps Cargo's caret meaning.

use semver::{Version, VersionReq};
use std::fmt;

const OPERATORS: [&str; 7] = [">=", "<=", ">", "<", "=", "^", "~"];

/// A set of alternative requirements; matches if any alternative does
#[derive(Debug, Clone)]
pub struct VersionRange {
    source: String,
    alternatives: Vec<VersionReq>,
}

impl VersionRange {
    pub fn parse(range: &str) -> Result<Self, semver::Error> {
        let alternatives = range
            .split("||")
            .map(|alternative| VersionReq::parse(&normalize(alternative)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: range.trim().to_string(),
            alternatives,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    /// True for ranges that accept every version
    pub fn is_any(&self) -> bool {
        self.alternatives.iter().any(|req| *req == VersionReq::STAR)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.source.is_empty() {
            f.write_str("*")
        } else {
            f.write_str(&self.source)
        }
    }
}

/// Parse a module version, filling in missing minor/patch components
pub fn parse_version(version: &str) -> Result<Version, semver::Error> {
    let version = strip_v(version.trim());
    let split_at = version.find(['-', '+']).unwrap_or(version.len());
    let (core, suffix) = version.split_at(split_at);
    let padded = match core.matches('.').count() {
        0 => format!("{}.0.0{}", core, suffix),
        1 => format!("{}.0{}", core, suffix),
        _ => version.to_string(),
    };
    Version::parse(&padded)
}

fn strip_v(s: &str) -> &str {
    s.strip_prefix('v')
        .or_else(|| s.strip_prefix('V'))
        .unwrap_or(s)
}

fn normalize(alternative: &str) -> String {
    let alternative = alternative.trim();
    if alternative.is_empty() || alternative == "latest" {
        return "*".to_string();
    }

    if let Some((low, high)) = alternative.split_once(" - ") {
        return format!(
            ">={}, <={}",
            comparator("", low.trim()),
            comparator("", high.trim())
        )
        .replace(">=*", "*")
        .replace("<=*", "*");
    }

    let mut comparators = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in alternative
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
    {
        if OPERATORS.contains(&token) {
            pending_op = Some(token);
            continue;
        }
        let (op, version) = match pending_op.take() {
            Some(op) => (op, token),
            None => split_operator(token),
        };
        comparators.push(comparator(op, version));
    }
    if comparators.is_empty() {
        return "*".to_string();
    }
    comparators.join(", ")
}

fn split_operator(token: &str) -> (&str, &str) {
    let version_start = token
        .find(|c: char| !matches!(c, '>' | '<' | '=' | '^' | '~'))
        .unwrap_or(token.len());
    token.split_at(version_start)
}

/// Render one comparator; wildcard components end the version
fn comparator(op: &str, version: &str) -> String {
    let version = strip_v(version);
    let mut parts = Vec::new();
    let mut wildcard = false;
    for part in version.split('.') {
        if matches!(part, "x" | "X" | "*") {
            wildcard = true;
            break;
        }
        parts.push(part);
    }
    let op = if op == "==" { "=" } else { op };
    match (parts.is_empty(), wildcard, op.is_empty()) {
        (true, _, _) => "*".to_string(),
        (false, true, true) => format!("{}.*", parts.join(".")),
        _ => format!("{}{}", op, parts.join(".")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(range: &str, version: &str) -> bool {
        VersionRange::parse(range)
            .unwrap()
            .matches(&parse_version(version).unwrap())
    }

    #[test]
    fn test_wildcards_match_everything() {
        for range in ["", "*", "latest", "x", "  "] {
            assert!(matches(range, "0.0.1"), "{:?}", range);
            assert!(matches(range, "12.3.4"), "{:?}", range);
            assert!(VersionRange::parse(range).unwrap().is_any());
        }
    }

    #[test]
    fn test_cargo_style_ranges() {
        assert!(matches("^1.2", "1.9.0"));
        assert!(!matches("^1.2", "2.0.0"));
        assert!(matches("~1.2.3", "1.2.9"));
        assert!(!matches("~1.2.3", "1.3.0"));
        assert!(matches(">=1.0, <2.0", "1.5.0"));
    }

    #[test]
    fn test_npm_style_ranges() {
        assert!(matches(">=1.0.0 <2.0.0", "1.5.0"));
        assert!(!matches(">=1.0.0 <2.0.0", "2.0.0"));
        assert!(matches(">= 1.2", "1.3.0"));
        assert!(matches("1.x", "1.7.2"));
        assert!(!matches("1.x", "2.0.0"));
        assert!(matches("1.2.x", "1.2.5"));
        assert!(matches("1.0.0 - 2.0.0", "2.0.0"));
        assert!(!matches("1.0.0 - 2.0.0", "2.0.1"));
        assert!(matches("^1.0.0 || ^3.0.0", "3.1.0"));
        assert!(!matches("^1.0.0 || ^3.0.0", "2.1.0"));
    }

    #[test]
    fn test_lenient_versions() {
        assert_eq!(parse_version("v2").unwrap(), Version::new(2, 0, 0));
        assert_eq!(parse_version("1.4").unwrap(), Version::new(1, 4, 0));
        assert_eq!(
            parse_version("1.4-beta.1").unwrap().pre.as_str(),
            "beta.1"
        );
        assert!(parse_version("one").is_err());
    }

    #[test]
    fn test_garbage_range_is_an_error() {
        assert!(VersionRange::parse(">=banana").is_err());
    }
}
