//! Blob path patterns: `container/prefix/{name}.{ext}`.
//!
//! The container segment is literal. The blob-name template may contain named
//! wildcards in braces; each wildcard matches one or more characters (including
//! `/`) and its value is returned as a binding. A pattern with no blob-name
//! template (`"container"` or `"container/"`) matches every blob in the container.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use crate::error::{RelayError, Result};
use crate::types::BlobPath;

/// Immutable, compiled blob path pattern.
#[derive(Debug, Clone)]
pub struct BlobPathSource {
    pattern: String,
    container: String,
    parameters: Vec<String>,
    matcher: Regex,
}

impl BlobPathSource {
    /// Parse and compile a pattern.
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| RelayError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let (container, template) = match pattern.split_once('/') {
            Some((c, t)) => (c, t),
            None => (pattern, ""),
        };
        if container.is_empty() {
            return Err(invalid("container name is empty"));
        }
        if container.contains('{') || container.contains('}') {
            return Err(invalid("container name cannot contain wildcards"));
        }

        let mut parameters = Vec::new();
        let mut regex_src = String::from("^");
        if template.is_empty() {
            regex_src.push_str(".+");
        }

        let mut rest = template;
        while !rest.is_empty() {
            match rest.find(['{', '}']) {
                None => {
                    regex_src.push_str(&regex::escape(rest));
                    rest = "";
                }
                Some(idx) => {
                    if rest.as_bytes()[idx] == b'}' {
                        return Err(invalid("unmatched '}'"));
                    }
                    regex_src.push_str(&regex::escape(&rest[..idx]));
                    let after = &rest[idx + 1..];
                    let close = after.find('}').ok_or_else(|| invalid("unclosed '{'"))?;
                    let name = &after[..close];
                    if !is_identifier(name) {
                        return Err(invalid(&format!("'{name}' is not a valid parameter name")));
                    }
                    if parameters.iter().any(|p| p == name) {
                        return Err(invalid(&format!("parameter '{name}' appears twice")));
                    }
                    regex_src.push_str(&format!("(?P<{name}>.+?)"));
                    parameters.push(name.to_string());
                    rest = &after[close + 1..];
                }
            }
        }
        regex_src.push('$');

        let matcher = Regex::new(&regex_src).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            pattern: pattern.to_string(),
            container: container.to_string(),
            parameters,
            matcher,
        })
    }

    /// The literal container this pattern watches.
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Wildcard names in declaration order.
    pub fn parameter_names(&self) -> &[String] {
        &self.parameters
    }

    /// Match a concrete path, returning the wildcard bindings.
    pub fn bind(&self, path: &BlobPath) -> Option<HashMap<String, String>> {
        if path.container != self.container {
            return None;
        }
        let captures = self.matcher.captures(&path.name)?;
        Some(
            self.parameters
                .iter()
                .filter_map(|p| captures.name(p).map(|m| (p.clone(), m.as_str().to_string())))
                .collect(),
        )
    }

    pub fn is_match(&self, path: &BlobPath) -> bool {
        path.container == self.container && self.matcher.is_match(&path.name)
    }
}

impl fmt::Display for BlobPathSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_bindings() {
        let source = BlobPathSource::parse("input/{name}.{ext}").unwrap();
        assert_eq!(source.container(), "input");
        assert_eq!(source.parameter_names(), &["name".to_string(), "ext".to_string()]);

        let bindings = source.bind(&BlobPath::new("input", "report.csv")).unwrap();
        assert_eq!(bindings["name"], "report");
        assert_eq!(bindings["ext"], "csv");
    }

    #[test]
    fn test_literal_and_container_mismatch() {
        let source = BlobPathSource::parse("input/Blob1").unwrap();
        assert!(source.is_match(&BlobPath::new("input", "Blob1")));
        assert!(!source.is_match(&BlobPath::new("input", "Blob2")));
        assert!(!source.is_match(&BlobPath::new("output", "Blob1")));
    }

    #[test]
    fn test_container_only_matches_everything() {
        let source = BlobPathSource::parse("logs").unwrap();
        assert!(source.is_match(&BlobPath::new("logs", "2026/10/19/app.log")));
        let source = BlobPathSource::parse("logs/").unwrap();
        assert!(source.is_match(&BlobPath::new("logs", "a")));
    }

    #[test]
    fn test_wildcard_spans_directories_and_escapes_literals() {
        let source = BlobPathSource::parse("data/in.{dir}/x+y").unwrap();
        let bindings = source.bind(&BlobPath::new("data", "in.a/b/x+y")).unwrap();
        assert_eq!(bindings["dir"], "a/b");
        assert!(!source.is_match(&BlobPath::new("data", "inXa/x+y")));
    }

    #[test]
    fn test_invalid_patterns() {
        for bad in ["", "/blob", "{c}/blob", "c/{unclosed", "c/closed}", "c/{1abc}", "c/{a}{a}"] {
            assert!(BlobPathSource::parse(bad).is_err(), "pattern {bad:?} should fail");
        }
    }
}
