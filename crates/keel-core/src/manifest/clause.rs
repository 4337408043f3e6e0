//! Header value grammar: `clause ( ',' clause )*` where a clause is
//! `name ( ';' name )* ( ';' param )*` and a param is either an attribute
//! `key=value` or a directive `key:=value`. Values may be double-quoted.

use crate::core::error::{KeelError, KeelResult};
use std::collections::BTreeMap;

/// One parsed clause of a header value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Clause {
    pub names: Vec<String>,
    pub attributes: BTreeMap<String, String>,
    pub directives: BTreeMap<String, String>,
}

impl Clause {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn directive(&self, key: &str) -> Option<&str> {
        self.directives.get(key).map(String::as_str)
    }

    /// Comma-separated directive value split into trimmed items.
    pub fn directive_list(&self, key: &str) -> Vec<String> {
        self.directive(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parse a full header value into clauses.
pub fn parse_clauses(header: &str, value: &str) -> KeelResult<Vec<Clause>> {
    let mut clauses = Vec::new();

    for raw in split_unquoted(value, ',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let mut clause = Clause::default();
        for piece in split_unquoted(raw, ';') {
            let piece = piece.trim();
            if piece.is_empty() {
                return Err(KeelError::Manifest(format!(
                    "{}: empty element in clause '{}'",
                    header, raw
                )));
            }

            match piece.find('=') {
                None => {
                    if !clause.attributes.is_empty() || !clause.directives.is_empty() {
                        return Err(KeelError::Manifest(format!(
                            "{}: name '{}' follows parameters in clause '{}'",
                            header, piece, raw
                        )));
                    }
                    clause.names.push(unquote(piece).to_string());
                }
                Some(eq) => {
                    let (key, is_directive) = match piece[..eq].strip_suffix(':') {
                        Some(key) => (key.trim(), true),
                        None => (piece[..eq].trim(), false),
                    };
                    if key.is_empty() {
                        return Err(KeelError::Manifest(format!(
                            "{}: parameter without a key in clause '{}'",
                            header, raw
                        )));
                    }
                    let value = unquote(piece[eq + 1..].trim()).to_string();
                    let target = if is_directive {
                        &mut clause.directives
                    } else {
                        &mut clause.attributes
                    };
                    if target.insert(key.to_string(), value).is_some() {
                        return Err(KeelError::Manifest(format!(
                            "{}: duplicate parameter '{}' in clause '{}'",
                            header, key, raw
                        )));
                    }
                }
            }
        }

        if clause.names.is_empty() {
            return Err(KeelError::Manifest(format!(
                "{}: clause '{}' has no name",
                header, raw
            )));
        }
        clauses.push(clause);
    }

    Ok(clauses)
}

fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == sep && !in_quotes {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_clause() {
        let clauses = parse_clauses("Export-Package", "org.example.api;version=1.2").unwrap();
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0].names, vec!["org.example.api"]);
        assert_eq!(clauses[0].attribute("version"), Some("1.2"));
    }

    #[test]
    fn test_parse_quoted_values_keep_commas() {
        let clauses = parse_clauses(
            "Import-Package",
            "a;version=\"[1.0,2.0)\";resolution:=optional,b",
        )
        .unwrap();
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[0].attribute("version"), Some("[1.0,2.0)"));
        assert_eq!(clauses[0].directive("resolution"), Some("optional"));
        assert_eq!(clauses[1].names, vec!["b"]);
    }

    #[test]
    fn test_parse_shared_parameters() {
        let clauses = parse_clauses(
            "Export-Package",
            "p.one;p.two;version=2.0;uses:=\"q,r\"",
        )
        .unwrap();
        assert_eq!(clauses[0].names, vec!["p.one", "p.two"]);
        assert_eq!(clauses[0].directive_list("uses"), vec!["q", "r"]);
    }

    #[test]
    fn test_parse_rejects_name_after_parameter() {
        assert!(parse_clauses("Export-Package", "a;version=1;b").is_err());
    }

    #[test]
    fn test_parse_rejects_duplicate_parameter() {
        assert!(parse_clauses("Export-Package", "a;version=1;version=2").is_err());
    }
}
