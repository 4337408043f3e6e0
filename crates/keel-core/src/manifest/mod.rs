//! Bundle manifest parsing.
//!
//! `META-INF/MANIFEST.MF` holds `Name: value` headers in its main section.
//! Lines longer than the writer's limit continue on the next line, which then
//! starts with a single space. The main section ends at the first blank line;
//! per-entry sections after it are not used by the runtime.

pub mod bundle;
pub mod clause;

pub use bundle::{BundleManifest, ExportSpec, HostSpec, ImportSpec, RequireSpec};
pub use clause::{parse_clauses, Clause};

use crate::core::error::{KeelError, KeelResult};

/// Location of the manifest inside a bundle.
pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

/// Raw header map, in file order, with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    headers: Vec<(String, String)>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> KeelResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| KeelError::Manifest(format!("Manifest is not UTF-8: {}", e)))?;

        let mut headers: Vec<(String, String)> = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }

            if let Some(rest) = line.strip_prefix(' ') {
                let last = headers.last_mut().ok_or_else(|| {
                    KeelError::Manifest(format!(
                        "Continuation line {} without a header",
                        lineno + 1
                    ))
                })?;
                last.1.push_str(rest);
                continue;
            }

            let (name, value) = line.split_once(':').ok_or_else(|| {
                KeelError::Manifest(format!("Line {} is not a header: '{}'", lineno + 1, line))
            })?;
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(KeelError::Manifest(format!(
                    "Invalid header name on line {}",
                    lineno + 1
                )));
            }
            if headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)) {
                return Err(KeelError::Manifest(format!("Duplicate header '{}'", name)));
            }
            headers.push((name.to_string(), value.trim_start().to_string()));
        }

        Ok(Self { headers })
    }

    pub fn from_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Render back to manifest text, wrapping lines at 72 bytes.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.headers {
            let line = format!("{}: {}", name, value);
            let mut first = true;
            let mut rest = line.as_str();
            while !rest.is_empty() {
                let limit = if first { 72 } else { 71 };
                let mut cut = rest.len().min(limit);
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                if !first {
                    out.push(' ');
                }
                out.push_str(&rest[..cut]);
                out.push_str("\r\n");
                rest = &rest[cut..];
                first = false;
            }
        }
        out.push_str("\r\n");
        out
    }
}
