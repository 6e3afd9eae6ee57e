//! Metadata extraction from script comment headers.
//!
//! Scripts declare metadata in `@key: value` comment lines near the top
//! of the file:
//!
//! ```text
//! # @description: Nightly backtest runner
//! # @version: 1.2.0
//! # @tags: trading, nightly
//! # @requires: pandas, requests
//! ```
//!
//! Extraction never fails a sync: missing or malformed lines fall back to
//! defaults.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How far into the file we look for `@key:` lines.
const HEADER_SCAN_LINES: usize = 50;

/// Matches `# @key: value` and `// @key: value` comment lines.
static META_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:#|//)\s*@([a-z_]+)\s*:\s*(.+?)\s*$").expect("static regex")
});

/// Metadata extracted from a script header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub author: String,
    /// Explicit `@group:` override; the sync manager hoists this into the
    /// manifest record's own `group` field, so it is never serialized.
    #[serde(skip)]
    pub group: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

impl ScriptMetadata {
    /// Parse metadata out of script content. Unknown keys are ignored,
    /// duplicate keys keep the first occurrence.
    pub fn extract(content: &str) -> Self {
        let mut meta = Self {
            version: default_version(),
            ..Self::default()
        };
        let mut seen_version = false;

        for line in content.lines().take(HEADER_SCAN_LINES) {
            let Some(caps) = META_LINE.captures(line) else {
                continue;
            };
            let key = &caps[1];
            let value = caps[2].trim();

            match key {
                "description" if meta.description.is_empty() => {
                    meta.description = value.to_string();
                }
                "version" if !seen_version => {
                    // Versions must contain at least one digit to count.
                    if value.chars().any(|c| c.is_ascii_digit()) {
                        meta.version = value.to_string();
                        seen_version = true;
                    }
                }
                "author" if meta.author.is_empty() => {
                    meta.author = value.to_string();
                }
                "group" if meta.group.is_none() => {
                    meta.group = Some(value.to_string());
                }
                "tags" if meta.tags.is_empty() => {
                    meta.tags = split_list(value);
                }
                "requires" if meta.requires.is_empty() => {
                    meta.requires = split_list(value);
                }
                _ => {}
            }
        }

        meta
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
