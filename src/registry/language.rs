//! Script language detection.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Languages the registry recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptLanguage {
    Python,
    Shell,
    Javascript,
    Typescript,
    Unknown,
}

impl ScriptLanguage {
    /// Detect a language from the file extension, falling back to the
    /// shebang line for extensionless scripts.
    pub fn detect(path: &Path, first_line: &str) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("py") => return Self::Python,
            Some("sh") | Some("bash") | Some("zsh") => return Self::Shell,
            Some("js") | Some("mjs") => return Self::Javascript,
            Some("ts") => return Self::Typescript,
            Some(_) => return Self::Unknown,
            None => {}
        }
        Self::from_shebang(first_line)
    }

    /// Classify by shebang: `#!/usr/bin/env python3`, `#!/bin/bash`, etc.
    pub fn from_shebang(line: &str) -> Self {
        let line = line.trim();
        if !line.starts_with("#!") {
            return Self::Unknown;
        }
        if line.contains("python") {
            Self::Python
        } else if line.contains("bash") || line.contains("zsh") || line.ends_with("/sh") {
            Self::Shell
        } else if line.contains("node") {
            Self::Javascript
        } else {
            Self::Unknown
        }
    }

    /// Whether the scanner should pick up files of this language.
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Interpreter invocation for running a script of this language:
    /// program plus any leading arguments before the script path.
    pub fn interpreter(&self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            Self::Python => Some(("python3", &[])),
            Self::Shell => Some(("bash", &[])),
            Self::Javascript => Some(("node", &[])),
            Self::Typescript => Some(("npx", &["tsx"])),
            Self::Unknown => None,
        }
    }

    /// Extensions the directory scanner looks for.
    pub fn recognized_extensions() -> &'static [&'static str] {
        &["py", "sh", "bash", "zsh", "js", "mjs", "ts"]
    }
}

impl std::fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Python => "python",
            Self::Shell => "shell",
            Self::Javascript => "javascript",
            Self::Typescript => "typescript",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}
