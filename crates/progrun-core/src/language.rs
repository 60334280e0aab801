//! Language names as seen by editors and question authors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Backend name to the language it runs.
pub const LANGUAGE_SYNONYMS: &[(&str, &str)] = &[("pyodide", "python"), ("webr", "r")];

/// Canonical language for a backend or language name.
///
/// Names that aren't backends are returned unchanged.
pub fn language_synonym(name: &str) -> &str {
    LANGUAGE_SYNONYMS
        .iter()
        .find(|(backend, _)| *backend == name)
        .map_or(name, |&(_, language)| language)
}

/// Highlighting modes a code editor can be put in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditorLanguage {
    Python,
    R,
    Javascript,
    #[default]
    None,
}

impl EditorLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditorLanguage::Python => "python",
            EditorLanguage::R => "r",
            EditorLanguage::Javascript => "javascript",
            EditorLanguage::None => "none",
        }
    }
}

impl FromStr for EditorLanguage {
    type Err = Error;

    /// Accepts language names and backend names, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match language_synonym(&lower) {
            "python" => Ok(EditorLanguage::Python),
            "r" => Ok(EditorLanguage::R),
            "javascript" | "js" => Ok(EditorLanguage::Javascript),
            "none" | "" => Ok(EditorLanguage::None),
            _ => Err(Error::UnknownLanguage(s.to_string())),
        }
    }
}

impl fmt::Display for EditorLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
