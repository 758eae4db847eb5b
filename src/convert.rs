//! Pluggable script conversion (e.g. simplified to traditional Chinese)

use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("failed to read conversion table {path}: {source}")]
    Table {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed conversion table line {line}: {content:?}")]
    Malformed { line: usize, content: String },
}

/// Text conversion applied to text nodes and attributes of sites with `s2t` set
pub trait TextConverter: Send + Sync {
    fn convert(&self, text: &str) -> Result<String, ConvertError>;
}

/// Leaves text untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl TextConverter for Passthrough {
    fn convert(&self, text: &str) -> Result<String, ConvertError> {
        Ok(text.to_string())
    }
}

/// Character-for-character mapping loaded from a table file.
///
/// Each non-empty line holds a source and target character, either adjacent
/// (`简簡`) or separated by whitespace. Lines starting with `#` are comments.
#[derive(Debug, Default, Clone)]
pub struct CharTableConverter {
    table: HashMap<char, char>,
}

impl CharTableConverter {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (char, char)>) -> Self {
        Self {
            table: pairs.into_iter().collect(),
        }
    }

    pub fn parse(content: &str) -> Result<Self, ConvertError> {
        let mut table = HashMap::new();
        for (i, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let chars: Vec<char> = line.chars().filter(|c| !c.is_whitespace()).collect();
            match chars.as_slice() {
                [from, to] => {
                    table.insert(*from, *to);
                }
                _ => {
                    return Err(ConvertError::Malformed {
                        line: i + 1,
                        content: line.to_string(),
                    })
                }
            }
        }
        Ok(Self { table })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConvertError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConvertError::Table {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl TextConverter for CharTableConverter {
    fn convert(&self, text: &str) -> Result<String, ConvertError> {
        Ok(text
            .chars()
            .map(|c| self.table.get(&c).copied().unwrap_or(c))
            .collect())
    }
}
