//! Card catalog and species list
//!
//! Both are loaded once at startup and never mutated afterwards. Entries are
//! kept in their original order because the matcher breaks ties by position.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

const SAMPLE_CATALOG: &str = include_str!("../../data/sample_catalog.json");
const SPECIES_LIST: &str = include_str!("../../data/species.txt");

/// Catalog loading failure
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("catalog is empty")]
    Empty,
}

/// A known card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub set: String,
    /// Collector number, usually "NNN/TTT"
    pub number: String,
    pub rarity: String,
    #[serde(rename = "type")]
    pub card_type: String,
    pub hp: Option<u16>,
    /// Reference to the card artwork
    pub image_ref: String,
}

/// Immutable, ordered table of known cards for one set
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Build from entries in catalog order
    pub fn new(entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        if entries.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(Self { entries })
    }

    /// Parse a JSON array of entries
    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let entries: Vec<CatalogEntry> = serde_json::from_str(json)?;
        Self::new(entries)
    }

    /// Load a JSON catalog file
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_json_str(&content)?;
        info!("Loaded {} catalog entries from {:?}", catalog.len(), path);
        Ok(catalog)
    }

    /// The catalog bundled with the crate
    pub fn sample() -> Result<Self, CatalogError> {
        Self::from_json_str(SAMPLE_CATALOG)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&CatalogEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Known species names used to repair OCR'd name fragments
#[derive(Debug, Clone)]
pub struct SpeciesList {
    names: Vec<String>,
    /// Lowercased copies, same indices as `names`
    folded: Vec<String>,
}

impl SpeciesList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self {
            names: Vec::new(),
            folded: Vec::new(),
        };
        for name in names {
            let name: String = name.into();
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let folded = name.to_lowercase();
            if !list.folded.contains(&folded) {
                list.names.push(name.to_string());
                list.folded.push(folded);
            }
        }
        list
    }

    /// The bundled species list
    pub fn builtin() -> Self {
        Self::new(SPECIES_LIST.lines())
    }

    /// Species derived from the first word of every catalog entry
    pub fn from_catalog(catalog: &Catalog) -> Self {
        Self::new(
            catalog
                .entries()
                .iter()
                .filter_map(|entry| entry.name.split_whitespace().next()),
        )
    }

    /// Merge another list into this one, keeping first-seen order
    pub fn extend(&mut self, other: &SpeciesList) {
        for name in &other.names {
            let folded = name.to_lowercase();
            if !self.folded.contains(&folded) {
                self.names.push(name.clone());
                self.folded.push(folded);
            }
        }
    }

    /// Case-insensitive exact lookup, returning the canonical spelling
    pub fn find_exact(&self, word: &str) -> Option<&str> {
        let folded = word.to_lowercase();
        self.folded
            .iter()
            .position(|candidate| *candidate == folded)
            .map(|i| self.names[i].as_str())
    }

    /// First species within `max_distance` edits of `word` (case-insensitive)
    pub fn find_fuzzy(&self, word: &str, max_distance: usize) -> Option<&str> {
        let folded = word.to_lowercase();
        self.folded
            .iter()
            .position(|candidate| strsim::levenshtein(candidate, &folded) <= max_distance)
            .map(|i| self.names[i].as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
