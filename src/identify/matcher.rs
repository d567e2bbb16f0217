//! Weighted catalog matching
//!
//! Scores an extracted (name, number) pair against every catalog entry and
//! keeps the best one above the confidence floor.

use tracing::debug;

use crate::catalog::{Catalog, CatalogEntry};
use crate::config::MatcherSettings;
use crate::vision::extract::ExtractedText;

const EXACT_NUMBER_SCORE: u32 = 10;
const PARTIAL_NUMBER_SCORE: u32 = 5;
const EXACT_NAME_SCORE: u32 = 8;
const PARTIAL_NAME_SCORE: u32 = 4;

/// Best-scoring catalog entry for a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogMatch<'a> {
    pub entry: &'a CatalogEntry,
    /// Position in catalog order
    pub index: usize,
    pub score: u32,
}

#[derive(Debug, Clone)]
pub struct CatalogMatcher {
    min_score: u32,
}

impl CatalogMatcher {
    pub fn new(settings: &MatcherSettings) -> Self {
        Self {
            min_score: settings.min_score,
        }
    }

    /// Best entry scoring at least the floor; ties keep the earliest entry
    pub fn find<'a>(&self, extracted: &ExtractedText, catalog: &'a Catalog) -> Option<CatalogMatch<'a>> {
        if extracted.is_empty() {
            return None;
        }

        let mut best: Option<CatalogMatch<'a>> = None;
        for (index, entry) in catalog.entries().iter().enumerate() {
            let score = score_entry(extracted, entry);
            if best.map(|b| score > b.score).unwrap_or(true) {
                best = Some(CatalogMatch { entry, index, score });
            }
        }

        let best = best.filter(|b| b.score >= self.min_score);
        debug!(
            "Catalog match for {:?}: {:?}",
            extracted,
            best.map(|b| (&b.entry.name, &b.entry.number, b.score))
        );
        best
    }
}

/// Additive score of one catalog entry
pub fn score_entry(extracted: &ExtractedText, entry: &CatalogEntry) -> u32 {
    let mut score = 0;

    if let Some(number) = &extracted.number {
        let candidate = normalize_number(number);
        let known = normalize_number(&entry.number);
        if !candidate.is_empty() && candidate == known {
            score += EXACT_NUMBER_SCORE;
        } else if !candidate.is_empty() && numerator(&candidate) == numerator(&known) {
            score += PARTIAL_NUMBER_SCORE;
        }
    }

    let name = extracted.name.trim().to_lowercase();
    let known = entry.name.trim().to_lowercase();
    if !name.is_empty() && !known.is_empty() {
        if name == known {
            score += EXACT_NAME_SCORE;
        } else if name.contains(&known) || known.contains(&name) {
            score += PARTIAL_NAME_SCORE;
        }
    }

    score
}

fn normalize_number(number: &str) -> String {
    number.chars().filter(|c| !c.is_whitespace()).collect()
}

fn numerator(number: &str) -> &str {
    number.split('/').next().unwrap_or(number)
}
