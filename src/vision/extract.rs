//! Region text extraction
//!
//! Reads the name and collector-number bands of a canonical card and turns
//! the raw recognizer output into a cleaned (name, number) pair.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::catalog::SpeciesList;
use crate::config::RegionConfig;
use crate::vision::ocr::TextRecognizer;
use crate::vision::ocr_preprocess::prepare_band;
use crate::vision::rectify::CanonicalCard;

/// "036/191" style collector numbers
static FRACTION_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{1,3}/\d{1,3}").unwrap());
/// Promo style numbers such as "SV123" or "SWSH045"
static PROMO_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9]{2,5}\d{1,3}").unwrap());

/// Longest edit distance tolerated between an OCR'd word and a species name
const MAX_SPECIES_DISTANCE: usize = 1;
/// Shorter words are never fuzzy-matched
const MIN_FUZZY_WORD_LEN: usize = 3;

/// Cleaned text read from one canonical card
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedText {
    /// Species name or cleaned name text; empty when unreadable
    pub name: String,
    /// Collector number; `None` when no pattern matched
    pub number: Option<String>,
}

impl ExtractedText {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.number.is_none()
    }
}

/// Crops the text bands of a canonical card and runs them through the recognizer
pub struct RegionTextExtractor {
    recognizer: Arc<dyn TextRecognizer>,
    species: SpeciesList,
    config: RegionConfig,
}

impl RegionTextExtractor {
    pub fn new(recognizer: Arc<dyn TextRecognizer>, species: SpeciesList, config: RegionConfig) -> Self {
        Self {
            recognizer,
            species,
            config,
        }
    }

    /// Read name and number from the card.
    ///
    /// Recognizer failures are logged and treated as empty text; the result
    /// then simply comes back inconclusive.
    pub async fn extract(&self, card: &CanonicalCard) -> ExtractedText {
        let start = Instant::now();

        let name_image = prepare_band(
            card.image(),
            &self.config.name_band,
            self.config.upscale,
            self.config.binarize_threshold,
        );
        let number_image = prepare_band(
            card.image(),
            &self.config.number_band,
            self.config.upscale,
            self.config.binarize_threshold,
        );

        let raw_name = match self
            .recognizer
            .recognize(&name_image, &self.config.name_whitelist, true)
            .await
        {
            Ok(text) => normalize_whitespace(&text),
            Err(e) => {
                warn!("Name band recognition failed: {}", e);
                String::new()
            }
        };
        let raw_number = match self
            .recognizer
            .recognize(&number_image, &self.config.number_whitelist, true)
            .await
        {
            Ok(text) => normalize_whitespace(&text),
            Err(e) => {
                warn!("Number band recognition failed: {}", e);
                String::new()
            }
        };

        let extracted = ExtractedText {
            name: resolve_name(&raw_name, &self.species),
            number: parse_number(&raw_number),
        };

        debug!(
            "Extracted {:?} (raw name {:?}, raw number {:?}) in {:?}",
            extracted,
            raw_name,
            raw_number,
            start.elapsed()
        );

        extracted
    }
}

/// Collapse runs of whitespace into single spaces and trim
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Map a raw name fragment onto a known species.
///
/// Exact case-insensitive word matches are preferred over any fuzzy match;
/// fuzzy matching accepts one edit. When nothing matches, raw text longer
/// than two characters is kept as letters and spaces only.
pub fn resolve_name(raw: &str, species: &SpeciesList) -> String {
    let words: Vec<&str> = raw
        .split(|c: char| c.is_whitespace() || c == '-')
        .map(|w| w.trim_matches(|c: char| !c.is_alphabetic()))
        .filter(|w| !w.is_empty())
        .collect();

    if let Some(name) = words.iter().find_map(|w| species.find_exact(w)) {
        return name.to_string();
    }

    let fuzzy = words
        .iter()
        .filter(|w| w.chars().count() >= MIN_FUZZY_WORD_LEN)
        .find_map(|w| species.find_fuzzy(w, MAX_SPECIES_DISTANCE));
    if let Some(name) = fuzzy {
        return name.to_string();
    }

    if raw.chars().count() > 2 {
        let letters: String = raw
            .chars()
            .map(|c| if c.is_alphabetic() { c } else { ' ' })
            .collect();
        return normalize_whitespace(&letters);
    }

    String::new()
}

/// Pull a collector number out of the raw number fragment
pub fn parse_number(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }

    FRACTION_NUMBER
        .find(&compact)
        .or_else(|| PROMO_NUMBER.find(&compact))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::ocr::RecognizeError;
    use async_trait::async_trait;
    use image::{GrayImage, Rgb, RgbImage};
    use parking_lot::Mutex;

    fn species() -> SpeciesList {
        SpeciesList::new(["Pikachu", "Vikavolt", "Latias", "Mew", "Eevee"])
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  Pika\tchu \n ex "), "Pika chu ex");
        assert_eq!(normalize_whitespace("   "), "");
    }

    #[test]
    fn test_resolve_name_exact_word() {
        assert_eq!(resolve_name("Basic VIKAVOLT", &species()), "Vikavolt");
        assert_eq!(resolve_name("Latias ex", &species()), "Latias");
    }

    #[test]
    fn test_resolve_name_exact_beats_fuzzy() {
        // "Mev" is one edit from "Mew" but "Eevee" matches exactly
        assert_eq!(resolve_name("Mev Eevee", &species()), "Eevee");
    }

    #[test]
    fn test_resolve_name_fuzzy() {
        assert_eq!(resolve_name("Pikachv ex", &species()), "Pikachu");
        assert_eq!(resolve_name("Vikavoit", &species()), "Vikavolt");
    }

    #[test]
    fn test_resolve_name_fallback_to_letters() {
        assert_eq!(resolve_name("Archa1udon", &species()), "Archa udon");
        assert_eq!(resolve_name("Zz", &species()), "");
        assert_eq!(resolve_name("", &species()), "");
    }

    #[test]
    fn test_short_words_are_not_fuzzy_matched() {
        // "Me" is one edit from "Mew" but too short to trust
        assert_eq!(resolve_name("Me", &species()), "");
    }

    #[test]
    fn test_parse_number_fraction() {
        assert_eq!(parse_number("036/191"), Some("036/191".to_string()));
        assert_eq!(parse_number("SSP EN 036 / 191"), Some("036/191".to_string()));
        assert_eq!(parse_number("7/99"), Some("7/99".to_string()));
    }

    #[test]
    fn test_parse_number_promo() {
        assert_eq!(parse_number("SV123"), Some("SV123".to_string()));
    }

    #[test]
    fn test_parse_number_unknown() {
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("A"), None);
        assert_eq!(parse_number("//"), None);
    }

    /// Replays canned answers, one per call
    struct ScriptedRecognizer {
        answers: Mutex<Vec<Result<String, RecognizeError>>>,
        whitelists: Mutex<Vec<String>>,
    }

    impl ScriptedRecognizer {
        fn new(answers: Vec<Result<String, RecognizeError>>) -> Self {
            Self {
                answers: Mutex::new(answers),
                whitelists: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TextRecognizer for ScriptedRecognizer {
        async fn recognize(
            &self,
            image: &GrayImage,
            whitelist: &str,
            single_line: bool,
        ) -> Result<String, RecognizeError> {
            assert!(single_line);
            assert!(image.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
            self.whitelists.lock().push(whitelist.to_string());
            let mut answers = self.answers.lock();
            if answers.is_empty() {
                Ok(String::new())
            } else {
                answers.remove(0)
            }
        }
    }

    fn blank_card() -> CanonicalCard {
        CanonicalCard::new(RgbImage::from_pixel(400, 560, Rgb([230, 230, 230])))
    }

    #[tokio::test]
    async fn test_extract_reads_both_bands() {
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![
            Ok("  Vikavolt \n".to_string()),
            Ok("019 /191".to_string()),
        ]));
        let config = RegionConfig::default();
        let extractor = RegionTextExtractor::new(recognizer.clone(), species(), config.clone());

        let extracted = extractor.extract(&blank_card()).await;
        assert_eq!(extracted.name, "Vikavolt");
        assert_eq!(extracted.number.as_deref(), Some("019/191"));

        let whitelists = recognizer.whitelists.lock();
        assert_eq!(whitelists.as_slice(), &[config.name_whitelist, config.number_whitelist]);
    }

    #[tokio::test]
    async fn test_extract_survives_recognizer_failure() {
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![
            Err(RecognizeError::Engine("crashed".to_string())),
            Ok(String::new()),
        ]));
        let extractor = RegionTextExtractor::new(recognizer, species(), RegionConfig::default());

        let extracted = extractor.extract(&blank_card()).await;
        assert!(extracted.is_empty());
    }
}
