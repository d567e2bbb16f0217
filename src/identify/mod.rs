//! Card identification: local catalog matching and the cloud fallback

pub mod cloud;
pub mod dispatcher;
pub mod matcher;

pub use cloud::{CloudCard, CloudError, CloudIdentifier, CloudRequest, HttpCloudIdentifier};
pub use dispatcher::CloudDispatcher;
pub use matcher::{CatalogMatch, CatalogMatcher};

use serde::{Deserialize, Serialize};

use crate::catalog::CatalogEntry;

/// Where an identification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceSource {
    Local,
    Cloud,
}

/// A finished identification, handed to the consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentificationResult {
    pub name: String,
    pub set: String,
    pub number: String,
    pub rarity: String,
    pub card_type: String,
    pub hp: Option<u16>,
    pub source: ConfidenceSource,
    /// Artwork reference for local hits, source page for cloud hits
    pub image_ref: Option<String>,
    /// Only reported by the cloud service
    pub market_value: Option<f64>,
}

impl IdentificationResult {
    pub fn from_entry(entry: &CatalogEntry) -> Self {
        Self {
            name: entry.name.clone(),
            set: entry.set.clone(),
            number: entry.number.clone(),
            rarity: entry.rarity.clone(),
            card_type: entry.card_type.clone(),
            hp: entry.hp,
            source: ConfidenceSource::Local,
            image_ref: Some(entry.image_ref.clone()),
            market_value: None,
        }
    }

    /// Convert a cloud reply; fails when it carries no usable name
    pub fn from_cloud(card: &CloudCard) -> Result<Self, CloudError> {
        let name = card.usable_name().ok_or(CloudError::NoUsableName)?;
        let field = |value: &Option<String>| value.as_deref().map(str::trim).unwrap_or_default().to_string();
        Ok(Self {
            name: name.to_string(),
            set: field(&card.set),
            number: field(&card.number),
            rarity: field(&card.rarity),
            card_type: field(&card.card_type),
            hp: card.hp,
            source: ConfidenceSource::Cloud,
            image_ref: card.source_url.clone(),
            market_value: card.market_value,
        })
    }
}
