//! Cloud identification service
//!
//! The remote identifier is an external collaborator behind the
//! [`CloudIdentifier`] trait. [`HttpCloudIdentifier`] posts the canonical card
//! as a base64 JPEG to a JSON endpoint.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::CloudConfig;

/// One identification request
#[derive(Debug, Clone)]
pub struct CloudRequest {
    /// JPEG-encoded canonical card
    pub jpeg: Vec<u8>,
    pub instruction: String,
}

/// Card fields reported by the service; anything may be missing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudCard {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub set: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub rarity: Option<String>,
    #[serde(default, rename = "type", alias = "card_type", alias = "cardType")]
    pub card_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_u16")]
    pub hp: Option<u16>,
    #[serde(default, alias = "marketValue", deserialize_with = "lenient_f64")]
    pub market_value: Option<f64>,
    #[serde(default, alias = "sourceUrl")]
    pub source_url: Option<String>,
}

impl CloudCard {
    /// Trimmed name, if the service read one
    pub fn usable_name(&self) -> Option<&str> {
        self.name.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("identification service is rate limited")]
    RateLimited,
    #[error("identification request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("identification service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed identification reply: {0}")]
    Malformed(String),
    #[error("identification reply has no card name")]
    NoUsableName,
    #[error("failed to encode card image: {0}")]
    Encode(String),
}

impl CloudError {
    /// Whether trying again later could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            CloudError::RateLimited
            | CloudError::Http(_)
            | CloudError::Malformed(_)
            | CloudError::NoUsableName => true,
            CloudError::Status { status, .. } => *status >= 500,
            CloudError::Encode(_) => false,
        }
    }
}

/// Remote card identifier
#[async_trait]
pub trait CloudIdentifier: Send + Sync {
    async fn identify(&self, request: CloudRequest) -> Result<CloudCard, CloudError>;
}

#[derive(Serialize)]
struct IdentifyBody<'a> {
    instruction: &'a str,
    image: ImagePayload,
}

#[derive(Serialize)]
struct ImagePayload {
    media_type: &'static str,
    data: String,
}

/// Reply wrapper used by services that answer with free text
#[derive(Deserialize)]
struct TextReply {
    text: String,
}

/// JSON-over-HTTP identification service
pub struct HttpCloudIdentifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpCloudIdentifier {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    /// Build from config; `None` when no endpoint is configured
    pub fn from_config(config: &CloudConfig) -> Result<Option<Self>, CloudError> {
        let Some(endpoint) = config.endpoint.as_deref() else {
            return Ok(None);
        };
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            info!(
                "{} not set, calling {} without authorization",
                config.api_key_env, endpoint
            );
        }
        Self::new(endpoint, api_key, Duration::from_millis(config.request_timeout_ms)).map(Some)
    }
}

#[async_trait]
impl CloudIdentifier for HttpCloudIdentifier {
    async fn identify(&self, request: CloudRequest) -> Result<CloudCard, CloudError> {
        let start = Instant::now();
        let body = IdentifyBody {
            instruction: &request.instruction,
            image: ImagePayload {
                media_type: "image/jpeg",
                data: general_purpose::STANDARD.encode(&request.jpeg),
            },
        };

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CloudError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        let card = parse_reply(&text)?;
        debug!("Cloud reply parsed in {:?}: {:?}", start.elapsed(), card);
        Ok(card)
    }
}

/// Parse a service reply.
///
/// Accepts either a card object or `{"text": "..."}` whose text holds the card
/// JSON, optionally wrapped in a markdown code fence.
pub fn parse_reply(body: &str) -> Result<CloudCard, CloudError> {
    let body = strip_code_fence(body);
    if let Ok(reply) = serde_json::from_str::<TextReply>(body) {
        return serde_json::from_str(strip_code_fence(&reply.text))
            .map_err(|e| CloudError::Malformed(format!("{}: {}", e, reply.text.trim())));
    }
    serde_json::from_str(body).map_err(|e| CloudError::Malformed(format!("{}: {}", e, body)))
}

fn strip_code_fence(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

impl NumberOrText {
    fn to_f64(&self) -> Option<f64> {
        match self {
            NumberOrText::Number(n) => Some(*n),
            NumberOrText::Text(s) => {
                let digits: String = s.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
                digits.parse().ok()
            }
        }
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<NumberOrText>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.to_f64()))
}

fn lenient_u16<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    let value = Option::<NumberOrText>::deserialize(deserializer)?;
    Ok(value
        .and_then(|v| v.to_f64())
        .filter(|n| *n >= 0.0 && *n <= u16::MAX as f64)
        .map(|n| n as u16))
}
