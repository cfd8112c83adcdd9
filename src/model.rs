use std::{fmt, pin::Pin};

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};

use crate::error::AccessError;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, AccessError>>>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    Devnet,
    Mainnet,
}

impl ChainId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::Devnet => "devnet",
            ChainId::Mainnet => "mainnet",
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-time server challenge. Never empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Nonce(String);

impl Nonce {
    pub fn parse(raw: impl Into<String>) -> Result<Self, AccessError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(AccessError::MalformedResponse("empty nonce".into()));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Nonce::parse(raw).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
pub struct PreaccessResponse {
    pub nonce: Nonce,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCredential {
    pub nonce: Nonce,
    /// base58 of the raw wallet signature over the nonce
    pub signature: String,
    pub issued_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequestDescriptor {
    pub asset_id: String,
    pub nested_index: Option<u32>,
    pub forwarded_header_keys: Vec<String>,
    pub cache_duration_seconds: Option<u64>,
    pub stream_inline: bool,
}

impl StreamRequestDescriptor {
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            nested_index: None,
            forwarded_header_keys: Vec::new(),
            cache_duration_seconds: None,
            stream_inline: false,
        }
    }

    /// Inline audio stream of one nested track.
    pub fn track(asset_id: impl Into<String>, index: u32) -> Self {
        Self::new(asset_id).nested(index).inline()
    }

    pub fn nested(mut self, index: u32) -> Self {
        self.nested_index = Some(index);
        self
    }

    pub fn forward_headers<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forwarded_header_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn cache_for(mut self, seconds: u64) -> Self {
        self.cache_duration_seconds = Some(seconds);
        self
    }

    pub fn inline(mut self) -> Self {
        self.stream_inline = true;
        self
    }
}

pub enum FetchedAsset {
    Json(serde_json::Value),
    Stream {
        content_type: Option<String>,
        stream: ByteStream,
    },
}

impl FetchedAsset {
    pub fn content_type(&self) -> Option<&str> {
        match self {
            FetchedAsset::Json(_) => Some("application/json"),
            FetchedAsset::Stream { content_type, .. } => content_type.as_deref(),
        }
    }

    /// Collects the body. JSON is re-serialized.
    pub async fn into_bytes(self) -> Result<Bytes, AccessError> {
        match self {
            FetchedAsset::Json(value) => serde_json::to_vec(&value)
                .map(Bytes::from)
                .map_err(|err| AccessError::MalformedResponse(err.to_string())),
            FetchedAsset::Stream { stream, .. } => {
                let chunks: Vec<Bytes> = stream.try_collect().await?;
                Ok(Bytes::from(chunks.concat()))
            }
        }
    }
}

impl fmt::Debug for FetchedAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchedAsset::Json(value) => f.debug_tuple("Json").field(value).finish(),
            FetchedAsset::Stream { content_type, .. } => f
                .debug_struct("Stream")
                .field("content_type", content_type)
                .finish_non_exhaustive(),
        }
    }
}
