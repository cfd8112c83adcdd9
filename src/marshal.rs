use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{header::CONTENT_TYPE, StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::MarshalConfig,
    error::AccessError,
    model::{AccessCredential, ChainId, FetchedAsset, Nonce, PreaccessResponse, StreamRequestDescriptor},
};

/// Issues one-time nonces for the credential broker.
#[async_trait(?Send)]
pub trait PreaccessSource {
    async fn preaccess(&self) -> Result<Nonce, AccessError>;
}

#[derive(Clone)]
pub struct MarshalClient {
    http: reqwest::Client,
    base: String,
    chain: ChainId,
}

fn status_text(status: StatusCode) -> String {
    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| status.as_str().to_string())
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|mime| {
            let mime = mime.trim();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

impl MarshalClient {
    pub fn new(http: reqwest::Client, base: &str, chain: ChainId) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            chain,
        }
    }

    pub fn from_config(http: reqwest::Client, config: &MarshalConfig) -> Self {
        Self::new(http, &config.marshal_url, config.chain)
    }

    pub fn preaccess_url(&self) -> Result<Url, AccessError> {
        let params = [("chainId", self.chain.as_str())];
        Url::parse_with_params(&format!("{}/preaccess", self.base), &params)
            .map_err(|err| AccessError::PreaccessUnavailable(err.to_string()))
    }

    pub fn access_url(
        &self,
        descriptor: &StreamRequestDescriptor,
        credential: &AccessCredential,
        requester: &str,
    ) -> Result<Url, AccessError> {
        let mut url = Url::parse(&format!("{}/access", self.base))
            .map_err(|err| AccessError::AssetFetchFailed(err.to_string()))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("nonce", credential.nonce.as_str());
            q.append_pair("NFTId", &descriptor.asset_id);
            q.append_pair("signature", &credential.signature);
            q.append_pair("chainId", self.chain.as_str());
            q.append_pair("accessRequesterAddr", requester);

            if descriptor.stream_inline {
                q.append_pair("streamInLine", "1");
            }
            if let Some(idx) = descriptor.nested_index {
                q.append_pair("nestedIdxToStream", &idx.to_string());
            }
            if !descriptor.forwarded_header_keys.is_empty() {
                q.append_pair("fwdHeaderKeys", &descriptor.forwarded_header_keys.join(","));
            }
            if let Some(secs) = descriptor.cache_duration_seconds {
                q.append_pair("cacheDurationSeconds", &secs.to_string());
            }
        }
        Ok(url)
    }

    /// Fetches a gated asset. JSON bodies are parsed, anything else is streamed.
    pub async fn fetch_asset(
        &self,
        descriptor: &StreamRequestDescriptor,
        credential: &AccessCredential,
        requester: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedAsset, AccessError> {
        let url = self.access_url(descriptor, credential, requester)?;
        debug!(asset = %descriptor.asset_id, nested = ?descriptor.nested_index, "access request");

        let res = tokio::select! {
            _ = cancel.cancelled() => return Err(AccessError::Aborted),
            res = self.http.get(url).send() => {
                res.map_err(|err| AccessError::AssetFetchFailed(err.to_string()))?
            }
        };

        let status = res.status();
        debug!(asset = %descriptor.asset_id, %status, "access response");
        if !status.is_success() {
            let text = status_text(status);
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    AccessError::AssetAccessDenied(text)
                }
                _ => AccessError::AssetFetchFailed(text),
            });
        }

        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if is_json(content_type.as_deref()) {
            let body = tokio::select! {
                _ = cancel.cancelled() => return Err(AccessError::Aborted),
                body = res.bytes() => {
                    body.map_err(|err| AccessError::AssetFetchFailed(err.to_string()))?
                }
            };
            let value = serde_json::from_slice(&body)
                .map_err(|err| AccessError::MalformedResponse(err.to_string()))?;
            return Ok(FetchedAsset::Json(value));
        }

        let stream = res
            .bytes_stream()
            .map_err(|err| AccessError::AssetFetchFailed(err.to_string()));
        Ok(FetchedAsset::Stream {
            content_type,
            stream: Box::pin(stream),
        })
    }
}

#[async_trait(?Send)]
impl PreaccessSource for MarshalClient {
    async fn preaccess(&self) -> Result<Nonce, AccessError> {
        let url = self.preaccess_url()?;
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| AccessError::PreaccessUnavailable(err.to_string()))?;

        let status = res.status();
        debug!(%status, "preaccess response");
        if !status.is_success() {
            return Err(AccessError::PreaccessUnavailable(status_text(status)));
        }

        let body = res
            .bytes()
            .await
            .map_err(|err| AccessError::PreaccessUnavailable(err.to_string()))?;
        let parsed: PreaccessResponse = serde_json::from_slice(&body)
            .map_err(|err| AccessError::PreaccessUnavailable(format!("malformed body: {}", err)))?;
        Ok(parsed.nonce)
    }
}
