use std::rc::Rc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    broker::CredentialBroker,
    error::AccessError,
    marshal::MarshalClient,
    model::{FetchedAsset, StreamRequestDescriptor},
};

pub struct TrackBytes {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// Where the playback sequencer gets track bodies from.
#[async_trait(?Send)]
pub trait AssetSource {
    async fn fetch_track(
        &self,
        descriptor: &StreamRequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<TrackBytes, AccessError>;
}

/// Credential broker + marshal client, authorizing every fetch.
pub struct GatedTrackSource {
    broker: Rc<CredentialBroker>,
    marshal: MarshalClient,
}

impl GatedTrackSource {
    pub fn new(broker: Rc<CredentialBroker>, marshal: MarshalClient) -> Self {
        Self { broker, marshal }
    }

    pub async fn fetch(
        &self,
        descriptor: &StreamRequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<FetchedAsset, AccessError> {
        let requester = self.broker.requester_address()?;
        let credential = tokio::select! {
            _ = cancel.cancelled() => return Err(AccessError::Aborted),
            cred = self.broker.get_or_refresh(false) => cred?,
        };
        self.marshal
            .fetch_asset(descriptor, &credential, &requester, cancel)
            .await
    }
}

#[async_trait(?Send)]
impl AssetSource for GatedTrackSource {
    async fn fetch_track(
        &self,
        descriptor: &StreamRequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<TrackBytes, AccessError> {
        let asset = self.fetch(descriptor, cancel).await?;
        let content_type = asset.content_type().map(str::to_string);
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(AccessError::Aborted),
            bytes = asset.into_bytes() => bytes?,
        };
        Ok(TrackBytes {
            bytes,
            content_type,
        })
    }
}
