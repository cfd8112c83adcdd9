pub mod args;
pub mod blob;
pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod ffplay;
pub mod marshal;
pub mod model;
pub mod outsender;
pub mod outwriter;
pub mod player;
pub mod sequencer;
pub mod signer;
pub mod source;

pub use crate::{
    blob::{BlobStore, BlobUrl, MemoryBlobStore},
    broker::CredentialBroker,
    cache::{Clock, ManualClock, SharedSignatureCache, SignatureCache, SystemClock, CREDENTIAL_VALIDITY},
    config::MarshalConfig,
    error::{AccessError, OutputError},
    marshal::{MarshalClient, PreaccessSource},
    model::{AccessCredential, ChainId, FetchedAsset, Nonce, StreamRequestDescriptor},
    sequencer::{PlaybackSequencer, PlaybackState, SourceState, TrackQueueEntry, TrackSource},
    signer::{KeypairSigner, SignError, WalletSigner},
    source::{AssetSource, GatedTrackSource, TrackBytes},
};
