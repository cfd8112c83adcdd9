use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::model::ChainId;

/// gated marshal streaming client
#[derive(Parser, Debug)]
#[command(
    author = "7ERr0r",
    version,
    about,
    long_about = "Signs a marshal nonce with a local wallet keypair, caches the credential, then fetches gated assets or plays a multi-track asset with async prefetching"
)]
pub struct MarshalplayArgs {
    /// Marshal base url, e.g. https://marshal.example.org
    #[arg(long, env = "MARSHALPLAY_URL")]
    pub marshal_url: String,

    /// Network the assets live on
    #[arg(long, env = "MARSHALPLAY_CHAIN", value_enum, default_value_t = ChainId::Devnet)]
    pub chain: ChainId,

    /// Wallet keypair file (JSON array of 64 bytes)
    #[arg(short, long, env = "MARSHALPLAY_KEYPAIR")]
    pub keypair: Option<PathBuf>,

    /// Seconds a signed credential is reused before signing a new nonce
    #[arg(long, default_value_t = 20 * 60)]
    pub validity_secs: u64,

    /// Max concurrent track prefetches
    #[arg(long, default_value_t = 6)]
    pub prefetch_limit: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print a fresh nonce
    Preaccess,

    /// Fetch one gated asset; JSON is printed, bytes go to the outputs
    Fetch {
        /// Asset (NFT) id
        asset: String,

        /// Nested item index inside a multi-part asset
        #[arg(short, long)]
        nested: Option<u32>,

        /// Response header keys the marshal should forward
        #[arg(long = "fwd-header")]
        fwd_headers: Vec<String>,

        /// Cache duration hint passed to the marshal
        #[arg(long)]
        cache_seconds: Option<u64>,

        /// Request an inline stream
        #[arg(long)]
        inline: bool,

        /// File path or 'out' for stdout, 'ffplay' for player window
        #[arg(short, long)]
        out: Option<Vec<String>>,
    },

    /// Play every track of a multi-track asset in a loop
    Play {
        /// Asset (NFT) id
        asset: String,

        /// Number of nested tracks
        #[arg(short, long)]
        tracks: u32,

        /// Track to start with
        #[arg(short, long, default_value_t = 0)]
        start: u32,

        /// Stop after this many tracks (default: play forever)
        #[arg(long)]
        limit: Option<u32>,

        /// File path or 'out' for stdout, 'ffplay' for player window
        #[arg(short, long)]
        out: Option<Vec<String>>,
    },
}
