/// Failures of the credential, fetch and playback layers.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum AccessError {
    #[display("MissingSigningCapability: please connect a wallet")]
    MissingSigningCapability,

    #[display("PreaccessUnavailable: {_0}")]
    PreaccessUnavailable(String),

    #[display("SignatureDenied: {_0}")]
    SignatureDenied(String),

    #[display("AssetAccessDenied: {_0}")]
    AssetAccessDenied(String),

    #[display("AssetFetchFailed: {_0}")]
    AssetFetchFailed(String),

    #[display("MalformedResponse: {_0}")]
    MalformedResponse(String),

    #[display("Aborted")]
    Aborted,

    #[display("InvalidTrackIndex: {_0}")]
    InvalidTrackIndex(usize),

    #[display("SlotInUse: track {_0} is playing")]
    SlotInUse(usize),

    #[display("InvalidConfig: {_0}")]
    InvalidConfig(String),

    #[display("KeypairLoad: {_0}")]
    KeypairLoad(String),
}
impl std::error::Error for AccessError {}

impl AccessError {
    /// Both abort the credential flow the same way: dismissible, no retry loop.
    pub fn is_user_facing_abort(&self) -> bool {
        matches!(
            self,
            AccessError::PreaccessUnavailable(_) | AccessError::SignatureDenied(_)
        )
    }
}

#[derive(Debug, derive_more::Display)]
pub enum OutputError {
    #[display("TCPConnectError: {_0}")]
    TCPConnect(std::io::Error),

    #[cfg(target_os = "linux")]
    #[display("UnixConnectError: {_0}")]
    UnixConnect(std::io::Error),

    #[display("FileCreateError: {_0}")]
    FileCreate(std::io::Error),

    #[display("NoUnixSocketError: target_os != linux")]
    NoUnixSocket,

    #[display("FFplayNotFound")]
    FFplayNotFound,

    #[display("TrackSendError: output closed")]
    TrackSend,
}
impl std::error::Error for OutputError {}
