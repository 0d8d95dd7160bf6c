use thiserror::Error;

/// Library result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when using the WhatsApp client.
#[derive(Error, Debug)]
pub enum Error {
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error("pairing: {0}")]
    Pairing(#[from] PairingError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("send: {0}")]
    Send(#[from] SendError),

    #[error("addressing: {0}")]
    Addressing(#[from] AddressingError),

    #[error("session: {0}")]
    Session(#[from] SessionError),

    #[error("group: {0}")]
    Group(#[from] GroupError),

    #[error("relay: {0}")]
    Relay(#[from] RelayError),

    #[error("binary protocol: {0}")]
    Binary(String),

    #[error("not connected")]
    NotConnected,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Connection-related errors.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("websocket: {0}")]
    WebSocket(String),

    #[error("handshake failed")]
    HandshakeFailed,

    #[error("timeout")]
    Timeout,

    #[error("disconnected")]
    Disconnected,

    #[error("connect failure: {0}")]
    ConnectFailure(ConnectFailureReason),
}

/// Reason code for connection failures (maps to whatsmeow ConnectFailureReason).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ConnectFailureReason {
    Generic = 400,
    LoggedOut = 401,
    TempBanned = 402,
    MainDeviceGone = 403,
    ClientOutdated = 405,
    UnknownLogout = 406,
    BadUserAgent = 409,
    CATExpired = 413,
    CATInvalid = 414,
    NotFound = 415,
    ClientUnknown = 418,
    InternalServerError = 500,
    Experimental = 501,
    ServiceUnavailable = 503,
}

impl std::fmt::Display for ConnectFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::LoggedOut => "logged out from another device",
            Self::TempBanned => "account temporarily banned",
            Self::MainDeviceGone => "primary device was logged out",
            Self::UnknownLogout => "logged out for unknown reason",
            Self::ClientOutdated => "client is out of date",
            Self::BadUserAgent => "client user agent was rejected",
            Self::CATExpired => "messenger crypto auth token has expired",
            Self::CATInvalid => "messenger crypto auth token is invalid",
            _ => "connection failure",
        };
        write!(f, "{} (code {})", msg, *self as i32)
    }
}

/// Pairing-related errors.
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("invalid device identity HMAC")]
    InvalidDeviceIdentityHmac,

    #[error("invalid device signature")]
    InvalidDeviceSignature,

    #[error("pairing rejected locally")]
    RejectedLocally,

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("database: {0}")]
    Database(String),
}

/// Store (device/session) errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("save failed: {0}")]
    Save(String),

    #[error("load failed: {0}")]
    Load(String),

    #[error("identity not found")]
    IdentityNotFound,
}

/// Send message errors.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("message not found for retry")]
    MessageNotFoundForRetry,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("server error: {0}")]
    Server(String),
}

/// Addressing-resolution errors (IdentityMap, DeviceResolver). Invalid
/// mapping input is logged and skipped by callers rather than propagated;
/// this variant exists for the cases that genuinely can't proceed (a
/// failed USync round trip).
#[derive(Error, Debug)]
pub enum AddressingError {
    #[error("neither JID in pair ({0}, {1}) is a LID/PN pair")]
    InvalidMappingPair(String, String),

    #[error("usync query failed: {0}")]
    UsyncFailed(String),
}

/// Session-assertion errors (SessionGuard). Fatal in strict mode, logged
/// as a warning and swallowed under `compat_v6_group_send`.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("pre-key fetch failed: {0}")]
    PreKeyFetchFailed(String),

    #[error("no pre-key bundle returned for {0}")]
    NoPreKeyBundle(String),

    #[error("per-device encryption failed for {0}: {1}")]
    EncryptionFailed(String, String),
}

/// Group metadata / sender-key errors (GroupState).
#[derive(Error, Debug)]
pub enum GroupError {
    #[error("group metadata fetch failed for {0}: {1}")]
    MetadataFetchFailed(String, String),

    #[error("group {0} not found")]
    NotFound(String),
}

/// Relay-level / transport / media errors.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("send_node rejected: {0}")]
    SendNodeRejected(String),

    #[error("keystore transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("media re-upload failed (status {status_code}): {message}")]
    MediaReupload { status_code: u16, message: String },
}
