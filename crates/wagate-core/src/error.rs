use thiserror::Error;

/// Coarse classification of a [`GatewayError`].
///
/// The HTTP layer maps kinds to status codes; the runtime and dispatcher
/// use them to decide whether a failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request shape or value. Never retried.
    Validation,
    /// The session is in the wrong state for the request.
    Precondition,
    /// Name collision or duplicate resource.
    Conflict,
    /// Unknown session, message, or sink.
    NotFound,
    /// Transport flap or timeout. Retried by the owning component.
    Transient,
    /// Device identity lost or revoked. Needs explicit caller action.
    Fatal,
    /// Capability not available.
    NotImplemented,
    /// The component that would serve the request is gone or shutting down.
    Unavailable,
    /// Anything else.
    Internal,
}

/// Top-level error type for the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request failed validation.
    #[error("{0}")]
    Validation(String),

    /// No session matches the given id or name.
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// A session with this name already exists.
    #[error("session '{0}' already exists")]
    SessionAlreadyExists(String),

    /// Referenced message does not exist.
    #[error("message '{0}' not found")]
    MessageNotFound(String),

    /// Referenced sink does not exist.
    #[error("webhook '{0}' not found")]
    SinkNotFound(String),

    /// Operation requires a connected session.
    #[error("session is not connected")]
    NotConnected,

    /// Operation requires an unpaired session.
    #[error("session is already paired")]
    AlreadyPaired,

    /// No pairing is in progress, so there is no QR code to hand out.
    #[error("session is not waiting for a QR scan")]
    NotPairing,

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Recipient is not a phone number or a WhatsApp address.
    #[error("invalid target '{0}'")]
    InvalidTarget(String),

    /// Downloading or reading media failed.
    #[error("media fetch failed: {0}")]
    MediaFetchFailed(String),

    /// Media exceeds the configured size cap.
    #[error("media is {size} bytes, limit is {limit}")]
    MediaTooLarge { size: u64, limit: u64 },

    /// The library rejected a media upload.
    #[error("upload failed: {0}")]
    UploadFailed(String),

    /// Error reported by the WhatsApp client library.
    #[error("whatsapp error: {0}")]
    Library(String),

    /// The device identity was revoked upstream.
    #[error("device logged out: {0}")]
    LoggedOut(String),

    /// The caller gave up after the message was handed to the library.
    #[error("request canceled after submission, the message may have been sent")]
    CanceledMayHaveSent,

    /// Capability is not available yet.
    #[error("{0} is not implemented")]
    NotImplemented(String),

    /// The serving component is gone.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Persistence error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionAlreadyExists(_) => "session_already_exists",
            Self::MessageNotFound(_) => "message_not_found",
            Self::SinkNotFound(_) => "sink_not_found",
            Self::NotConnected => "not_connected",
            Self::AlreadyPaired => "already_paired",
            Self::NotPairing => "not_pairing",
            Self::Timeout(_) => "timeout",
            Self::InvalidTarget(_) => "invalid_target",
            Self::MediaFetchFailed(_) => "media_fetch_failed",
            Self::MediaTooLarge { .. } => "media_too_large",
            Self::UploadFailed(_) => "upload_failed",
            Self::Library(_) => "library_error",
            Self::LoggedOut(_) => "logged_out",
            Self::CanceledMayHaveSent => "canceled_may_have_sent",
            Self::NotImplemented(_) => "not_implemented",
            Self::Unavailable(_) => "unavailable",
            Self::Store(_) | Self::Config(_) | Self::Io(_) | Self::Serialization(_) => {
                "internal_error"
            }
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::InvalidTarget(_)
            | Self::MediaFetchFailed(_)
            | Self::MediaTooLarge { .. } => ErrorKind::Validation,
            Self::NotConnected | Self::AlreadyPaired | Self::NotPairing => {
                ErrorKind::Precondition
            }
            Self::SessionAlreadyExists(_) => ErrorKind::Conflict,
            Self::SessionNotFound(_) | Self::MessageNotFound(_) | Self::SinkNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::Timeout(_) | Self::CanceledMayHaveSent => ErrorKind::Transient,
            Self::LoggedOut(_) => ErrorKind::Fatal,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::UploadFailed(_)
            | Self::Library(_)
            | Self::Store(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Serialization(_) => ErrorKind::Internal,
        }
    }
}
