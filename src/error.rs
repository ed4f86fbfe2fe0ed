//! Stable error kinds for the tunnel core (spec §7).
//!
//! Every variant carries a stable `code()` and a human message. Propagation
//! policy lives with the callers: token-acquire timeouts and transient
//! connection failures are retried at the call site, unrecoverable protocol
//! errors and cert-reload failures are surfaced to the state machine,
//! config/validation failures are surfaced to the user at startup.

use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    // --- Config ---
    #[error("config not found: {0}")]
    ConfigNotFound(String),
    #[error("config parse error: {0}")]
    ConfigParseError(String),
    #[error("config validation error: {field}: {reason}")]
    ConfigValidationError { field: String, reason: String },

    // --- Security ---
    #[error("certificate not found: {0}")]
    CertNotFound(String),
    #[error("certificate parse error: {0}")]
    CertParseError(String),
    #[error("certificate chain invalid: {0}")]
    CertChainInvalid(String),
    #[error("certificate expired at {0:?}")]
    CertExpired(SystemTime),
    #[error("certificate not yet valid (valid from {0:?})")]
    CertNotYetValid(SystemTime),
    #[error("key file permissions unsafe: {path} (mode {mode:o})")]
    KeyPermissionsUnsafe { path: String, mode: u32 },
    #[error("peer authentication failed: {0}")]
    PeerAuthFailed(String),

    // --- Network ---
    #[error("network interface unavailable: {0}")]
    InterfaceUnavailable(String),
    #[error("failed to open TUN device: {0}")]
    TunOpenFailed(String),
    #[error("TUN device already exists: {0}")]
    TunAlreadyExists(String),
    #[error("TUN link went down while in use: {0}")]
    TunInterfaceDown(String),
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    // --- Pool / Retry ---
    #[error("connection pool exhausted")]
    PoolExhausted,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("max retries exceeded: {0}")]
    MaxRetriesExceeded(Box<TunnelError>),
    #[error("health check failed: {0}")]
    HealthCheckFailed(String),
    #[error("no endpoints available")]
    NoEndpointsAvailable,

    // --- Protocol ---
    #[error("frame too large: {len} bytes (mtu {mtu})")]
    FrameTooLarge { len: usize, mtu: usize },
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("invalid length prefix: {0}")]
    InvalidLengthPrefix(u16),

    // --- State ---
    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },
    #[error("state handler failed: {0}")]
    HandlerFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Stable machine-readable code, independent of the Display message.
    pub fn code(&self) -> &'static str {
        use TunnelError::*;
        match self {
            ConfigNotFound(_) => "config.not_found",
            ConfigParseError(_) => "config.parse_error",
            ConfigValidationError { .. } => "config.validation_error",
            CertNotFound(_) => "security.cert_not_found",
            CertParseError(_) => "security.cert_parse_error",
            CertChainInvalid(_) => "security.cert_chain_invalid",
            CertExpired(_) => "security.cert_expired",
            CertNotYetValid(_) => "security.cert_not_yet_valid",
            KeyPermissionsUnsafe { .. } => "security.key_permissions_unsafe",
            PeerAuthFailed(_) => "security.peer_auth_failed",
            InterfaceUnavailable(_) => "network.interface_unavailable",
            TunOpenFailed(_) => "network.tun_open_failed",
            TunAlreadyExists(_) => "network.tun_already_exists",
            TunInterfaceDown(_) => "network.tun_interface_down",
            TlsHandshakeFailed(_) => "network.tls_handshake_failed",
            ConnectionRefused(_) => "network.connection_refused",
            PoolExhausted => "pool.exhausted",
            DeadlineExceeded => "pool.deadline_exceeded",
            MaxRetriesExceeded(_) => "pool.max_retries_exceeded",
            HealthCheckFailed(_) => "pool.health_check_failed",
            NoEndpointsAvailable => "pool.no_endpoints_available",
            FrameTooLarge { .. } => "protocol.frame_too_large",
            ShortRead { .. } => "protocol.short_read",
            InvalidLengthPrefix(_) => "protocol.invalid_length_prefix",
            InvalidTransition { .. } => "state.invalid_transition",
            HandlerFailed(_) => "state.handler_failed",
            Io(_) => "io",
        }
    }

    /// Whether the caller should retry this error rather than surface it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TunnelError::DeadlineExceeded
                | TunnelError::ConnectionRefused(_)
                | TunnelError::HealthCheckFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
