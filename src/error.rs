//! Error types for ferrotun

use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum FerrotunError {
    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network errors
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Tunnel device errors
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Device lifecycle errors
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// System I/O errors
    #[error("system error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid config at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("invalid key for {field}")]
    InvalidKey { field: String },

    #[error("invalid address: {value}")]
    InvalidAddress { value: String },

    #[error("invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u8 },

    #[error("invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("MAC verification failed")]
    MacVerificationFailed,

    #[error("replay detected: counter {counter}")]
    ReplayDetected { counter: u64 },

    #[error("handshake initiation timestamp not newer than last seen")]
    StaleTimestamp,

    #[error("unknown receiver index: {index}")]
    UnknownIndex { index: u32 },

    #[error("unknown peer")]
    UnknownPeer,

    #[error("no handshake in a state that accepts this message")]
    InvalidHandshakeState,

    #[error("session expired")]
    SessionExpired,

    #[error("no active session")]
    NoSession,

    #[error("rate limited")]
    RateLimited,
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    #[error("receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("peer has no known endpoint")]
    NoEndpoint,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel device errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("failed to create TUN device: {reason}")]
    CreateFailed { reason: String },

    #[error("TUN read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("TUN write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("insufficient privileges: {message}")]
    InsufficientPrivileges { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device lifecycle errors
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device is not up")]
    NotRunning,

    #[error("device is closed")]
    Closed,

    #[error("no private key configured")]
    NoIdentity,

    #[error("shutting down")]
    Shutdown,
}

impl FerrotunError {
    /// Stable small-integer code reported through the UAPI `errno=` line.
    ///
    /// The mapping mirrors the POSIX errno values the reference control
    /// protocol uses: malformed requests are EPROTO, bad values EINVAL,
    /// references to unknown peers ENOENT, everything else EIO.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Config(ConfigError::ParseError { .. }) => errno::EPROTO,
            Self::Config(_) => errno::EINVAL,
            Self::Protocol(ProtocolError::UnknownPeer) => errno::ENOENT,
            Self::Protocol(_) => errno::EPROTO,
            Self::Crypto(_) => errno::EINVAL,
            Self::Device(_) => errno::ENODEV,
            _ => errno::EIO,
        }
    }

    /// Whether the error is fatal for the device (bind/TUN failure) as
    /// opposed to a per-packet or per-request condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::BindFailed { .. })
                | Self::Tunnel(TunnelError::CreateFailed { .. })
                | Self::Tunnel(TunnelError::InsufficientPrivileges { .. })
        )
    }
}

/// The handful of errno values the UAPI reports, spelled out so the
/// mapping does not depend on platform libc constants.
mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EPROTO: i32 = 71;
}

/// Result type alias for ferrotun operations
pub type Result<T> = std::result::Result<T, FerrotunError>;
