//! Node error taxonomy. Only the initialization variants are fatal.

use p2pnet_core::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport initialization failed: {0}")]
    TransportInit(String),
    #[error("directory initialization failed: {0}")]
    DirectoryInit(String),
    #[error("directory bootstrap failed: {0}")]
    DirectoryBootstrap(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("discovery unavailable: directory not initialized")]
    DiscoveryUnavailable,
    #[error("connection to {peer} failed: {reason}")]
    ConnectionFailure { peer: PeerId, reason: String },
    #[error("advertising {tag:?} failed: {reason}")]
    AdvertiseFailure { tag: String, reason: String },
    #[error("opening {protocol} stream to {peer} failed: {reason}")]
    StreamOpen {
        peer: PeerId,
        protocol: String,
        reason: String,
    },
    #[error("stream reset")]
    StreamReset,
    #[error("service {0:?} already registered")]
    DuplicateService(String),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Construction-time failures abort node startup; everything else is local to one operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::TransportInit(_)
                | Error::DirectoryInit(_)
                | Error::DirectoryBootstrap(_)
                | Error::Config(_)
        )
    }
}

/// Failure of one request/response call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("remote method failed: {0}")]
    Remote(String),
    #[error("unknown service {0:?}")]
    UnknownService(String),
    #[error("unknown method {service}.{method}")]
    UnknownMethod { service: String, method: String },
    #[error("codec: {0}")]
    Codec(String),
    #[error("call timed out")]
    Timeout,
    #[error("stream: {0}")]
    Stream(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_initialization_errors_are_fatal() {
        assert!(Error::DirectoryBootstrap("x".into()).is_fatal());
        assert!(Error::Config("x".into()).is_fatal());
        assert!(!Error::DiscoveryUnavailable.is_fatal());
        assert!(!Error::StreamReset.is_fatal());
        assert!(!Error::Call(CallError::Timeout).is_fatal());
    }
}
