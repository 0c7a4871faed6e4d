use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A forwarding helper is already running
    #[error("tethering already started")]
    Busy,

    #[error("no such interface: {0}")]
    InterfaceNotFound(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("failed to configure {iface} for IPv6 router mode: {source}")]
    RouterConfig {
        iface: String,
        #[source]
        source: std::io::Error,
    },

    /// At least one forwarding toggle could not be written. The requester set
    /// has already been updated, so OS state is uncertain.
    #[error("failed to persist IP forwarding state")]
    ForwardingToggle,

    #[error("failed to start forwarding helper: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("short write to forwarding helper: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

impl Error {
    /// Errors caused by the request itself rather than by the system
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::InvalidAddress(_) | Error::InterfaceNotFound(_))
    }
}
