use std::net::SocketAddr;

use sdpack_core::ConfigError;

/// Errors that stop the development server from starting or running
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("Address {0} is already in use")]
    AddressInUse(SocketAddr),

    #[error("Invalid server address {0}")]
    InvalidAddress(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to start file watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}
