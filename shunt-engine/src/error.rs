//! Error types for the routing engine

use std::path::PathBuf;

use shunt_net::AddressFamily;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while enabling or disabling a session
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A chain, rule or route operation failed
    #[error("{family} {target}: `{op}` failed: {source}")]
    ControlPlane {
        family: AddressFamily,
        /// Chain or routing table the op was aimed at
        target: String,
        /// Rendered op
        op: String,
        #[source]
        source: shunt_net::Error,
    },

    /// The tunnel helper did not come up
    #[error("{message}, see {}", log_file.display())]
    ProcessStart { message: String, log_file: PathBuf },

    /// DNS redirection could not be adjusted
    #[error("DNS redirection failed on `{op}`: {source}")]
    Dns {
        op: String,
        #[source]
        source: shunt_net::Error,
    },

    /// Forwarding could not be toggled on a device
    #[error("failed to enable forwarding on {device}: {source}")]
    Forwarding {
        device: String,
        #[source]
        source: shunt_net::Error,
    },

    /// Operation not allowed in the current session state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tunnel helper configuration could not be serialized
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }

    /// Check if a kernel-state mutation failed
    pub fn is_control_plane(&self) -> bool {
        matches!(self, Error::ControlPlane { .. })
    }

    /// Check if the tunnel helper failed to start
    pub fn is_process_start(&self) -> bool {
        matches!(self, Error::ProcessStart { .. })
    }
}
