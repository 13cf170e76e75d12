//! Error types for shunt-net

use std::io;
use thiserror::Error;

/// Result type alias for shunt-net operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the packet-filtering and routing control plane
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A control-plane tool could not be executed at all
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A control-plane tool ran but exited with a failure status
    #[error("{program} {} failed: {stderr}", args.join(" "))]
    Command {
        program: String,
        args: Vec<String>,
        stderr: String,
    },

    /// Chain already exists in the table
    #[error("chain already exists: {0}")]
    ChainExists(String),

    /// Chain does not exist in the table
    #[error("chain not found: {0}")]
    ChainNotFound(String),

    /// Chain is still referenced by a jump rule
    #[error("chain is referenced by another chain: {0}")]
    ChainInUse(String),

    /// No rule matching the specification exists
    #[error("rule not found: {0}")]
    RuleNotFound(String),

    /// Insert position is outside the chain
    #[error("invalid rule position {position} for chain {chain}")]
    InvalidPosition { chain: String, position: u32 },

    /// Routing policy rule or route already present
    #[error("route already exists: {0}")]
    RouteExists(String),

    /// Routing policy rule or route absent
    #[error("route not found: {0}")]
    RouteNotFound(String),

    /// Network link already present
    #[error("link already exists: {0}")]
    LinkExists(String),

    /// Network link absent
    #[error("link not found: {0}")]
    LinkNotFound(String),

    /// Failure injected by the mock control plane
    #[error("injected failure on operation #{0}")]
    Injected(usize),
}

impl Error {
    /// Check if the error means the target was already absent
    ///
    /// Teardown treats these as success.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ChainNotFound(_)
                | Error::RuleNotFound(_)
                | Error::RouteNotFound(_)
                | Error::LinkNotFound(_)
        ) || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }

    /// Check if the error means the target was already present
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::ChainExists(_) | Error::RouteExists(_) | Error::LinkExists(_)
        )
    }
}
