//! Session events and state

use shunt_net::AddressFamily;

/// Interception session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing installed
    Disabled,
    /// Installing chains, routes and helpers
    Enabling,
    /// Interception active
    Enabled,
    /// Tearing everything down
    Disabling,
}

impl SessionState {
    /// Check if the session may hold kernel state
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Disabled)
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Disabled => "Disabled",
            SessionState::Enabling => "Enabling...",
            SessionState::Enabled => "Enabled",
            SessionState::Disabling => "Disabling...",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Events emitted by the session controller
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// State changed
    StateChanged {
        old: SessionState,
        new: SessionState,
    },

    /// Tunnel helper is up and its device exists
    HelperStarted {
        pid: u32,
        device: String,
    },

    /// Marked packets of a family are routed into the strategy's table
    RoutingAttached {
        family: AddressFamily,
        table: u32,
    },

    /// Interception chains of a family are installed and hooked
    ChainsInstalled {
        family: AddressFamily,
        /// Number of firewall ops applied
        ops: usize,
    },

    /// DNS adjustment applied
    DnsAdjusted {
        /// Redirect port, or `None` when IPv6 DNS was blocked instead
        redirect_port: Option<u16>,
    },

    /// Forwarding enabled on a device
    ForwardingEnabled {
        device: String,
    },

    /// A failed enable was undone
    RolledBack {
        /// Steps undone, in the order they ran
        steps: Vec<String>,
        /// The error that triggered the rollback
        reason: String,
    },

    /// Error occurred
    Error {
        message: String,
    },
}

/// Event handler trait for receiving session events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a session event
    async fn on_event(&self, event: SessionEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { old, new } => {
                log::info!("Session state: {} -> {}", old, new);
            }
            SessionEvent::HelperStarted { pid, device } => {
                log::info!("Tunnel helper running: pid={}, device={}", pid, device);
            }
            SessionEvent::RoutingAttached { family, table } => {
                log::info!("Routing attached: family={}, table={}", family, table);
            }
            SessionEvent::ChainsInstalled { family, ops } => {
                log::info!("Chains installed: family={}, ops={}", family, ops);
            }
            SessionEvent::DnsAdjusted { redirect_port } => match redirect_port {
                Some(port) => log::info!("DNS redirected to port {}", port),
                None => log::info!("System IPv6 DNS blocked"),
            },
            SessionEvent::ForwardingEnabled { device } => {
                log::info!("Forwarding enabled on {}", device);
            }
            SessionEvent::RolledBack { steps, reason } => {
                log::warn!("Rolled back [{}] after: {}", steps.join(", "), reason);
            }
            SessionEvent::Error { message } => {
                log::error!("Error: {}", message);
            }
        }
    }
}
