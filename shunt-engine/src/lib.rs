//! Shunt Engine
//!
//! This crate turns a proxy policy into kernel interception state and
//! manages the lifetime of one interception session.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                        │
//! │  ┌─────────────────┐                                        │
//! │  │   shunt-cli     │                                        │
//! │  └────────┬────────┘                                        │
//! │           ▼                                                 │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                   shunt-engine                         │ │
//! │  │  - SessionController (enable / disable / rollback)     │ │
//! │  │  - AddressFamilyRuleSet, PolicyRoutingManager          │ │
//! │  │  - ProcessSupervisor (tunnel helper)                   │ │
//! │  │  - Config (TOML configuration)                         │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Library Layer                            │
//! │  ┌──────────────────────────────────────────┐               │
//! │  │  shunt-net                               │               │
//! │  │  - ControlPlane (iptables / ip / mock)   │               │
//! │  │  - Links and forwarding                  │               │
//! │  └──────────────────────────────────────────┘               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod applier;
pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod event;
pub mod intranet;
pub mod limiter;
pub mod packages;
pub mod policy;
pub mod routing;
pub mod ruleset;
pub mod strategy;
pub mod supervisor;

pub use applier::RuleApplier;
pub use config::{Config, CoreConfig, CoreFlavor, DnsConfig, ProxyConfig, ProxyMethod, ProxyMode};
pub use dns::{DnsRedirector, NetfilterDns};
pub use engine::SessionController;
pub use error::{Error, Result};
pub use event::{EventHandler, LoggingEventHandler, SessionEvent, SessionState};
pub use intranet::IntranetTable;
pub use limiter::{CgroupLimiter, ProcessLimiter};
pub use packages::{PackagesList, UidResolver};
pub use policy::{AppMode, ProxyPolicy};
pub use routing::PolicyRoutingManager;
pub use ruleset::AddressFamilyRuleSet;
pub use strategy::Interception;
pub use supervisor::{ProcessSupervisor, SupervisorConfig, TunnelConfig};
