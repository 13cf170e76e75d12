//! Netfilter and policy-routing control plane
//!
//! This crate models the kernel state a transparent-proxy orchestrator
//! manipulates (mangle/nat/filter chains, routing policy rules, table
//! routes, dummy links and forwarding sysctls) as plain data ops, and
//! applies them through a [`ControlPlane`].
//!
//! # Platform Requirements
//!
//! - Linux with `iptables`, `ip6tables` and iproute2 `ip` on `PATH`
//! - Root privileges or `CAP_NET_ADMIN`
//! - `xt_TPROXY`, `xt_owner` and `xt_mark` netfilter modules
//!
//! # Example
//!
//! ```ignore
//! use shunt_net::{AddressFamily, CommandControlPlane, ControlPlane, FirewallOp, Table};
//!
//! let plane = CommandControlPlane::new();
//! plane.firewall(&FirewallOp::NewChain {
//!     family: AddressFamily::V4,
//!     table: Table::Mangle,
//!     chain: "PROXY".into(),
//! })?;
//! ```

pub mod control;
pub mod error;
pub mod family;
pub mod firewall;
pub mod link;
pub mod route;

pub use control::mock::{KernelState, MockControlPlane};
pub use control::{CommandControlPlane, ControlPlane};
pub use error::{Error, Result};
pub use family::AddressFamily;
pub use firewall::{Action, FirewallOp, Mark, Matcher, Position, Protocol, Rule, Table};
pub use link::{interface_index, ForwardingControl, LinkProbe, SysLinkProbe, SysctlForwarding};
pub use route::{PolicyRule, RouteKind, RouteOp, RuleSelector, TableRoute};
