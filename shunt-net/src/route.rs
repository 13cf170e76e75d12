//! Policy routing
//!
//! Marked packets are steered into a dedicated routing table by an
//! `ip rule`, and that table carries a single default route: either a
//! `local` route on loopback (TPROXY delivery) or a route into a tunnel
//! device. This module models those entries and renders them as
//! arguments for the `ip` tool.

use std::fmt;

use ipnet::IpNet;

use crate::family::AddressFamily;
use crate::firewall::Mark;

/// Route type within a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    /// Forwarded out of the device
    Unicast,
    /// Delivered to the local host
    Local,
}

/// A default route, optionally inside a numbered table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRoute {
    pub family: AddressFamily,
    pub kind: RouteKind,
    /// Output device
    pub device: String,
    /// Routing table (None for `main`)
    pub table: Option<u32>,
    /// Route metric (lower = higher priority)
    pub metric: Option<u32>,
}

impl TableRoute {
    /// `local default dev <device> table <table>`
    pub fn local_default(family: AddressFamily, device: impl Into<String>, table: u32) -> Self {
        Self {
            family,
            kind: RouteKind::Local,
            device: device.into(),
            table: Some(table),
            metric: None,
        }
    }

    /// `default dev <device> table <table>`
    pub fn default_dev(family: AddressFamily, device: impl Into<String>, table: u32) -> Self {
        Self {
            family,
            kind: RouteKind::Unicast,
            device: device.into(),
            table: Some(table),
            metric: None,
        }
    }

    /// `default dev <device>` in the main table
    pub fn main_default_dev(family: AddressFamily, device: impl Into<String>) -> Self {
        Self {
            family,
            kind: RouteKind::Unicast,
            device: device.into(),
            table: None,
            metric: None,
        }
    }

    /// Set the metric for this route
    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = Some(metric);
        self
    }

    fn route_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.kind == RouteKind::Local {
            args.push("local".to_string());
        }
        args.extend(["default".to_string(), "dev".to_string(), self.device.clone()]);
        if let Some(table) = self.table {
            args.extend(["table".to_string(), table.to_string()]);
        }
        if let Some(metric) = self.metric {
            args.extend(["metric".to_string(), metric.to_string()]);
        }
        args
    }
}

impl fmt::Display for TableRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.route_args().join(" "))
    }
}

/// Which packets a routing policy rule selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleSelector {
    FwMark(Mark),
    All,
}

/// An `ip rule` entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyRule {
    pub family: AddressFamily,
    pub selector: RuleSelector,
    pub table: u32,
    /// Rule priority (lower = evaluated earlier)
    pub priority: Option<u32>,
}

impl PolicyRule {
    /// `fwmark <mark> table <table>`
    pub fn fwmark(family: AddressFamily, mark: Mark, table: u32) -> Self {
        Self {
            family,
            selector: RuleSelector::FwMark(mark),
            table,
            priority: None,
        }
    }

    /// `from all table <table> prio <priority>`
    pub fn catch_all(family: AddressFamily, table: u32, priority: u32) -> Self {
        Self {
            family,
            selector: RuleSelector::All,
            table,
            priority: Some(priority),
        }
    }

    fn rule_args(&self) -> Vec<String> {
        let mut args = match self.selector {
            RuleSelector::FwMark(mark) => vec!["fwmark".to_string(), mark.to_string()],
            RuleSelector::All => vec!["from".to_string(), "all".to_string()],
        };
        args.extend(["table".to_string(), self.table.to_string()]);
        if let Some(priority) = self.priority {
            args.extend(["prio".to_string(), priority.to_string()]);
        }
        args
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rule_args().join(" "))
    }
}

/// One mutation of routing state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOp {
    AddPolicyRule(PolicyRule),
    DeletePolicyRule(PolicyRule),
    AddRoute(TableRoute),
    FlushTable { family: AddressFamily, table: u32 },
    /// Create a dummy link, bring it up and assign an address
    AddDummyLink { name: String, address: IpNet },
    /// Delete a link along with its addresses and routes
    DeleteLink { name: String },
}

impl RouteOp {
    /// Argument vectors for each `ip` invocation this op needs
    pub fn invocations(&self) -> Vec<Vec<String>> {
        fn with_family(family: AddressFamily, rest: Vec<String>) -> Vec<String> {
            let mut args: Vec<String> = family.ip_args().iter().map(|s| s.to_string()).collect();
            args.extend(rest);
            args
        }

        fn words(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }

        match self {
            RouteOp::AddPolicyRule(rule) => {
                let mut rest = words(&["rule", "add"]);
                rest.extend(rule.rule_args());
                vec![with_family(rule.family, rest)]
            }
            RouteOp::DeletePolicyRule(rule) => {
                let mut rest = words(&["rule", "del"]);
                rest.extend(rule.rule_args());
                vec![with_family(rule.family, rest)]
            }
            RouteOp::AddRoute(route) => {
                let mut rest = words(&["route", "add"]);
                rest.extend(route.route_args());
                vec![with_family(route.family, rest)]
            }
            RouteOp::FlushTable { family, table } => {
                let mut rest = words(&["route", "flush", "table"]);
                rest.push(table.to_string());
                vec![with_family(*family, rest)]
            }
            RouteOp::AddDummyLink { name, address } => {
                let family = AddressFamily::of_net(address);
                let address = address.to_string();
                vec![
                    words(&["link", "add", name.as_str(), "type", "dummy"]),
                    words(&["link", "set", name.as_str(), "up"]),
                    with_family(
                        family,
                        words(&["addr", "add", address.as_str(), "dev", name.as_str()]),
                    ),
                ]
            }
            RouteOp::DeleteLink { name } => vec![words(&["link", "del", name.as_str()])],
        }
    }
}

impl fmt::Display for RouteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .invocations()
            .iter()
            .map(|args| format!("ip {}", args.join(" ")))
            .collect();
        f.write_str(&rendered.join(" && "))
    }
}
