//! Packet-filter rule model
//!
//! Rules are plain data. They render to iptables argument vectors, and the
//! mock control plane interprets them directly, so the same [`FirewallOp`]
//! list can be applied to a live kernel or to an in-memory simulation.

use std::fmt;

use ipnet::IpNet;

use crate::family::AddressFamily;

/// Netfilter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Mangle,
    Nat,
    Filter,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Mangle => "mangle",
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }

    /// Built-in chains of this table
    pub fn builtin_chains(&self) -> &'static [&'static str] {
        match self {
            Table::Mangle => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
            Table::Nat => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
            Table::Filter => &["INPUT", "FORWARD", "OUTPUT"],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Firewall mark with mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mark {
    pub value: u32,
    pub mask: u32,
}

impl Mark {
    /// A single-bit mark: value and mask are the same bit
    pub const fn bit(value: u32) -> Self {
        Self { value, mask: value }
    }

    /// Whether two marks can tag the same packet bits
    pub fn overlaps(&self, other: &Mark) -> bool {
        self.mask & other.mask != 0
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.value, self.mask)
    }
}

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const BOTH: [Protocol; 2] = [Protocol::Tcp, Protocol::Udp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Packet matcher
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Matcher {
    Protocol(Protocol),
    InInterface(String),
    OutInterface(String),
    Destination(IpNet),
    DestinationPort(u16),
    UidOwner(u32),
    GidOwner(u32),
    NotGidOwner(u32),
    HasMark(Mark),
}

impl Matcher {
    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            Matcher::Protocol(p) => args.extend(["-p".into(), p.as_str().into()]),
            Matcher::InInterface(i) => args.extend(["-i".into(), i.clone()]),
            Matcher::OutInterface(i) => args.extend(["-o".into(), i.clone()]),
            Matcher::Destination(net) => args.extend(["-d".into(), net.to_string()]),
            Matcher::DestinationPort(port) => args.extend(["--dport".into(), port.to_string()]),
            Matcher::UidOwner(uid) => args.extend([
                "-m".into(),
                "owner".into(),
                "--uid-owner".into(),
                uid.to_string(),
            ]),
            Matcher::GidOwner(gid) => args.extend([
                "-m".into(),
                "owner".into(),
                "--gid-owner".into(),
                gid.to_string(),
            ]),
            Matcher::NotGidOwner(gid) => args.extend([
                "-m".into(),
                "owner".into(),
                "!".into(),
                "--gid-owner".into(),
                gid.to_string(),
            ]),
            Matcher::HasMark(mark) => {
                args.extend(["-m".into(), "mark".into(), "--mark".into(), mark.to_string()])
            }
        }
    }
}

/// Rule target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    /// Set the routing mark
    Mark(Mark),
    /// Divert to a local transparent-proxy listener and set the mark
    Tproxy { port: u16, mark: Mark },
    /// Stop evaluating this chain
    Return,
    /// Continue in another chain
    Jump(String),
    /// NAT to a local port
    Redirect { to_port: u16 },
    Reject,
}

impl Action {
    fn push_args(&self, args: &mut Vec<String>) {
        args.push("-j".into());
        match self {
            Action::Mark(mark) => {
                args.extend(["MARK".into(), "--set-xmark".into(), mark.to_string()])
            }
            Action::Tproxy { port, mark } => args.extend([
                "TPROXY".into(),
                "--on-port".into(),
                port.to_string(),
                "--tproxy-mark".into(),
                mark.to_string(),
            ]),
            Action::Return => args.push("RETURN".into()),
            Action::Jump(chain) => args.push(chain.clone()),
            Action::Redirect { to_port } => args.extend([
                "REDIRECT".into(),
                "--to-ports".into(),
                to_port.to_string(),
            ]),
            Action::Reject => args.push("REJECT".into()),
        }
    }
}

/// A match/target rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub matchers: Vec<Matcher>,
    pub action: Action,
}

impl Rule {
    pub fn new(action: Action) -> Self {
        Self {
            matchers: Vec::new(),
            action,
        }
    }

    /// `-j RETURN` with no matchers yet
    pub fn returning() -> Self {
        Self::new(Action::Return)
    }

    /// `-j <chain>`
    pub fn jump(chain: impl Into<String>) -> Self {
        Self::new(Action::Jump(chain.into()))
    }

    pub fn with(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn protocol(self, protocol: Protocol) -> Self {
        self.with(Matcher::Protocol(protocol))
    }

    pub fn in_interface(self, iface: impl Into<String>) -> Self {
        self.with(Matcher::InInterface(iface.into()))
    }

    pub fn out_interface(self, iface: impl Into<String>) -> Self {
        self.with(Matcher::OutInterface(iface.into()))
    }

    pub fn destination(self, net: IpNet) -> Self {
        self.with(Matcher::Destination(net))
    }

    pub fn dport(self, port: u16) -> Self {
        self.with(Matcher::DestinationPort(port))
    }

    pub fn uid_owner(self, uid: u32) -> Self {
        self.with(Matcher::UidOwner(uid))
    }

    pub fn gid_owner(self, gid: u32) -> Self {
        self.with(Matcher::GidOwner(gid))
    }

    pub fn not_gid_owner(self, gid: u32) -> Self {
        self.with(Matcher::NotGidOwner(gid))
    }

    pub fn has_mark(self, mark: Mark) -> Self {
        self.with(Matcher::HasMark(mark))
    }

    /// Whether a packet hitting this rule leaves with a routing mark
    pub fn is_marking(&self) -> bool {
        matches!(self.action, Action::Mark(_) | Action::Tproxy { .. })
    }

    pub fn is_return(&self) -> bool {
        self.action == Action::Return
    }

    /// Owner UID this rule is restricted to, if any
    pub fn uid(&self) -> Option<u32> {
        self.matchers.iter().find_map(|m| match m {
            Matcher::UidOwner(uid) => Some(*uid),
            _ => None,
        })
    }

    /// Protocol this rule is restricted to, if any
    pub fn proto(&self) -> Option<Protocol> {
        self.matchers.iter().find_map(|m| match m {
            Matcher::Protocol(p) => Some(*p),
            _ => None,
        })
    }

    /// Chain this rule jumps to, if any
    pub fn jump_target(&self) -> Option<&str> {
        match &self.action {
            Action::Jump(chain) => Some(chain),
            _ => None,
        }
    }

    /// iptables rule-specification arguments
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for matcher in &self.matchers {
            matcher.push_args(&mut args);
        }
        self.action.push_args(&mut args);
        args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args().join(" "))
    }
}

/// Where a new rule lands in its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    Append,
    /// 1-based insert position
    Insert(u32),
}

impl Position {
    pub const FRONT: Position = Position::Insert(1);
}

/// One mutation of a family's packet-filter state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallOp {
    NewChain {
        family: AddressFamily,
        table: Table,
        chain: String,
    },
    AddRule {
        family: AddressFamily,
        table: Table,
        chain: String,
        position: Position,
        rule: Rule,
    },
    DeleteRule {
        family: AddressFamily,
        table: Table,
        chain: String,
        rule: Rule,
    },
    /// Flush every rule, then delete the chain
    FlushAndDeleteChain {
        family: AddressFamily,
        table: Table,
        chain: String,
    },
}

impl FirewallOp {
    pub fn family(&self) -> AddressFamily {
        match self {
            FirewallOp::NewChain { family, .. }
            | FirewallOp::AddRule { family, .. }
            | FirewallOp::DeleteRule { family, .. }
            | FirewallOp::FlushAndDeleteChain { family, .. } => *family,
        }
    }

    pub fn table(&self) -> Table {
        match self {
            FirewallOp::NewChain { table, .. }
            | FirewallOp::AddRule { table, .. }
            | FirewallOp::DeleteRule { table, .. }
            | FirewallOp::FlushAndDeleteChain { table, .. } => *table,
        }
    }

    pub fn chain(&self) -> &str {
        match self {
            FirewallOp::NewChain { chain, .. }
            | FirewallOp::AddRule { chain, .. }
            | FirewallOp::DeleteRule { chain, .. }
            | FirewallOp::FlushAndDeleteChain { chain, .. } => chain,
        }
    }

    /// Argument vectors for each iptables invocation this op needs
    pub fn invocations(&self) -> Vec<Vec<String>> {
        let table = self.table().as_str().to_string();
        let head = |flag: &str, chain: &str| vec!["-t".to_string(), table.clone(), flag.into(), chain.into()];

        match self {
            FirewallOp::NewChain { chain, .. } => vec![head("-N", chain.as_str())],
            FirewallOp::AddRule {
                chain,
                position,
                rule,
                ..
            } => {
                let mut args = match position {
                    Position::Append => head("-A", chain.as_str()),
                    Position::Insert(n) => {
                        let mut args = head("-I", chain.as_str());
                        args.push(n.to_string());
                        args
                    }
                };
                args.extend(rule.args());
                vec![args]
            }
            FirewallOp::DeleteRule { chain, rule, .. } => {
                let mut args = head("-D", chain.as_str());
                args.extend(rule.args());
                vec![args]
            }
            FirewallOp::FlushAndDeleteChain { chain, .. } => {
                vec![head("-F", chain.as_str()), head("-X", chain.as_str())]
            }
        }
    }
}

impl fmt::Display for FirewallOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.invocations().iter().map(|a| a.join(" ")).collect();
        write!(f, "{} {}", self.family().iptables(), rendered.join(" && "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARK: Mark = Mark::bit(0x1000000);

    #[test]
    fn test_mark_display() {
        assert_eq!(MARK.to_string(), "0x1000000/0x1000000");
        assert!(!MARK.overlaps(&Mark::bit(0x4000000)));
        assert!(MARK.overlaps(&Mark { value: 0, mask: 0xff000000 }));
    }

    #[test]
    fn test_dns_rule_args() {
        let rule = Rule::new(Action::Mark(MARK))
            .protocol(Protocol::Udp)
            .not_gid_owner(3005)
            .dport(53);

        assert_eq!(
            rule.to_string(),
            "-p udp -m owner ! --gid-owner 3005 --dport 53 -j MARK --set-xmark 0x1000000/0x1000000"
        );
        assert!(rule.is_marking());
    }

    #[test]
    fn test_tproxy_rule_args() {
        let rule = Rule::new(Action::Tproxy { port: 65535, mark: MARK })
            .protocol(Protocol::Tcp)
            .in_interface("wlan+");

        assert_eq!(
            rule.args(),
            vec![
                "-p", "tcp", "-i", "wlan+", "-j", "TPROXY", "--on-port", "65535",
                "--tproxy-mark", "0x1000000/0x1000000"
            ]
        );
    }

    #[test]
    fn test_insert_invocation() {
        let op = FirewallOp::AddRule {
            family: AddressFamily::V6,
            table: Table::Mangle,
            chain: "OUTPUT".into(),
            position: Position::FRONT,
            rule: Rule::jump("PROXY"),
        };

        assert_eq!(op.invocations(), vec![vec!["-t", "mangle", "-I", "OUTPUT", "1", "-j", "PROXY"]]);
        assert_eq!(op.to_string(), "ip6tables -t mangle -I OUTPUT 1 -j PROXY");
    }

    #[test]
    fn test_flush_and_delete_is_two_invocations() {
        let op = FirewallOp::FlushAndDeleteChain {
            family: AddressFamily::V4,
            table: Table::Mangle,
            chain: "XRAY".into(),
        };

        let calls = op.invocations();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vec!["-t", "mangle", "-F", "XRAY"]);
        assert_eq!(calls[1], vec!["-t", "mangle", "-X", "XRAY"]);
    }

    #[test]
    fn test_rule_accessors() {
        let rule = Rule::returning().uid_owner(10050);
        assert_eq!(rule.uid(), Some(10050));
        assert!(rule.is_return());
        assert!(!rule.is_marking());
        assert_eq!(Rule::jump("XT").jump_target(), Some("XT"));
    }
}
