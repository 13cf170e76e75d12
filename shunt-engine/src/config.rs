//! Configuration types for the routing engine

use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::intranet::IntranetTable;
use crate::policy::{AppMode, ProxyPolicy};
use crate::strategy::{Interception, CORE_GID};
use crate::supervisor::SupervisorConfig;

/// Main configuration structure
///
/// The configuration file uses TOML format. Every section is optional and
/// falls back to the defaults shown by [`Config::sample`].
///
/// # Example Configuration
///
/// ```toml
/// [core]
/// flavor = "sing-box"
///
/// [proxy]
/// method = "tproxy"
/// mode = "whitelist"
/// packages = ["com.android.chrome", "10:org.telegram.messenger"]
/// ap_interfaces = ["wlan+", "rndis+"]
/// enable_ipv6 = true
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Proxy core and run-time paths
    #[serde(default)]
    pub core: CoreConfig,

    /// Interception policy
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// DNS redirection
    #[serde(default)]
    pub dns: DnsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.core.start_timeout == 0 {
            return Err(Error::Config("start_timeout must be at least 1 second".into()));
        }

        match self.proxy.method {
            ProxyMethod::Tproxy => {
                if self.proxy.tproxy_port == 0 {
                    return Err(Error::Config("tproxy_port is required for tproxy".into()));
                }
            }
            ProxyMethod::Tun2socks => {
                if self.proxy.socks_port == 0 {
                    return Err(Error::Config("socks_port is required for tun2socks".into()));
                }
                validate_interface("tun_device", &self.proxy.tun_device)?;
            }
        }

        for iface in &self.proxy.ignore_interfaces {
            validate_interface("ignore_interfaces", iface)?;
        }
        for iface in &self.proxy.ap_interfaces {
            validate_interface("ap_interfaces", iface)?;
        }

        if self.dns.redirect_port == Some(0) {
            return Err(Error::Config("dns redirect_port must not be 0".into()));
        }
        if self.core.flavor == CoreFlavor::Mihomo && self.dns.redirect_port.is_none() {
            return Err(Error::Config(
                "mihomo resolves DNS locally; dns.redirect_port is required".into(),
            ));
        }

        Ok(())
    }

    /// Derive the immutable session policy
    ///
    /// `intranet` is consulted for the host's IPv6 connectivity when
    /// `proxy.use_dummy` is not set explicitly.
    pub fn policy(&self, intranet: &IntranetTable) -> Result<ProxyPolicy> {
        self.validate()?;

        let proxy = &self.proxy;
        let interception = match proxy.method {
            ProxyMethod::Tproxy => Interception::KernelRedirect {
                port: proxy.tproxy_port,
            },
            ProxyMethod::Tun2socks => Interception::UserspaceTunnel {
                device: proxy.tun_device.clone(),
                socks_port: proxy.socks_port,
            },
        };

        let mode = match (proxy.packages.is_empty(), proxy.mode) {
            (true, _) => AppMode::Everyone,
            (false, ProxyMode::Blacklist) => AppMode::Blacklist(proxy.packages.clone()),
            (false, ProxyMode::Whitelist) => AppMode::Whitelist(proxy.packages.clone()),
        };

        Ok(ProxyPolicy {
            interception,
            mode,
            always_allow_uids: proxy.always_allow_uids.clone(),
            ignore_interfaces: proxy.ignore_interfaces.clone(),
            bypass: proxy.bypass.clone(),
            intranet_allow: proxy.intranet_allow.clone(),
            ap_interfaces: proxy.ap_interfaces.clone(),
            enable_ipv6: proxy.enable_ipv6,
            use_dummy: proxy.use_dummy.unwrap_or(!intranet.has_global_v6()),
            flavor: self.core.flavor,
            core_gid: self.core.gid,
            dns_redirect_port: self.dns.redirect_port,
            intranet: intranet.clone(),
        })
    }

    /// Settings for the tunnel helper process
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig::new(
            &self.core.helper_path,
            &self.core.run_dir,
            &self.proxy.tun_device,
            self.proxy.socks_port,
        )
        .with_start_timeout(Duration::from_secs(self.core.start_timeout))
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# shunt configuration

[core]
# Proxy core flavor: "xray", "v2ray", "sing-box", "mihomo", "hysteria2"
# xray, v2ray and sing-box resolve DNS inside the proxied stream.
# mihomo and hysteria2 run a local resolver; see [dns].
flavor = "xray"

# Group the proxy core runs as; its traffic is never intercepted
gid = 3005

# Directory for the tunnel helper's config, log and pid files
run_dir = "/data/adb/shunt/run"

# tun2socks helper binary (tun2socks method only)
helper_path = "/data/adb/shunt/bin/tun2socks"

# Seconds to wait for the tunnel device to appear
start_timeout = 15

# Android package database used to resolve package UIDs
packages_list = "/data/system/packages.list"

# cgroup the helper is moved into (optional)
# cgroup = "/dev/cg2_bpf/shunt"

[proxy]
# Interception method: "tproxy" or "tun2socks"
method = "tproxy"

# Application mode when packages is non-empty: "blacklist" or "whitelist"
# An empty package list proxies every application.
mode = "blacklist"

# Packages, optionally prefixed with an Android user id ("10:com.example.app")
packages = []

# UIDs always proxied in whitelist mode (root and the DNS tether user)
always_allow_uids = [0, 1052]

# Outgoing interfaces that are never proxied
ignore_interfaces = []

# Destinations that are never proxied
bypass = []

# Private destinations that are proxied anyway
intranet_allow = []

# Hotspot and tethering interfaces whose clients are proxied ("+" is a wildcard)
ap_interfaces = ["wlan+", "ap+", "rndis+", "ncm+"]

# Intercept IPv6 as well
enable_ipv6 = false

# TPROXY inbound port of the core (tproxy method)
tproxy_port = 65535

# SOCKS5 inbound port of the core (tun2socks method)
socks_port = 65534

# Tunnel device created by the helper (tun2socks method)
tun_device = "xtun"

# Route IPv6 through a dummy link when the host has no IPv6 address
# Detected automatically when not set.
# use_dummy = true

[dns]
# Local resolver port DNS is redirected to (required for mihomo)
# redirect_port = 1053
"#
        .to_string()
    }
}

/// Proxy core and run-time settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub flavor: CoreFlavor,

    #[serde(default = "default_gid")]
    pub gid: u32,

    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    #[serde(default = "default_helper_path")]
    pub helper_path: PathBuf,

    /// Seconds to wait for the tunnel device
    #[serde(default = "default_start_timeout")]
    pub start_timeout: u64,

    #[serde(default = "default_packages_list")]
    pub packages_list: PathBuf,

    #[serde(default)]
    pub cgroup: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            flavor: CoreFlavor::default(),
            gid: default_gid(),
            run_dir: default_run_dir(),
            helper_path: default_helper_path(),
            start_timeout: default_start_timeout(),
            packages_list: default_packages_list(),
            cgroup: None,
        }
    }
}

/// Interception policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub method: ProxyMethod,

    #[serde(default)]
    pub mode: ProxyMode,

    #[serde(default)]
    pub packages: Vec<String>,

    #[serde(default = "default_always_allow_uids")]
    pub always_allow_uids: Vec<u32>,

    #[serde(default)]
    pub ignore_interfaces: Vec<String>,

    #[serde(default)]
    pub bypass: Vec<IpNet>,

    #[serde(default)]
    pub intranet_allow: Vec<IpNet>,

    #[serde(default = "default_ap_interfaces")]
    pub ap_interfaces: Vec<String>,

    #[serde(default)]
    pub enable_ipv6: bool,

    #[serde(default = "default_tproxy_port")]
    pub tproxy_port: u16,

    #[serde(default = "default_socks_port")]
    pub socks_port: u16,

    #[serde(default = "default_tun_device")]
    pub tun_device: String,

    /// Force the IPv6 dummy link on or off
    #[serde(default)]
    pub use_dummy: Option<bool>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            method: ProxyMethod::default(),
            mode: ProxyMode::default(),
            packages: Vec::new(),
            always_allow_uids: default_always_allow_uids(),
            ignore_interfaces: Vec::new(),
            bypass: Vec::new(),
            intranet_allow: Vec::new(),
            ap_interfaces: default_ap_interfaces(),
            enable_ipv6: false,
            tproxy_port: default_tproxy_port(),
            socks_port: default_socks_port(),
            tun_device: default_tun_device(),
            use_dummy: None,
        }
    }
}

/// DNS redirection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Port of the core's local resolver
    #[serde(default)]
    pub redirect_port: Option<u16>,
}

/// Proxy core implementation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoreFlavor {
    #[default]
    Xray,
    V2ray,
    SingBox,
    Mihomo,
    Hysteria2,
}

impl CoreFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreFlavor::Xray => "xray",
            CoreFlavor::V2ray => "v2ray",
            CoreFlavor::SingBox => "sing-box",
            CoreFlavor::Mihomo => "mihomo",
            CoreFlavor::Hysteria2 => "hysteria2",
        }
    }

    /// Whether the core resolves DNS with its own local listener
    ///
    /// Such cores get port 53 excluded from interception and redirected to
    /// their resolver port instead of marked.
    pub fn resolves_locally(&self) -> bool {
        matches!(self, CoreFlavor::Mihomo | CoreFlavor::Hysteria2)
    }
}

impl std::fmt::Display for CoreFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interception method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMethod {
    #[default]
    Tproxy,
    Tun2socks,
}

/// How the package list is applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    Blacklist,
    Whitelist,
}

fn validate_interface(field: &str, name: &str) -> Result<()> {
    // IFNAMSIZ includes the trailing NUL
    if name.is_empty() || name.len() > 15 || name.contains(char::is_whitespace) {
        return Err(Error::Config(format!(
            "{}: invalid interface name {:?}",
            field, name
        )));
    }
    Ok(())
}

fn default_gid() -> u32 {
    CORE_GID
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/data/adb/shunt/run")
}

fn default_helper_path() -> PathBuf {
    PathBuf::from("/data/adb/shunt/bin/tun2socks")
}

fn default_start_timeout() -> u64 {
    15
}

fn default_packages_list() -> PathBuf {
    PathBuf::from("/data/system/packages.list")
}

fn default_always_allow_uids() -> Vec<u32> {
    vec![0, 1052]
}

fn default_ap_interfaces() -> Vec<String> {
    ["wlan+", "ap+", "rndis+", "ncm+"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_tproxy_port() -> u16 {
    65535
}

fn default_socks_port() -> u16 {
    65534
}

fn default_tun_device() -> String {
    "xtun".to_string()
}
