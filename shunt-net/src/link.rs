//! Network link helpers
//!
//! Link presence is checked with `if_nametoindex`, and per-device IP
//! forwarding is toggled through the `/proc/sys/net` sysctl tree.

use std::ffi::CString;
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::family::AddressFamily;

/// Get the interface index for a given interface name
pub fn interface_index(name: &str) -> Result<u32> {
    let c_name = CString::new(name).map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid interface name: {:?}", name),
        ))
    })?;

    // SAFETY: if_nametoindex is safe to call with a valid C string
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };

    if index == 0 {
        return Err(Error::LinkNotFound(name.to_string()));
    }

    Ok(index)
}

/// Answers whether a network link currently exists
pub trait LinkProbe: Send + Sync {
    fn exists(&self, name: &str) -> bool;
}

/// [`LinkProbe`] backed by the kernel's interface table
#[derive(Debug, Clone, Copy, Default)]
pub struct SysLinkProbe;

impl LinkProbe for SysLinkProbe {
    fn exists(&self, name: &str) -> bool {
        interface_index(name).is_ok()
    }
}

/// Per-device IP forwarding switch
pub trait ForwardingControl: Send + Sync {
    fn set_forwarding(&self, family: AddressFamily, device: &str, enabled: bool) -> Result<()>;
}

/// [`ForwardingControl`] that writes `net.ipv{4,6}.conf.<dev>.forwarding`
#[derive(Debug, Clone)]
pub struct SysctlForwarding {
    root: PathBuf,
}

impl SysctlForwarding {
    pub fn new() -> Self {
        Self::with_root("/proc/sys/net")
    }

    /// Use a different sysctl root (the directory holding `ipv4` and `ipv6`)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the forwarding knob for a device
    pub fn knob(&self, family: AddressFamily, device: &str) -> PathBuf {
        let dir = match family {
            AddressFamily::V4 => "ipv4",
            AddressFamily::V6 => "ipv6",
        };
        self.root.join(dir).join("conf").join(device).join("forwarding")
    }
}

impl Default for SysctlForwarding {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardingControl for SysctlForwarding {
    fn set_forwarding(&self, family: AddressFamily, device: &str, enabled: bool) -> Result<()> {
        let path = self.knob(family, device);
        let value = if enabled { "1" } else { "0" };
        log::debug!("sysctl {} = {}", path.display(), value);

        fs::write(&path, value).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::LinkNotFound(device.to_string())
            } else {
                Error::Io(e)
            }
        })
    }
}
