//! Package name to UID resolution
//!
//! Android assigns each installed package an app id, and each user profile
//! offsets it by `user * 100000`. Packages are written either as a bare
//! name (user 0) or as `<user>:<package>`.

use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;

/// Offset between the UID ranges of two Android users
pub const PER_USER_RANGE: u32 = 100_000;

/// Resolves a package to the UIDs its sockets are owned by
///
/// Unknown packages resolve to nothing; that is not an error.
pub trait UidResolver: Send + Sync {
    fn resolve(&self, package: &str) -> Vec<u32>;
}

/// Fixed package table
impl UidResolver for HashMap<String, Vec<u32>> {
    fn resolve(&self, package: &str) -> Vec<u32> {
        self.get(package).cloned().unwrap_or_default()
    }
}

/// Resolver backed by Android's `packages.list`
#[derive(Debug, Clone, Default)]
pub struct PackagesList {
    app_ids: HashMap<String, u32>,
}

impl PackagesList {
    /// Read and parse a `packages.list` file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Parse `packages.list` content
    ///
    /// Each line starts with `<package> <app id>`; malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let app_ids = content
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let name = fields.next()?;
                let app_id = fields.next()?.parse().ok()?;
                Some((name.to_string(), app_id))
            })
            .collect();
        Self { app_ids }
    }

    pub fn len(&self) -> usize {
        self.app_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.app_ids.is_empty()
    }
}

impl UidResolver for PackagesList {
    fn resolve(&self, package: &str) -> Vec<u32> {
        let (user, name) = match package.split_once(':') {
            Some((user, name)) => match user.parse::<u32>() {
                Ok(user) => (user, name),
                Err(_) => {
                    log::warn!("Invalid user id in package entry {:?}", package);
                    return Vec::new();
                }
            },
            None => (0, package),
        };

        match self.app_ids.get(name) {
            Some(app_id) => match user
                .checked_mul(PER_USER_RANGE)
                .and_then(|base| base.checked_add(*app_id))
            {
                Some(uid) => vec![uid],
                None => {
                    log::warn!("User id in package entry {:?} is out of range", package);
                    Vec::new()
                }
            },
            None => {
                log::debug!("Package {} is not installed", name);
                Vec::new()
            }
        }
    }
}
