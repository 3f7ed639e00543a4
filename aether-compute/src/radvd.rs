//! IPv6 router advertisements for VPN overlays.
//!
//! Every advertised interface gets its own /64 out of a single /48 site
//! prefix. One radvd instance, supervised like the other helpers, announces
//! all of them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv6Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::str::FromStr;

use aether_core::{validate_device_name, validate_user_name, CoreError};

use crate::launch::escape_exec_arg;
use crate::services::{confirm_running, ServiceManager, UnitFile};
use crate::{ComputeError, HostConfig};

pub const RADVD_UNIT: &str = "aether-radvd.service";

/// The leading three groups of an IPv6 address, e.g. `2001:db8:0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SitePrefix([u16; 3]);

impl SitePrefix {
    /// The `index`-th /64 of the site.
    #[must_use]
    pub fn network(&self, index: u16) -> String {
        let [a, b, c] = self.0;
        format!("{}/64", Ipv6Addr::new(a, b, c, index, 0, 0, 0, 0))
    }
}

impl FromStr for SitePrefix {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidIpAddress(s.to_owned());
        let groups: Vec<&str> = s.split(':').collect();
        if groups.len() != 3 {
            return Err(invalid());
        }
        let mut out = [0u16; 3];
        for (slot, group) in out.iter_mut().zip(&groups) {
            if group.is_empty() || group.len() > 4 || !group.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *slot = u16::from_str_radix(group, 16).map_err(|_| invalid())?;
        }
        Ok(Self(out))
    }
}

impl fmt::Display for SitePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{a:x}:{b:x}:{c:x}")
    }
}

/// Interfaces radvd announces and the /64 each one carries.
#[derive(Debug, Clone)]
pub struct RouterAdvertisements {
    site: SitePrefix,
    user: String,
    sudo: bool,
    networks: BTreeMap<String, u16>,
    used: BTreeSet<u16>,
}

impl RouterAdvertisements {
    /// Advertise networks of `site`, with radvd dropping privileges to `user`.
    ///
    /// # Errors
    /// Returns a validation error if `user` is not a valid user name.
    pub fn new(site: SitePrefix, user: &str, sudo: bool) -> Result<Self, ComputeError> {
        validate_user_name(user)?;
        Ok(Self {
            site,
            user: user.to_owned(),
            sudo,
            networks: BTreeMap::new(),
            used: BTreeSet::new(),
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// The /64 advertised on `interface`, if any.
    #[must_use]
    pub fn prefix(&self, interface: &str) -> Option<String> {
        self.networks.get(interface).map(|i| self.site.network(*i))
    }

    fn next_index(&self) -> Result<u16, ComputeError> {
        let mut expected: u32 = 0;
        for &index in &self.used {
            if u32::from(index) != expected {
                break;
            }
            expected += 1;
        }
        u16::try_from(expected).map_err(|_| ComputeError::PrefixExhausted)
    }

    /// The lowest /64 not advertised yet.
    ///
    /// # Errors
    /// Returns [`ComputeError::PrefixExhausted`] once all 65536 are in use.
    pub fn next_prefix(&self) -> Result<String, ComputeError> {
        Ok(self.site.network(self.next_index()?))
    }

    /// Advertise the `index`-th /64 on `interface`, replacing whatever the
    /// interface carried before.
    ///
    /// # Errors
    /// Returns a validation error for a bad interface name and
    /// [`ComputeError::PrefixAssigned`] if another interface holds the /64.
    pub fn add_interface(&mut self, interface: &str, index: u16) -> Result<(), ComputeError> {
        validate_device_name(interface)?;
        if self.networks.get(interface) == Some(&index) {
            return Ok(());
        }
        if self.used.contains(&index) {
            return Err(ComputeError::PrefixAssigned(self.site.network(index)));
        }
        if let Some(old) = self.networks.insert(interface.to_owned(), index) {
            self.used.remove(&old);
        }
        self.used.insert(index);
        Ok(())
    }

    /// Give `interface` the lowest free /64 unless it already has one.
    ///
    /// # Errors
    /// Returns a validation error for a bad interface name and
    /// [`ComputeError::PrefixExhausted`] if no /64 is left.
    pub fn assign(&mut self, interface: &str) -> Result<String, ComputeError> {
        if let Some(prefix) = self.prefix(interface) {
            return Ok(prefix);
        }
        let index = self.next_index()?;
        self.add_interface(interface, index)?;
        Ok(self.site.network(index))
    }

    /// Stop advertising on `interface` and free its /64.
    pub fn remove_interface(&mut self, interface: &str) -> Option<String> {
        let index = self.networks.remove(interface)?;
        self.used.remove(&index);
        Some(self.site.network(index))
    }

    /// The radvd configuration for every advertised interface.
    #[must_use]
    pub fn render(&self) -> String {
        self.networks
            .iter()
            .map(|(interface, index)| {
                format!(
                    "interface {interface} {{\n  AdvSendAdvert on;\n  MinRtrAdvInterval 3;\n  \
                     MaxRtrAdvInterval 10;\n  prefix {prefix} {{\n    AdvOnLink on;\n    \
                     AdvAutonomous on;\n    AdvRouterAddr off;\n  }};\n}};\n",
                    prefix = self.site.network(*index),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// radvd in the foreground, dropping privileges after startup.
    #[must_use]
    pub fn exec_start(&self, config: &HostConfig) -> String {
        let conf = config.radvd_config().to_string_lossy().into_owned();
        let pidfile = config.radvd_pidfile().to_string_lossy().into_owned();
        let mut args = Vec::new();
        if self.sudo {
            args.push("sudo");
        }
        args.extend([
            config.radvd_binary.as_str(),
            "-n",
            "-C",
            conf.as_str(),
            "-u",
            self.user.as_str(),
            "-p",
            pidfile.as_str(),
        ]);
        args.iter().map(|a| escape_exec_arg(a)).collect::<Vec<_>>().join(" ")
    }

    /// Write the configuration and (re)start radvd with it. With nothing
    /// left to advertise radvd is stopped instead.
    ///
    /// # Errors
    /// Returns [`ComputeError::Io`] if the configuration cannot be written
    /// and [`ComputeError::Service`] if radvd does not stay up.
    pub async fn apply<S>(&self, services: &S, config: &HostConfig) -> Result<(), ComputeError>
    where
        S: ServiceManager + ?Sized,
    {
        write_read_only(&config.radvd_config(), &self.render()).await?;

        if self.is_empty() {
            if services.exists(RADVD_UNIT).await? {
                services.stop(RADVD_UNIT).await?;
            }
            return Ok(());
        }

        let unit = UnitFile::simple(self.exec_start(config), "aether IPv6 router advertisements");
        services.install(&unit, RADVD_UNIT).await?;
        if services.is_running(RADVD_UNIT).await? {
            services.stop(RADVD_UNIT).await?;
        }
        services.start(RADVD_UNIT).await?;
        confirm_running(services, RADVD_UNIT, config.startup_grace).await?;
        tracing::info!(networks = self.networks.len(), "router advertisements updated");
        Ok(())
    }
}

/// radvd refuses configuration files that others can write, so the file is
/// left read-only for its owner.
async fn write_read_only(path: &Path, text: &str) -> Result<(), ComputeError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::try_exists(path).await? {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    tokio::fs::write(path, text).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400)).await?;
    Ok(())
}
