//! Host network topology: bridges and tap devices via iproute2.
//!
//! All names are validated before the first command runs, so a rejected
//! request never touches the host. Mutations run as a chain that stops at
//! the first failing step; completed steps are left in place.

use std::sync::Arc;

use aether_core::{validate_device_name, validate_ip_address, validate_user_name};

use crate::exec::{argv, run_chain, CommandRunner};
use crate::ComputeError;

/// Creates and inspects network devices with the `ip` tool.
pub struct Iproute2Network {
    runner: Arc<dyn CommandRunner>,
    sudo: bool,
}

impl Iproute2Network {
    /// # Arguments
    /// - `runner`: executes the `ip` commands
    /// - `sudo`: prefix mutating commands with `sudo`
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, sudo: bool) -> Self {
        Self { runner, sudo }
    }

    fn privileged<I, S>(&self, parts: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cmd = if self.sudo { vec!["sudo".to_owned()] } else { Vec::new() };
        cmd.extend(argv(parts));
        cmd
    }

    /// Whether a network device exists.
    ///
    /// # Errors
    /// Returns a validation error for a malformed name.
    pub async fn device_exists(&self, name: &str) -> Result<bool, ComputeError> {
        validate_device_name(name)?;
        // `ip link show` prints nothing on stdout for an unknown device.
        let out = self.runner.run(&argv(["ip", "link", "show", "dev", name])).await?;
        Ok(out.success() && !out.stdout.trim().is_empty())
    }

    /// Create a bridge and bring it up. An existing device is left alone.
    ///
    /// # Errors
    /// Returns a validation error for a malformed name and
    /// [`ComputeError::ExternalTool`] if a command fails.
    pub async fn create_bridge(&self, name: &str) -> Result<(), ComputeError> {
        validate_device_name(name)?;
        if self.device_exists(name).await? {
            tracing::debug!(device = %name, "bridge already exists, will not re-create");
            return Ok(());
        }
        tracing::debug!(device = %name, "creating bridge");
        run_chain(
            self.runner.as_ref(),
            &[
                self.privileged(["ip", "link", "add", name, "type", "bridge"]),
                self.privileged(["ip", "link", "set", name, "up"]),
            ],
        )
        .await
    }

    /// Create a tap device owned by `user`, optionally enslaved to `bridge`.
    /// An existing device is left alone.
    ///
    /// # Errors
    /// Returns a validation error for a malformed name or user and
    /// [`ComputeError::ExternalTool`] if a command fails.
    pub async fn create_tap(
        &self,
        name: &str,
        user: &str,
        bridge: Option<&str>,
    ) -> Result<(), ComputeError> {
        validate_device_name(name)?;
        validate_user_name(user)?;
        if let Some(bridge) = bridge {
            validate_device_name(bridge)?;
        }

        if self.device_exists(name).await? {
            tracing::debug!(device = %name, "tap already exists, will not re-create");
            return Ok(());
        }

        tracing::debug!(device = %name, %user, "creating tap device");
        let mut commands = vec![
            self.privileged(["ip", "tuntap", "add", "dev", name, "mode", "tap", "user", user]),
            self.privileged(["ip", "link", "set", "dev", name, "up"]),
        ];
        if let Some(bridge) = bridge {
            commands.push(self.privileged(["ip", "link", "set", name, "master", bridge]));
        }
        run_chain(self.runner.as_ref(), &commands).await
    }

    /// Move `phys` into a (possibly new) bridge, optionally moving the host
    /// address and default route onto the bridge.
    ///
    /// # Errors
    /// Returns a validation error for any malformed name or address and
    /// [`ComputeError::ExternalTool`] if a command fails.
    pub async fn bridged_network(
        &self,
        bridge: &str,
        phys: &str,
        ip: Option<&str>,
        gateway: Option<&str>,
    ) -> Result<(), ComputeError> {
        validate_device_name(bridge)?;
        validate_device_name(phys)?;
        if let Some(ip) = ip {
            validate_ip_address(ip)?;
        }
        if let Some(gateway) = gateway {
            validate_ip_address(gateway)?;
        }

        self.create_bridge(bridge).await?;

        let mut commands = vec![
            self.privileged(["ip", "link", "set", phys, "up"]),
            self.privileged(["ip", "link", "set", phys, "master", bridge]),
            self.privileged(["ip", "addr", "flush", "dev", phys]),
        ];
        if let Some(ip) = ip {
            commands.push(self.privileged(["ip", "addr", "flush", "dev", bridge]));
            commands.push(self.privileged(["ip", "addr", "add", ip, "dev", bridge]));
        }
        if let Some(gateway) = gateway {
            commands.push(self.privileged([
                "ip", "route", "add", "default", "via", gateway, "dev", bridge,
            ]));
        }
        run_chain(self.runner.as_ref(), &commands).await?;

        tracing::info!(%bridge, %phys, "bridged network configured");
        Ok(())
    }
}
