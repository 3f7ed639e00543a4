//! Host preparation done once when the daemon starts.

use crate::exec::binary_on_path;
use crate::launch::escape_exec_arg;
use crate::network::Iproute2Network;
use crate::services::{confirm_running, ServiceManager};
use crate::{ComputeError, HostConfig};

/// Unit running the switch that every VM's public interface joins.
pub const PUBLIC_SWITCH_UNIT: &str = "aether-vde.service";

/// Binaries the daemon shells out to, with install hints.
pub const BINARY_DEPENDENCIES: &[(&str, &str)] = &[
    (
        "systemctl",
        "systemd is required by aether. Other service managers need their own \
         ServiceManager implementation.",
    ),
    (
        "guestmount",
        "libguestfs is required by aether. You can install it:\n\n    \
         On Ubuntu: apt install libguestfs-tools\n    \
         On Arch Linux: pacman -S libguestfs",
    ),
    (
        "qemu-img",
        "QEMU is required by aether. You can install it:\n\n    \
         On Ubuntu: apt install qemu-utils qemu-kvm\n    \
         On Arch Linux: pacman -S qemu-base",
    ),
    (
        "vde_switch",
        "VDE2 is required by aether. You can install it:\n\n    \
         On Ubuntu: apt install vde2\n    \
         On Arch Linux: pacman -S vde2",
    ),
    (
        "tincd",
        "tinc is required by aether for VPN overlays. You can install it:\n\n    \
         On Ubuntu: apt install tinc\n    \
         On Arch Linux: pacman -S tinc",
    ),
    (
        "radvd",
        "radvd is required by aether to advertise IPv6 networks. You can install it:\n\n    \
         On Ubuntu: apt install radvd\n    \
         On Arch Linux: pacman -S radvd",
    ),
];

/// The entries of `commands` that are not on `PATH`.
#[must_use]
pub fn missing_dependencies<'a>(commands: &[&'a str]) -> Vec<&'a str> {
    commands.iter().copied().filter(|c| !binary_on_path(c)).collect()
}

/// Install hints for `missing`, separated by blank lines.
#[must_use]
pub fn dependency_help_text(missing: &[&str]) -> String {
    missing
        .iter()
        .map(|dep| {
            BINARY_DEPENDENCIES
                .iter()
                .find(|(name, _)| name == dep)
                .map_or_else(|| format!("{dep} is required by aether."), |(_, help)| (*help).to_owned())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Fail unless the tap device for the public switch exists.
///
/// # Errors
/// Returns [`ComputeError::DeviceNotFound`] if the tap is missing.
pub async fn ensure_public_tap(
    network: &Iproute2Network,
    config: &HostConfig,
) -> Result<(), ComputeError> {
    if network.device_exists(&config.public_tap).await? {
        Ok(())
    } else {
        Err(ComputeError::DeviceNotFound(config.public_tap.clone()))
    }
}

/// Install and start the public VDE switch and check that it stays up.
///
/// # Errors
/// Returns [`ComputeError::Service`] if the unit cannot be installed, does
/// not start, or exits during the startup grace period.
pub async fn bring_up_public_switch<S>(services: &S, config: &HostConfig) -> Result<(), ComputeError>
where
    S: ServiceManager + ?Sized,
{
    let exec = [
        config.vde_switch_binary.as_str(),
        "-tap",
        config.public_tap.as_str(),
        "-s",
        &*config.public_vde_socket().to_string_lossy(),
    ]
    .iter()
    .map(|a| escape_exec_arg(a))
    .collect::<Vec<_>>()
    .join(" ");

    tracing::info!(tap = %config.public_tap, "bringing up public VDE switch");
    services.install_simple(&exec, PUBLIC_SWITCH_UNIT).await?;
    services.start(PUBLIC_SWITCH_UNIT).await?;
    confirm_running(services, PUBLIC_SWITCH_UNIT, config.startup_grace).await
}
