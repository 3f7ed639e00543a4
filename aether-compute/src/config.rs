//! Host configuration and the path conventions derived from it.

use std::path::PathBuf;
use std::time::Duration;

use aether_core::{ImageName, OverlayName, VmId};
use serde::{Deserialize, Serialize};

/// Where the orchestrator keeps its files and which binaries it drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct HostConfig {
    /// Read-only base images, `<name>.qcow2`.
    pub base_image_dir: PathBuf,

    /// Copy-on-write user images, `<vm-id>.qcow2`.
    pub user_image_dir: PathBuf,

    /// One tinc configuration tree per VPN overlay.
    pub vpn_config_dir: PathBuf,

    /// Control sockets, VDE switch sockets, pid files and mount points.
    pub runtime_dir: PathBuf,

    /// Guest memory size in mebibytes.
    pub memory_mib: u32,

    pub qemu_binary: String,
    pub vde_switch_binary: String,
    pub tincd_binary: String,
    pub radvd_binary: String,

    /// Tap device the public VDE switch is attached to.
    pub public_tap: String,

    /// Port of the first VPN slot; slot `n` listens on `vpn_base_port + n - 1`.
    pub vpn_base_port: u16,

    /// tinc node name of this host.
    pub node_name: String,

    /// How long a freshly started helper unit may take to report running.
    pub startup_grace: Duration,

    /// Bound on each QMP round trip.
    pub monitor_timeout: Duration,

    /// Bound on each guest agent round trip.
    pub agent_timeout: Duration,
}

impl HostConfig {
    /// Create a config with default binaries and timeouts.
    ///
    /// # Arguments
    /// - `base_image_dir`: directory holding the base images
    /// - `user_image_dir`: directory for per-VM images (created on demand)
    /// - `vpn_config_dir`: directory for tinc configuration trees
    /// - `runtime_dir`: directory for sockets and other runtime files
    #[must_use]
    pub fn new(
        base_image_dir: PathBuf,
        user_image_dir: PathBuf,
        vpn_config_dir: PathBuf,
        runtime_dir: PathBuf,
    ) -> Self {
        Self {
            base_image_dir,
            user_image_dir,
            vpn_config_dir,
            runtime_dir,
            memory_mib: 4096,
            qemu_binary: "qemu-system-x86_64".to_owned(),
            vde_switch_binary: "vde_switch".to_owned(),
            tincd_binary: "tincd".to_owned(),
            radvd_binary: "radvd".to_owned(),
            public_tap: "tap-vde".to_owned(),
            vpn_base_port: 20000,
            node_name: "localhost".to_owned(),
            startup_grace: Duration::from_millis(500),
            monitor_timeout: Duration::from_secs(5),
            agent_timeout: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn base_image(&self, name: &ImageName) -> PathBuf {
        self.base_image_dir.join(format!("{name}.qcow2"))
    }

    #[must_use]
    pub fn user_image(&self, vm_id: &VmId) -> PathBuf {
        self.user_image_dir.join(format!("{vm_id}.qcow2"))
    }

    /// QMP socket of a VM.
    #[must_use]
    pub fn monitor_socket(&self, vm_id: &VmId) -> PathBuf {
        self.runtime_dir.join(format!("aether-qmp-{vm_id}.sock"))
    }

    /// Guest agent socket of a VM.
    #[must_use]
    pub fn agent_socket(&self, vm_id: &VmId) -> PathBuf {
        self.runtime_dir.join(format!("aether-qga-{vm_id}.sock"))
    }

    /// Mount point used while editing a VM's user image.
    #[must_use]
    pub fn mount_point(&self, vm_id: &VmId) -> PathBuf {
        self.runtime_dir.join(format!("aether-mount-{vm_id}"))
    }

    /// Control socket of the switch every VM's public interface joins.
    #[must_use]
    pub fn public_vde_socket(&self) -> PathBuf {
        self.runtime_dir.join("vde.ctl")
    }

    /// Control socket of an overlay's private switch.
    #[must_use]
    pub fn overlay_vde_socket(&self, overlay: &OverlayName) -> PathBuf {
        self.runtime_dir.join(format!("vde-{overlay}.ctl"))
    }

    #[must_use]
    pub fn overlay_config_dir(&self, overlay: &OverlayName) -> PathBuf {
        self.vpn_config_dir.join(overlay.as_str())
    }

    #[must_use]
    pub fn tincd_pidfile(&self, overlay: &OverlayName) -> PathBuf {
        self.runtime_dir.join(format!("tincd-{overlay}.pid"))
    }

    /// Configuration shared by every advertised overlay.
    #[must_use]
    pub fn radvd_config(&self) -> PathBuf {
        self.vpn_config_dir.join("radvd.conf")
    }

    #[must_use]
    pub fn radvd_pidfile(&self) -> PathBuf {
        self.runtime_dir.join("radvd.pid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HostConfig {
        HostConfig::new(
            PathBuf::from("/srv/base"),
            PathBuf::from("/srv/user"),
            PathBuf::from("/etc/aether/vpn"),
            PathBuf::from("/run/aether"),
        )
    }

    #[test]
    fn vm_paths_derive_from_the_id() {
        let config = config();
        let id: VmId = match "qwertyui".parse() {
            Ok(id) => id,
            Err(e) => panic!("invalid test id: {e}"),
        };
        assert_eq!(config.user_image(&id), PathBuf::from("/srv/user/qwertyui.qcow2"));
        assert_eq!(
            config.monitor_socket(&id),
            PathBuf::from("/run/aether/aether-qmp-qwertyui.sock")
        );
        assert_eq!(
            config.agent_socket(&id),
            PathBuf::from("/run/aether/aether-qga-qwertyui.sock")
        );
    }

    #[test]
    fn base_image_uses_sanitized_name() {
        let config = config();
        let name: ImageName = match "../../etc/base1".parse() {
            Ok(n) => n,
            Err(e) => panic!("invalid test image: {e}"),
        };
        assert_eq!(config.base_image(&name), PathBuf::from("/srv/base/base1.qcow2"));
    }
}
