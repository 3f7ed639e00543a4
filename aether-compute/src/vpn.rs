//! Private VPN overlays: a pool of reserved interfaces and the tinc + VDE
//! plumbing behind each overlay.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use aether_core::{validate_hostname, validate_ip_address, CoreError, OverlayName};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::exec::{run_chain, CommandRunner};
use crate::launch::escape_exec_arg;
use crate::radvd::RouterAdvertisements;
use crate::services::{confirm_running, ServiceManager, UnitFile};
use crate::{ComputeError, HostConfig};

const SLOT_PREFIX: &str = "aeth-vpntnc-";

/// One reserved VPN interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnSlot {
    /// 1-based position in the pool.
    pub index: usize,
    pub interface: String,
}

/// Fixed set of VPN interfaces and their assignment to overlays.
///
/// Every assigned slot belongs to exactly one overlay and every overlay
/// holds at most one slot.
#[derive(Debug, Clone, Default)]
pub struct VpnPool {
    free: BTreeMap<usize, VpnSlot>,
    assigned: BTreeMap<OverlayName, VpnSlot>,
}

impl VpnPool {
    /// A pool of `capacity` slots named `aeth-vpntnc-1` onwards.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let free = (1..=capacity)
            .map(|index| {
                let slot = VpnSlot {
                    index,
                    interface: format!("{SLOT_PREFIX}{index}"),
                };
                (index, slot)
            })
            .collect();
        Self {
            free,
            assigned: BTreeMap::new(),
        }
    }

    /// Number of unassigned slots.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn assignment(&self, overlay: &OverlayName) -> Option<&VpnSlot> {
        self.assigned.get(overlay)
    }

    /// Assign a slot to `overlay`. An overlay that already holds a slot
    /// keeps it.
    ///
    /// # Errors
    /// Returns [`ComputeError::PoolExhausted`] when no slot is free.
    pub fn allocate(&mut self, overlay: &OverlayName) -> Result<VpnSlot, ComputeError> {
        if let Some(slot) = self.assigned.get(overlay) {
            return Ok(slot.clone());
        }
        let (_, slot) = self.free.pop_first().ok_or(ComputeError::PoolExhausted)?;
        self.assigned.insert(overlay.clone(), slot.clone());
        Ok(slot)
    }

    /// Return the slot held by `overlay` to the pool.
    pub fn release(&mut self, overlay: &OverlayName) -> Option<VpnSlot> {
        let slot = self.assigned.remove(overlay)?;
        self.free.insert(slot.index, slot.clone());
        Some(slot)
    }
}

fn switch_unit(overlay: &OverlayName) -> String {
    format!("aether-vde-vpn-{overlay}.service")
}

fn tincd_unit(overlay: &OverlayName) -> String {
    format!("aether-tincd-{overlay}.service")
}

/// Brings VPN overlays up and down.
///
/// The pool lock is held for the whole of [`OverlayManager::establish`] and
/// [`OverlayManager::teardown`], so overlay changes never interleave.
pub struct OverlayManager {
    pool: Mutex<VpnPool>,
    config: Arc<HostConfig>,
    services: Arc<dyn ServiceManager>,
    runner: Arc<dyn CommandRunner>,
    adverts: Option<Mutex<RouterAdvertisements>>,
}

impl OverlayManager {
    #[must_use]
    pub fn new(
        pool: VpnPool,
        config: Arc<HostConfig>,
        services: Arc<dyn ServiceManager>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            pool: Mutex::new(pool),
            config,
            services,
            runner,
            adverts: None,
        }
    }

    /// Also advertise an IPv6 /64 on every overlay interface.
    #[must_use]
    pub fn with_router_advertisements(mut self, adverts: RouterAdvertisements) -> Self {
        self.adverts = Some(Mutex::new(adverts));
        self
    }

    pub async fn available(&self) -> usize {
        self.pool.lock().await.available()
    }

    pub async fn assignment(&self, overlay: &OverlayName) -> Option<VpnSlot> {
        self.pool.lock().await.assignment(overlay).cloned()
    }

    /// Bring up `overlay` and return the VDE socket VMs attach to.
    ///
    /// An overlay that is already up is reused; its switch is restarted if
    /// it has died since.
    ///
    /// # Errors
    /// - [`ComputeError::PoolExhausted`] if no slot is free; nothing is changed.
    /// - [`ComputeError::Service`] if a unit cannot be installed or started,
    ///   or the overlay switch exits during startup.
    /// - [`ComputeError::ExternalTool`] if key generation fails.
    pub async fn establish(&self, overlay: &OverlayName) -> Result<PathBuf, ComputeError> {
        validate_hostname(&self.config.node_name)?;
        let socket = self.config.overlay_vde_socket(overlay);
        let switch = switch_unit(overlay);

        let mut pool = self.pool.lock().await;
        if let Some(slot) = pool.assignment(overlay).cloned() {
            if !self.services.is_running(&switch).await? {
                tracing::warn!(vpn = %overlay, unit = %switch, "VPN switch is down, restarting");
                self.start_switch(overlay, &switch).await?;
            }
            tracing::debug!(vpn = %overlay, interface = %slot.interface, "reusing VPN");
            return Ok(socket);
        }
        if pool.available() == 0 {
            return Err(ComputeError::PoolExhausted);
        }

        tracing::info!(vpn = %overlay, "bringing up VDE networking for VPN");
        let exec = [
            self.config.vde_switch_binary.as_str(),
            "-s",
            &*socket.to_string_lossy(),
        ]
        .iter()
        .map(|a| escape_exec_arg(a))
        .collect::<Vec<_>>()
        .join(" ");
        self.services.install_simple(&exec, &switch).await?;
        self.start_switch(overlay, &switch).await?;

        let slot = pool.allocate(overlay)?;
        if let Err(e) = self.start_tinc(overlay, &slot).await {
            pool.release(overlay);
            return Err(e);
        }
        tracing::info!(vpn = %overlay, interface = %slot.interface, "using VPN");
        self.advertise(overlay, &slot.interface).await;
        Ok(socket)
    }

    async fn start_switch(&self, overlay: &OverlayName, switch: &str) -> Result<(), ComputeError> {
        self.services.start(switch).await?;
        confirm_running(self.services.as_ref(), switch, self.config.startup_grace)
            .await
            .inspect_err(|e| tracing::error!(vpn = %overlay, error = %e, "VPN switch failed to start"))
    }

    /// Failures are logged, not returned.
    async fn advertise(&self, overlay: &OverlayName, interface: &str) {
        let Some(adverts) = &self.adverts else {
            return;
        };
        let mut adverts = adverts.lock().await;
        let result = match adverts.assign(interface) {
            Ok(prefix) => {
                tracing::info!(vpn = %overlay, prefix = %prefix, "advertising IPv6 network");
                adverts.apply(self.services.as_ref(), &self.config).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(vpn = %overlay, error = %e, "could not advertise IPv6 network");
        }
    }

    async fn withdraw(&self, overlay: &OverlayName, interface: &str) {
        let Some(adverts) = &self.adverts else {
            return;
        };
        let mut adverts = adverts.lock().await;
        if adverts.remove_interface(interface).is_none() {
            return;
        }
        if let Err(e) = adverts.apply(self.services.as_ref(), &self.config).await {
            tracing::warn!(vpn = %overlay, error = %e, "could not withdraw IPv6 network");
        }
    }

    async fn start_tinc(&self, overlay: &OverlayName, slot: &VpnSlot) -> Result<(), ComputeError> {
        let port = u16::try_from(slot.index - 1)
            .ok()
            .and_then(|offset| self.config.vpn_base_port.checked_add(offset))
            .ok_or(ComputeError::PoolExhausted)?;

        let dir = self.config.overlay_config_dir(overlay);
        let socket = self.config.overlay_vde_socket(overlay);
        tokio::fs::create_dir_all(dir.join("hosts")).await?;

        let tinc_conf = format!(
            "Name = {node}\nMode = switch\nInterface = {iface}\nPort = {port}\nDeviceType = vde\nDevice = {sock}\n",
            node = self.config.node_name,
            iface = slot.interface,
            sock = socket.display(),
        );
        tokio::fs::write(dir.join("tinc.conf"), tinc_conf).await?;
        tokio::fs::write(
            dir.join("hosts").join(&self.config.node_name),
            format!("Port = {port}\n"),
        )
        .await?;

        tracing::debug!(vpn = %overlay, "generating key pair for tinc");
        let dir_arg = dir.to_string_lossy().into_owned();
        run_chain(
            self.runner.as_ref(),
            &[vec![
                self.config.tincd_binary.clone(),
                "-K".to_owned(),
                "-c".to_owned(),
                dir_arg.clone(),
            ]],
        )
        .await?;

        let pidfile = self.config.tincd_pidfile(overlay);
        let exec = [
            self.config.tincd_binary.as_str(),
            "-D",
            "-c",
            dir_arg.as_str(),
            "--pidfile",
            &*pidfile.to_string_lossy(),
        ]
        .iter()
        .map(|a| escape_exec_arg(a))
        .collect::<Vec<_>>()
        .join(" ");

        let unit_name = tincd_unit(overlay);
        let unit = UnitFile::simple(exec, format!("aether {overlay} VPN with tincd"));
        self.services.install(&unit, &unit_name).await?;
        self.services.enable(&unit_name).await?;
        self.services.start(&unit_name).await
    }

    /// Register a remote tinc node and connect to it.
    ///
    /// # Errors
    /// Returns a validation error for a bad host name or address and
    /// [`ComputeError::OverlayNotFound`] if the overlay has no configuration.
    pub async fn add_peer(
        &self,
        overlay: &OverlayName,
        host: &str,
        address: &str,
        public_key: &str,
    ) -> Result<(), ComputeError> {
        validate_hostname(host)?;
        validate_ip_address(address)?;
        let key = public_key.trim();
        if !(key.starts_with("-----BEGIN ") && key.ends_with("-----")) {
            return Err(CoreError::InvalidOptions {
                command: "add-peer",
                reason: "public key must be a single PEM block".to_owned(),
            }
            .into());
        }

        let dir = self.config.overlay_config_dir(overlay);
        if !tokio::fs::try_exists(dir.join("tinc.conf")).await? {
            return Err(ComputeError::OverlayNotFound(overlay.clone()));
        }

        let host_file = format!("Address = {address}\n\n{key}\n");
        tokio::fs::write(dir.join("hosts").join(host), host_file).await?;

        let mut conf = tokio::fs::OpenOptions::new()
            .append(true)
            .open(dir.join("tinc.conf"))
            .await?;
        conf.write_all(format!("ConnectTo = {host}\n").as_bytes()).await?;
        conf.flush().await?;

        tracing::info!(vpn = %overlay, peer = %host, "added VPN peer");
        Ok(())
    }

    /// Stop the overlay's daemons, delete its configuration and free its slot.
    ///
    /// # Errors
    /// Returns [`ComputeError::Service`] if a unit cannot be removed or
    /// [`ComputeError::Io`] if the configuration cannot be deleted.
    pub async fn teardown(&self, overlay: &OverlayName) -> Result<(), ComputeError> {
        let mut pool = self.pool.lock().await;

        for unit in [tincd_unit(overlay), switch_unit(overlay)] {
            if self.services.exists(&unit).await? {
                if let Err(e) = self.services.disable(&unit).await {
                    tracing::debug!(unit = %unit, error = %e, "disable during teardown failed");
                }
                if let Err(e) = self.services.stop(&unit).await {
                    tracing::debug!(unit = %unit, error = %e, "stop during teardown failed");
                }
            }
            self.services.uninstall(&unit).await?;
        }

        match tokio::fs::remove_dir_all(self.config.overlay_config_dir(overlay)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(slot) = pool.release(overlay) {
            self.withdraw(overlay, &slot.interface).await;
            tracing::info!(vpn = %overlay, interface = %slot.interface, "VPN torn down");
        }
        Ok(())
    }
}
