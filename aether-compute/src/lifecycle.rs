//! VM lifecycle management.
//!
//! VM state is never stored: existence comes from the service manager's
//! unit files, liveness from the unit state and the process table. Every
//! operation re-reads it.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use aether_core::{
    Command, CreateVmOptions, StopVmOptions, VmId, VmListing, VmState, VmStatus, VmTarget,
};
use serde_json::Value;

use crate::control::GuestControl;
use crate::image::ImageTool;
use crate::launch::{compile, NetworkInterface};
use crate::process::{vm_id_from_process_name, ProcessTable};
use crate::services::{vm_unit_name, ServiceManager};
use crate::vpn::OverlayManager;
use crate::{ComputeError, HostConfig};

/// Hint attached to a listing entry whose guest agent did not answer.
pub const NO_IP_HINT: &str = "Could not retrieve IP address for guest";

/// Creates, starts, stops, deletes and lists VMs on this host.
pub struct VmManager {
    config: Arc<HostConfig>,
    services: Arc<dyn ServiceManager>,
    images: Arc<dyn ImageTool>,
    processes: Arc<dyn ProcessTable>,
    control: Arc<dyn GuestControl>,
    overlays: OverlayManager,
}

impl VmManager {
    #[must_use]
    pub fn new(
        config: Arc<HostConfig>,
        services: Arc<dyn ServiceManager>,
        images: Arc<dyn ImageTool>,
        processes: Arc<dyn ProcessTable>,
        control: Arc<dyn GuestControl>,
        overlays: OverlayManager,
    ) -> Self {
        Self {
            config,
            services,
            images,
            processes,
            control,
            overlays,
        }
    }

    #[must_use]
    pub fn overlays(&self) -> &OverlayManager {
        &self.overlays
    }

    /// Run a decoded command and serialise its result.
    ///
    /// # Errors
    /// Propagates the error of the operation the command maps to.
    pub async fn execute(&self, command: Command) -> Result<Value, ComputeError> {
        let value = match command {
            Command::ListVms => serde_json::to_value(self.list().await?),
            Command::CreateVm(options) => serde_json::to_value(self.create(&options).await?),
            Command::StartVm(VmTarget { vm_id }) => serde_json::to_value(self.start(&vm_id).await?),
            Command::StopVm(StopVmOptions { vm_id, kill }) => {
                serde_json::to_value(self.stop(&vm_id, kill).await?)
            }
            Command::DeleteVm(VmTarget { vm_id }) => serde_json::to_value(self.delete(&vm_id).await?),
        };
        value.map_err(|e| ComputeError::Io(e.into()))
    }

    /// All VMs with a live hypervisor process, sorted by id.
    ///
    /// A guest whose agent does not answer is still listed, with no
    /// addresses and a hint.
    ///
    /// # Errors
    /// Returns an error only if the process table cannot be read.
    pub async fn list(&self) -> Result<Vec<VmListing>, ComputeError> {
        let ids: BTreeSet<VmId> = self
            .processes
            .process_names()
            .await?
            .iter()
            .filter_map(|name| vm_id_from_process_name(name))
            .collect();

        let mut vms = Vec::with_capacity(ids.len());
        for vm_id in ids {
            let listing = match self.control.guest_ip_addresses(&vm_id).await {
                Ok(ip_addresses) => VmListing {
                    vm_id,
                    ip_addresses,
                    hint: None,
                },
                Err(e) => {
                    tracing::debug!(vm_id = %vm_id, error = %e, "guest agent query failed");
                    VmListing {
                        vm_id,
                        ip_addresses: Vec::new(),
                        hint: Some(NO_IP_HINT.to_owned()),
                    }
                }
            };
            vms.push(listing);
        }
        Ok(vms)
    }

    /// Create a VM from a base image and start it. Does not wait for boot.
    ///
    /// # Errors
    /// - [`ComputeError::ImageNotFound`] if the base image is missing.
    /// - [`ComputeError::ImageClone`] if the user image cannot be created.
    /// - [`ComputeError::PoolExhausted`] if a VPN is requested and none is free.
    /// - Service, tool and I/O errors from provisioning. The user image and
    ///   unit are removed again in that case.
    pub async fn create(&self, options: &CreateVmOptions) -> Result<VmStatus, ComputeError> {
        let base = self.config.base_image(&options.image);
        if !tokio::fs::try_exists(&base).await? {
            return Err(ComputeError::ImageNotFound(options.image.clone()));
        }

        let mut vm_id = VmId::generate();
        while self.services.exists(&vm_unit_name(&vm_id)).await? {
            vm_id = VmId::generate();
        }
        tracing::info!(vm_id = %vm_id, image = %options.image, "creating VM");

        let user_image = self.config.user_image(&vm_id);
        self.images
            .clone_image(&base, &user_image)
            .await
            .map_err(|e| ComputeError::ImageClone {
                vm_id: vm_id.clone(),
                reason: e.to_string(),
            })?;

        if let Err(e) = self.provision(&vm_id, &user_image, options).await {
            tracing::error!(vm_id = %vm_id, error = %e, "VM creation failed, cleaning up");
            self.discard(&vm_id, &user_image).await;
            return Err(e);
        }

        tracing::info!(vm_id = %vm_id, "started VM");
        Ok(VmStatus::new(VmState::Starting, vm_id))
    }

    async fn provision(
        &self,
        vm_id: &VmId,
        user_image: &Path,
        options: &CreateVmOptions,
    ) -> Result<(), ComputeError> {
        if let Some(script) = &options.init_script {
            let mount = self
                .images
                .mount_guest(user_image, &self.config.mount_point(vm_id))
                .await?;
            let installed = self.images.install_startup_script(script, &mount).await;
            let unmounted = self.images.unmount(mount).await;
            installed?;
            unmounted?;
        }

        let mut interfaces = Vec::with_capacity(2);
        if let Some(vpn) = &options.vpn {
            let socket = self.overlays.establish(vpn).await?;
            let iface = NetworkInterface::private(vpn.clone(), socket);
            tracing::debug!(vm_id = %vm_id, mac = %iface.mac, vpn = %vpn, "assigned VPN MAC address");
            interfaces.push(iface);
        }
        let public = NetworkInterface::public(self.config.public_vde_socket());
        tracing::debug!(vm_id = %vm_id, mac = %public.mac, "assigned MAC address");
        interfaces.push(public);

        let launch = compile(vm_id, user_image, &interfaces, &self.config);
        self.services.install(&launch.unit(), &launch.unit_name).await?;
        self.services.start(&launch.unit_name).await
    }

    /// Best-effort removal of everything a failed create left behind.
    async fn discard(&self, vm_id: &VmId, user_image: &Path) {
        let unit = vm_unit_name(vm_id);
        if let Err(e) = self.services.stop(&unit).await {
            tracing::debug!(unit = %unit, error = %e, "stop during cleanup failed");
        }
        if let Err(e) = self.services.uninstall(&unit).await {
            tracing::warn!(unit = %unit, error = %e, "could not remove unit");
        }
        if let Err(e) = tokio::fs::remove_file(user_image).await {
            tracing::warn!(image = %user_image.display(), error = %e, "could not remove user image");
        }
    }

    /// Start an existing VM and enable it for autostart.
    ///
    /// # Errors
    /// Returns [`ComputeError::VmNotFound`] if the VM does not exist.
    pub async fn start(&self, vm_id: &VmId) -> Result<VmStatus, ComputeError> {
        let unit = self.existing_unit(vm_id).await?;
        if self.services.is_running(&unit).await? {
            return Ok(VmStatus::new(VmState::Starting, vm_id.clone())
                .with_hint(format!("VM \"{vm_id}\" was already started")));
        }
        self.services.start(&unit).await?;
        self.services.enable(&unit).await?;
        tracing::info!(vm_id = %vm_id, "started VM");
        Ok(VmStatus::new(VmState::Starting, vm_id.clone()))
    }

    /// Stop a VM and remove it from autostart.
    ///
    /// With `kill` the hypervisor is stopped by the service manager;
    /// otherwise the guest is asked to power down. Returns without waiting
    /// for the VM to go away.
    ///
    /// # Errors
    /// Returns [`ComputeError::VmNotFound`] if the VM does not exist and
    /// [`ComputeError::Control`] if the power-down request fails.
    pub async fn stop(&self, vm_id: &VmId, kill: bool) -> Result<VmStatus, ComputeError> {
        let state = if kill { VmState::Killed } else { VmState::Stopped };
        let unit = self.existing_unit(vm_id).await?;

        if !self.services.is_running(&unit).await? {
            return Ok(VmStatus::new(state, vm_id.clone())
                .with_hint(format!("VM \"{vm_id}\" was not running")));
        }

        self.services.disable(&unit).await?;
        if kill {
            self.services.stop(&unit).await?;
        } else {
            self.control.powerdown(vm_id).await?;
        }
        tracing::info!(vm_id = %vm_id, status = %state, "stopping VM");
        Ok(VmStatus::new(state, vm_id.clone()))
    }

    /// Kill a VM if it runs, then remove its unit and user image.
    ///
    /// # Errors
    /// Returns [`ComputeError::VmNotFound`] if the VM does not exist.
    pub async fn delete(&self, vm_id: &VmId) -> Result<VmStatus, ComputeError> {
        self.stop(vm_id, true).await?;

        self.services.uninstall(&vm_unit_name(vm_id)).await?;
        let user_image = self.config.user_image(vm_id);
        match tokio::fs::remove_file(&user_image).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(vm_id = %vm_id, image = %user_image.display(), "user image already gone");
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(vm_id = %vm_id, "deleted VM");
        Ok(VmStatus::new(VmState::Deleted, vm_id.clone()))
    }

    /// Current state of one VM.
    ///
    /// # Errors
    /// Returns [`ComputeError::VmNotFound`] if the VM does not exist.
    pub async fn info(&self, vm_id: &VmId) -> Result<VmStatus, ComputeError> {
        let unit = self.existing_unit(vm_id).await?;
        let state = if self.services.is_running(&unit).await? {
            VmState::Running
        } else {
            VmState::Stopped
        };
        Ok(VmStatus::new(state, vm_id.clone()))
    }

    async fn existing_unit(&self, vm_id: &VmId) -> Result<String, ComputeError> {
        let unit = vm_unit_name(vm_id);
        if self.services.exists(&unit).await? {
            Ok(unit)
        } else {
            Err(ComputeError::VmNotFound(vm_id.clone()))
        }
    }
}
