//! Live process enumeration.

use aether_core::VmId;
use async_trait::async_trait;
use sysinfo::System;

use crate::ComputeError;

const VM_PROCESS_PREFIX: &str = "vm-";

/// Process name QEMU is told to use for a VM (`-name ...,process=`).
#[must_use]
pub fn vm_process_name(vm_id: &VmId) -> String {
    format!("{VM_PROCESS_PREFIX}{vm_id}")
}

/// Inverse of [`vm_process_name`].
#[must_use]
pub fn vm_id_from_process_name(name: &str) -> Option<VmId> {
    name.strip_prefix(VM_PROCESS_PREFIX)?.parse().ok()
}

/// Read access to the host process table.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Names of all live processes. Order is unspecified; duplicates are
    /// possible.
    async fn process_names(&self) -> Result<Vec<String>, ComputeError>;
}

/// [`ProcessTable`] backed by `sysinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoProcessTable;

#[async_trait]
impl ProcessTable for SysinfoProcessTable {
    async fn process_names(&self) -> Result<Vec<String>, ComputeError> {
        tokio::task::spawn_blocking(|| {
            let mut system = System::new();
            system.refresh_processes();
            system
                .processes()
                .values()
                .map(|p| p.name().to_owned())
                .collect()
        })
        .await
        .map_err(|e| ComputeError::Io(std::io::Error::other(e)))
    }
}
