//! Host-side engine of the aether VM orchestrator.
//!
//! Turns decoded commands into QEMU processes supervised as systemd user
//! units, wires them to VDE switches and tinc overlays, and talks to the
//! running guests over QMP and the guest agent. Every OS interaction sits
//! behind a trait so the lifecycle logic can run against in-memory fakes.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod control;
pub mod error;
pub mod exec;
pub mod host;
pub mod image;
pub mod launch;
pub mod lifecycle;
pub mod network;
pub mod process;
pub mod radvd;
pub mod services;
pub mod vpn;

pub use config::HostConfig;
pub use control::{
    ControlError, GuestAgentClient, GuestControl, GuestInterface, GuestIpAddress, MonitorClient,
    QemuControl,
};
pub use error::{ComputeError, ErrorKind};
pub use exec::{run_chain, CommandOutput, CommandRunner, SystemRunner};
pub use image::{GuestMount, ImageTool, LibguestfsImageTool};
pub use launch::{compile, escape_exec_arg, InterfaceRole, LaunchDefinition, NetworkInterface};
pub use lifecycle::{VmManager, NO_IP_HINT};
pub use network::Iproute2Network;
pub use process::{vm_id_from_process_name, vm_process_name, ProcessTable, SysinfoProcessTable};
pub use radvd::{RouterAdvertisements, SitePrefix, RADVD_UNIT};
pub use services::{
    confirm_running, vm_id_from_unit_name, vm_unit_name, ServiceManager, SystemdServiceManager,
    UnitFile,
};
pub use vpn::{OverlayManager, VpnPool, VpnSlot};
