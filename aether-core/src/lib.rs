//! Core types for the aether VM orchestrator.
//!
//! Defines the identifiers, validated names and wire types shared by the
//! compute engine and the message broker front end.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod command;
pub mod error;
pub mod id;
pub mod names;
pub mod response;

pub use command::{
    Command, CommandKind, CreateVmOptions, DecodeError, DeliveryClass, Envelope, StopVmOptions,
    VmTarget,
};
pub use error::CoreError;
pub use id::{MacAddress, VmId, VM_ID_LEN};
pub use names::{
    validate_device_name, validate_hostname, validate_ip_address, validate_user_name, ImageName,
    OverlayName,
};
pub use response::{ExecutionInfo, ExecutionStatus, Reply, VmListing, VmState, VmStatus};
