//! Error types for the compute crate.

use aether_core::{CoreError, ImageName, OverlayName, VmId};

use crate::control::ControlError;

/// Coarse classification of a [`ComputeError`], used by front ends to decide
/// what a caller is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing input; nothing was changed.
    Validation,
    /// A VM, unit, device or base image does not exist; nothing was changed.
    NotFound,
    /// The VPN interface pool is empty; nothing was changed.
    ResourceExhausted,
    /// A subprocess or service reported failure; earlier steps may have
    /// been applied.
    ExternalTool,
    /// A bounded wait expired; the operation may still complete.
    Timeout,
    /// Anything else. Details are for the local log only.
    Internal,
}

/// Errors that can occur during VM lifecycle and provisioning operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ComputeError {
    /// Input failed validation before any mutation.
    #[error(transparent)]
    Invalid(#[from] CoreError),

    /// A unit name lacks its type suffix (e.g. `.service`).
    #[error("unit name \"{0}\" must contain the suffix, e.g. .service")]
    InvalidUnitName(String),

    /// No supervised unit exists for the VM.
    #[error("VM \"{0}\" does not exist")]
    VmNotFound(VmId),

    /// The requested base image is not present.
    #[error("image \"{0}\" does not exist")]
    ImageNotFound(ImageName),

    /// A VPN overlay has not been established on this host.
    #[error("VPN \"{0}\" is not established")]
    OverlayNotFound(OverlayName),

    /// A required network device is missing.
    #[error("network device {0} does not exist")]
    DeviceNotFound(String),

    /// Cloning the base image into a user image failed.
    #[error("could not create image for VM \"{vm_id}\": {reason}")]
    ImageClone { vm_id: VmId, reason: String },

    /// Every reserved VPN interface is assigned.
    #[error("no more free VPN interfaces")]
    PoolExhausted,

    /// Every /64 of the site prefix is advertised.
    #[error("no more free IPv6 networks")]
    PrefixExhausted,

    /// The /64 is already advertised on another interface.
    #[error("IPv6 prefix {0} is already assigned")]
    PrefixAssigned(String),

    /// A subprocess exited unsuccessfully.
    #[error("{tool} failed: {reason}")]
    ExternalTool { tool: String, reason: String },

    /// A service manager operation failed.
    #[error("could not {action} service {unit}: {reason}")]
    Service {
        unit: String,
        action: &'static str,
        reason: String,
    },

    /// Talking to a hypervisor control socket failed.
    #[error(transparent)]
    Control(#[from] ControlError),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ComputeError {
    /// Classifies the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_) | Self::InvalidUnitName(_) | Self::PrefixAssigned(_) => {
                ErrorKind::Validation
            }
            Self::VmNotFound(_)
            | Self::ImageNotFound(_)
            | Self::OverlayNotFound(_)
            | Self::DeviceNotFound(_) => ErrorKind::NotFound,
            Self::PoolExhausted | Self::PrefixExhausted => ErrorKind::ResourceExhausted,
            Self::ImageClone { .. } | Self::ExternalTool { .. } | Self::Service { .. } => {
                ErrorKind::ExternalTool
            }
            Self::Control(e) if e.is_timeout() => ErrorKind::Timeout,
            Self::Control(_) => ErrorKind::ExternalTool,
            Self::Io(_) => ErrorKind::Internal,
        }
    }
}
