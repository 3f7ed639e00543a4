/// Errors produced by the `aether-core` crate.
///
/// Every variant is a validation failure: it is raised before anything on
/// the host has been touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A VM identifier is not 8 lowercase ASCII letters.
    #[error("invalid VM id \"{value}\": {reason}")]
    InvalidVmId { value: String, reason: String },

    /// A network device name failed validation.
    #[error("invalid network device name \"{name}\": {reason}")]
    InvalidDeviceName { name: String, reason: String },

    /// An IP address (optionally with prefix length) failed validation.
    #[error("invalid IP address provided ({0})")]
    InvalidIpAddress(String),

    /// A VPN overlay name failed validation.
    #[error("invalid name for network provided (\"{0}\")")]
    InvalidOverlayName(String),

    /// A host name for the VPN configuration failed validation.
    #[error("invalid hostname provided (\"{0}\")")]
    InvalidHostname(String),

    /// A host user name for device ownership failed validation.
    #[error("invalid user name \"{0}\"")]
    InvalidUserName(String),

    /// A base image name is empty or refers to a directory.
    #[error("invalid image name \"{0}\"")]
    InvalidImageName(String),

    /// A MAC address string could not be parsed.
    #[error("invalid MAC address \"{0}\"")]
    InvalidMacAddress(String),

    /// The options of a recognised command are missing or mistyped.
    #[error("invalid options for {command}: {reason}")]
    InvalidOptions {
        command: &'static str,
        reason: String,
    },
}
