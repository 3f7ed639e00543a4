//! Validation of the caller-supplied names that end up in file paths,
//! device names, unit names and command lines.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Maximum length of a Linux network interface name (`IFNAMSIZ - 1`).
pub const MAX_DEVICE_NAME_LEN: usize = 15;

/// Maximum length of a VPN overlay name.
pub const MAX_OVERLAY_NAME_LEN: usize = 8;

/// Checks a network device name against `^[a-z0-9-]{1,15}$`.
///
/// # Errors
/// Returns [`CoreError::InvalidDeviceName`] describing the first violated rule.
pub fn validate_device_name(name: &str) -> Result<(), CoreError> {
    let invalid = |reason: &str| CoreError::InvalidDeviceName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };
    if name.is_empty() {
        return Err(invalid("zero-length device name not allowed"));
    }
    if name.len() > MAX_DEVICE_NAME_LEN {
        return Err(invalid("device name must be max. 15 characters"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid("only lowercase letters, digits and '-' are allowed"));
    }
    Ok(())
}

/// Checks an IPv4/IPv6 address with optional prefix length against
/// `^[0-9.:a-f]+(/\d+)?$`.
///
/// The check is deliberately permissive: it only guarantees that the value
/// cannot smuggle anything but an address into an `ip` invocation.
///
/// # Errors
/// Returns [`CoreError::InvalidIpAddress`].
pub fn validate_ip_address(ip: &str) -> Result<(), CoreError> {
    let (address, prefix) = match ip.split_once('/') {
        Some((address, prefix)) => (address, Some(prefix)),
        None => (ip, None),
    };
    let address_ok = !address.is_empty()
        && address
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b':' | b'a'..=b'f'));
    let prefix_ok = prefix.is_none_or(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    if address_ok && prefix_ok {
        Ok(())
    } else {
        Err(CoreError::InvalidIpAddress(ip.to_owned()))
    }
}

/// Checks a VPN host name against `^[a-z0-9]+$`.
///
/// # Errors
/// Returns [`CoreError::InvalidHostname`].
pub fn validate_hostname(hostname: &str) -> Result<(), CoreError> {
    if !hostname.is_empty()
        && hostname
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    {
        Ok(())
    } else {
        Err(CoreError::InvalidHostname(hostname.to_owned()))
    }
}

/// Checks a host user name against `^[a-z_][a-z0-9_-]{0,31}$`.
///
/// # Errors
/// Returns [`CoreError::InvalidUserName`].
pub fn validate_user_name(user: &str) -> Result<(), CoreError> {
    let mut bytes = user.bytes();
    let first_ok = bytes
        .next()
        .is_some_and(|b| b.is_ascii_lowercase() || b == b'_');
    let rest_ok = bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if first_ok && rest_ok && user.len() <= 32 {
        Ok(())
    } else {
        Err(CoreError::InvalidUserName(user.to_owned()))
    }
}

/// Name of a VPN overlay: 1 to 8 characters of `[a-z0-9]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OverlayName(String);

impl OverlayName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for OverlayName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= MAX_OVERLAY_NAME_LEN
            && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(CoreError::InvalidOverlayName(s.to_owned()))
        }
    }
}

impl TryFrom<String> for OverlayName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OverlayName> for String {
    fn from(name: OverlayName) -> Self {
        name.0
    }
}

impl fmt::Display for OverlayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a base image, reduced to its final path component.
///
/// `"../../etc/base"` becomes `"base"`, so a caller can never point the
/// orchestrator outside the base image directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageName(String);

impl ImageName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ImageName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let base = s.rsplit('/').next().unwrap_or_default();
        if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
            return Err(CoreError::InvalidImageName(s.to_owned()));
        }
        Ok(Self(base.to_owned()))
    }
}

impl TryFrom<String> for ImageName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageName> for String {
    fn from(name: ImageName) -> Self {
        name.0
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
