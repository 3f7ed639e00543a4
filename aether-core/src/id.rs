use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CoreError;

/// Number of characters in a [`VmId`].
pub const VM_ID_LEN: usize = 8;

/// Identifier of a virtual machine: 8 lowercase ASCII letters.
///
/// The id is the only link between a VM and its host resources (unit name,
/// process name, user image, control sockets), so it is generated from fresh
/// randomness every time and never derived from a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VmId(String);

impl VmId {
    /// Generates a new random `VmId`.
    #[must_use]
    pub fn generate() -> Self {
        let mut id = String::with_capacity(VM_ID_LEN);
        while id.len() < VM_ID_LEN {
            for (i, byte) in random_bytes().into_iter().enumerate() {
                // Bytes 6 and 8 carry the UUID version and variant bits.
                if i == 6 || i == 8 {
                    continue;
                }
                // Rejection sampling keeps the letters uniformly distributed.
                if byte >= 234 {
                    continue;
                }
                id.push(char::from(b'a' + byte % 26));
                if id.len() == VM_ID_LEN {
                    break;
                }
            }
        }
        Self(id)
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VmId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CoreError::InvalidVmId {
            value: s.to_owned(),
            reason: reason.to_owned(),
        };
        if s.len() != VM_ID_LEN {
            return Err(invalid("must be exactly 8 characters"));
        }
        if !s.bytes().all(|b| b.is_ascii_lowercase()) {
            return Err(invalid("must contain only lowercase letters"));
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for VmId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VmId> for String {
    fn from(id: VmId) -> Self {
        id.0
    }
}

/// A 48-bit MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Generates a random locally administered unicast address.
    ///
    /// Bit 1 of the first octet (locally administered) is set and bit 0
    /// (multicast) is cleared, so the address can neither collide with a
    /// vendor-assigned one nor be mistaken for a group address.
    #[must_use]
    pub fn random() -> Self {
        let bytes = random_bytes();
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&bytes[..6]);
        octets[0] = (octets[0] | 0x02) & 0xfe;
        Self(octets)
    }

    /// Returns the raw octets.
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    #[must_use]
    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    #[must_use]
    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidMacAddress(s.to_owned());
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

/// 16 bytes from the v4 UUID generator, the workspace's randomness source.
pub(crate) fn random_bytes() -> [u8; 16] {
    Uuid::new_v4().into_bytes()
}
