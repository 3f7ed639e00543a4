//! Inbound command envelope.
//!
//! Decoding happens in two phases. [`Envelope::decode`] checks the shape of
//! the message and resolves the command name; a failure there means the
//! message is not addressed to anyone and is only logged. [`Envelope::into_command`]
//! then parses the options into the typed struct of that command; a failure
//! there is reported back to the caller.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CoreError, ImageName, OverlayName, VmId};

/// How a command is delivered to orchestrator instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    /// Delivered to every instance; only the one supervising the VM acts.
    Broadcast,
    /// Delivered to exactly one of the competing instances.
    Competing,
}

/// The closed set of commands understood by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    ListVms,
    CreateVm,
    StartVm,
    StopVm,
    DeleteVm,
}

impl CommandKind {
    /// All commands, in binding order.
    pub const ALL: [Self; 5] = [
        Self::ListVms,
        Self::StartVm,
        Self::StopVm,
        Self::DeleteVm,
        Self::CreateVm,
    ];

    /// Wire name, also used as the routing key.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ListVms => "list-vms",
            Self::CreateVm => "create-vm",
            Self::StartVm => "start-vm",
            Self::StopVm => "stop-vm",
            Self::DeleteVm => "delete-vm",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    #[must_use]
    pub fn delivery(self) -> DeliveryClass {
        match self {
            Self::CreateVm => DeliveryClass::Competing,
            Self::ListVms | Self::StartVm | Self::StopVm | Self::DeleteVm => {
                DeliveryClass::Broadcast
            }
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Options of `create-vm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CreateVmOptions {
    /// Base image to clone.
    pub image: ImageName,
    /// Script run once at the first boot of the guest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_script: Option<String>,
    /// VPN overlay to attach a private interface to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn: Option<OverlayName>,
}

/// Options of commands addressing a single existing VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmTarget {
    pub vm_id: VmId,
}

/// Options of `stop-vm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StopVmOptions {
    pub vm_id: VmId,
    /// Kill the hypervisor process instead of a guest power-down.
    #[serde(default)]
    pub kill: bool,
}

/// A fully decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListVms,
    CreateVm(CreateVmOptions),
    StartVm(VmTarget),
    StopVm(StopVmOptions),
    DeleteVm(VmTarget),
}

impl Command {
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::ListVms => CommandKind::ListVms,
            Self::CreateVm(_) => CommandKind::CreateVm,
            Self::StartVm(_) => CommandKind::StartVm,
            Self::StopVm(_) => CommandKind::StopVm,
            Self::DeleteVm(_) => CommandKind::DeleteVm,
        }
    }
}

/// Reasons an inbound message is not a command envelope at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The body is not a JSON object with a string `command` member.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The command name is not one of [`CommandKind::ALL`].
    #[error("invalid command \"{0}\" specified")]
    UnknownCommand(String),
}

/// A message whose command name has been resolved but whose options have
/// not been parsed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: CommandKind,
    pub options: Map<String, Value>,
}

impl Envelope {
    /// Parses the raw message body.
    ///
    /// A missing or `null` `options` member is treated as empty.
    ///
    /// # Errors
    /// Returns [`DecodeError::Malformed`] if the body is not a JSON object,
    /// has no string `command`, or has non-object `options`.
    /// Returns [`DecodeError::UnknownCommand`] for unrecognised names.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| DecodeError::Malformed(format!("body is not valid JSON: {e}")))?;
        let Value::Object(mut object) = value else {
            return Err(DecodeError::Malformed("body is not a JSON object".to_owned()));
        };

        let name = match object.get("command") {
            Some(Value::String(name)) => name.clone(),
            Some(_) => {
                return Err(DecodeError::Malformed("\"command\" is not a string".to_owned()))
            }
            None => return Err(DecodeError::Malformed("no \"command\" specified".to_owned())),
        };
        let kind = CommandKind::from_name(&name).ok_or(DecodeError::UnknownCommand(name))?;

        let options = match object.remove("options") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(options)) => options,
            Some(_) => {
                return Err(DecodeError::Malformed(
                    "\"options\" is not a JSON object".to_owned(),
                ))
            }
        };

        Ok(Self { kind, options })
    }

    /// Parses the options into the typed command.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidOptions`] when a required option is missing
    /// or an option fails validation.
    pub fn into_command(self) -> Result<Command, CoreError> {
        let kind = self.kind;
        Ok(match kind {
            CommandKind::ListVms => Command::ListVms,
            CommandKind::CreateVm => Command::CreateVm(parse_options(kind, self.options)?),
            CommandKind::StartVm => Command::StartVm(parse_options(kind, self.options)?),
            CommandKind::StopVm => Command::StopVm(parse_options(kind, self.options)?),
            CommandKind::DeleteVm => Command::DeleteVm(parse_options(kind, self.options)?),
        })
    }
}

fn parse_options<T: DeserializeOwned>(
    kind: CommandKind,
    options: Map<String, Value>,
) -> Result<T, CoreError> {
    serde_json::from_value(Value::Object(options)).map_err(|e| CoreError::InvalidOptions {
        command: kind.name(),
        reason: e.to_string(),
    })
}
