//! Reply payloads and the reply envelope.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::VmId;

/// Lifecycle state of a VM as reported to callers.
///
/// Never stored: it is derived from the service manager on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Creating,
    Starting,
    Running,
    Stopped,
    Killed,
    Deleted,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Killed => "killed",
            Self::Deleted => "deleted",
        };
        f.write_str(word)
    }
}

/// Result of `create-vm`, `start-vm`, `stop-vm` and `delete-vm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmStatus {
    pub status: VmState,
    pub vm_id: VmId,
    /// Informational only, e.g. when a start found the VM already running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl VmStatus {
    #[must_use]
    pub fn new(status: VmState, vm_id: VmId) -> Self {
        Self { status, vm_id, hint: None }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// One entry of the `list-vms` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmListing {
    pub vm_id: VmId,
    pub ip_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Outcome of a command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The body published to a caller's reply destination.
///
/// ```json
/// {"execution-info": {"status": "success"}, "response": {...}}
/// {"execution-info": {"status": "error", "reason": "VM does not exist"}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "execution-info")]
    pub execution_info: ExecutionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl Reply {
    #[must_use]
    pub fn success(response: Value) -> Self {
        Self {
            execution_info: ExecutionInfo { status: ExecutionStatus::Success, reason: None },
            response: Some(response),
        }
    }

    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            execution_info: ExecutionInfo {
                status: ExecutionStatus::Error,
                reason: Some(reason.into()),
            },
            response: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.execution_info.status == ExecutionStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_id() -> VmId {
        match "abcdefgh".parse() {
            Ok(id) => id,
            Err(e) => panic!("invalid test id: {e}"),
        }
    }

    #[test]
    fn vm_status_serializes_with_wire_keys() {
        let status = VmStatus::new(VmState::Starting, vm_id());
        let json = match serde_json::to_value(&status) {
            Ok(v) => v,
            Err(e) => panic!("serialization failed: {e}"),
        };
        assert_eq!(json, serde_json::json!({"status": "starting", "vm-id": "abcdefgh"}));
    }

    #[test]
    fn vm_status_hint_is_included_when_set() {
        let status = VmStatus::new(VmState::Stopped, vm_id()).with_hint("VM was not running");
        let json = match serde_json::to_value(&status) {
            Ok(v) => v,
            Err(e) => panic!("serialization failed: {e}"),
        };
        assert_eq!(json["hint"], "VM was not running");
    }

    #[test]
    fn listing_serializes_ip_addresses() {
        let listing = VmListing {
            vm_id: vm_id(),
            ip_addresses: vec!["10.0.0.5".to_owned()],
            hint: None,
        };
        let json = match serde_json::to_value(&listing) {
            Ok(v) => v,
            Err(e) => panic!("serialization failed: {e}"),
        };
        assert_eq!(json["ip-addresses"][0], "10.0.0.5");
        assert!(json.get("hint").is_none(), "absent hint must not be serialized");
    }

    #[test]
    fn success_reply_format() {
        let reply = Reply::success(serde_json::json!([]));
        let json = match serde_json::to_value(&reply) {
            Ok(v) => v,
            Err(e) => panic!("serialization failed: {e}"),
        };
        assert_eq!(
            json,
            serde_json::json!({"execution-info": {"status": "success"}, "response": []})
        );
    }

    #[test]
    fn error_reply_has_reason_and_no_response() {
        let reply = Reply::error("VM does not exist");
        let json = match serde_json::to_value(&reply) {
            Ok(v) => v,
            Err(e) => panic!("serialization failed: {e}"),
        };
        assert_eq!(json["execution-info"]["status"], "error");
        assert_eq!(json["execution-info"]["reason"], "VM does not exist");
        assert!(json.get("response").is_none());
    }
}
