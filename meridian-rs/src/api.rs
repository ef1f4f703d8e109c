//! Wire types of the per-VM sandbox control socket.
//!
//! The host agent (`meridian-vm`) serves these routes over a unix-domain
//! HTTP socket in the machine directory; the daemon is the only client.

use serde::{Deserialize, Serialize};

use crate::spec::{PortForward, VmType};

/// vsock port the in-guest agent listens on.
pub const GUEST_AGENT_VSOCK_PORT: u32 = 10443;

/// Upper bound on error response bodies read back from a sandbox.
pub const MAX_ERROR_BODY: usize = 64 * 1024;

pub mod routes {
    pub const HEALTHZ: &str = "/healthz";
    pub const FORWARD: &str = "/api/v1/forward/{name}";
    pub const VM_STOP: &str = "/api/v1/vm/stop/{name}";
    pub const GUEST_HEALTH: &str = "/api/v1/guest/health";

    pub fn forward(name: &str) -> String {
        format!("/api/v1/forward/{name}")
    }

    pub fn vm_stop(name: &str) -> String {
        format!("/api/v1/vm/stop/{name}")
    }
}

/// Body of `POST` / `DELETE` on the forward route.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    pub forwards: Vec<PortForward>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub name: String,
    pub pid: u32,
    pub vm_type: VmType,
    /// Rules of the forwards currently live in the host agent.
    #[serde(default)]
    pub forwards: Vec<String>,
}

/// Result of probing the in-guest agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GuestHealth {
    pub healthy: bool,
    #[serde(default)]
    pub detail: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        ErrorBody {
            error: error.into(),
        }
    }
}
