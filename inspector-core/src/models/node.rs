use serde::{Deserialize, Serialize};

/// Node record as returned by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub uuid: String,
    #[serde(default)]
    pub provision_state: Option<String>,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default)]
    pub driver_info: serde_json::Map<String, serde_json::Value>,
}

impl Node {
    /// Non-empty string value from `driver_info`.
    pub fn driver_info_str(&self, key: &str) -> Option<&str> {
        self.driver_info
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub uuid: String,
    pub address: String,
    #[serde(default)]
    pub node_uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceValidation {
    #[serde(default)]
    pub result: Option<bool>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl InterfaceValidation {
    pub fn passed(&self) -> bool {
        self.result.unwrap_or(false)
    }
}

/// Subset of the node validation response that introspection cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeValidation {
    pub power: InterfaceValidation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    Pxe,
    Disk,
}

impl BootDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootDevice::Pxe => "pxe",
            BootDevice::Disk => "disk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    Reboot,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::On => "power on",
            PowerState::Off => "power off",
            PowerState::Reboot => "reboot",
        }
    }
}

/// New management controller credentials requested for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpmiCredentials {
    pub username: String,
    pub password: String,
}
