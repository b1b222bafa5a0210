use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Parameters handed to the deploy ramdisk through the virtual floppy.
pub type RamdiskParams = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Deploying,
    Cleaning,
    Active,
    #[default]
    Other,
}

impl ProvisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionState::Deploying => "deploying",
            ProvisionState::Cleaning => "cleaning",
            ProvisionState::Active => "active",
            ProvisionState::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "deploying" => ProvisionState::Deploying,
            "cleaning" => ProvisionState::Cleaning,
            "active" => ProvisionState::Active,
            _ => ProvisionState::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootMode {
    #[default]
    Bios,
    Uefi,
}

/// Whether the deployed instance boots from its local disk or over virtual media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootOption {
    Local,
    #[default]
    Netboot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootDevice {
    Cdrom,
    Disk,
}

/// Operator-supplied driver configuration of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverInfo {
    /// Deploy ISO reference: a bare file name on the share, a URL or a catalog id.
    pub deploy_iso: Option<String>,
}

/// Per-deployment instance metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub image_source: Option<String>,
    pub kernel: Option<String>,
    pub ramdisk: Option<String>,
    /// Prebuilt boot ISO; when set no ISO is built.
    pub boot_iso: Option<String>,
    #[serde(default)]
    pub boot_option: BootOption,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub mac_address: String,
    /// Set once the port is attached to the provisioning network.
    pub vif_port_id: Option<String>,
}

/// Durable per-node boot state shared with the provisioning pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeBootContext {
    pub node_id: String,
    pub provision_state: ProvisionState,
    #[serde(default)]
    pub boot_mode: BootMode,
    #[serde(default)]
    pub driver_info: DriverInfo,
    #[serde(default)]
    pub instance_info: InstanceInfo,
    #[serde(default)]
    pub ports: Vec<Port>,
    pub deploy_iso_name: Option<String>,
    pub boot_iso_name: Option<String>,
    pub root_identifier: Option<String>,
    #[serde(default)]
    pub is_whole_disk_image: bool,
}

impl NodeBootContext {
    pub fn new(node_id: impl Into<String>, provision_state: ProvisionState) -> Self {
        Self {
            node_id: node_id.into(),
            provision_state,
            ..Self::default()
        }
    }

    /// MAC of the first port attached to the provisioning network.
    pub fn boot_interface_mac(&self) -> Option<&str> {
        self.ports
            .iter()
            .find(|p| p.vif_port_id.is_some())
            .map(|p| p.mac_address.as_str())
    }

    pub fn boots_from_local_disk(&self) -> bool {
        self.instance_info.boot_option == BootOption::Local || self.is_whole_disk_image
    }
}
