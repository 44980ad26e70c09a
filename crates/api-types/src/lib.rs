//! Shared API type definitions
//!
//! This crate contains the device plugin message types exchanged with the kubelet
//! (device specs, mounts, NUMA topology and allocation responses). They mirror the
//! `v1beta1` device plugin API so the catalog built by the scanner can be handed
//! to the RPC layer without conversion.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// Health state of a device that can be allocated.
pub const HEALTHY: &str = "Healthy";

/// A device node exposed to the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    /// Path of the device within the container
    pub container_path: String,
    /// Path of the device on the host
    pub host_path: String,
    /// Cgroup permissions of the device, any combination of `r`, `w` and `m`
    pub permissions: String,
}

impl DeviceSpec {
    /// Device node mapped to the same path inside the container with `rw` access.
    pub fn read_write(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            container_path: path.clone(),
            host_path: path,
            permissions: "rw".to_string(),
        }
    }
}

/// A host path mounted into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub container_path: String,
    pub host_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NumaNode {
    #[serde(rename = "ID")]
    pub id: i64,
}

/// NUMA affinity of a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyInfo {
    pub nodes: Vec<NumaNode>,
}

/// Allocation result for a single container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerAllocateResponse {
    pub envs: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    pub devices: Vec<DeviceSpec>,
    pub annotations: HashMap<String, String>,
}

/// Allocation result for a whole pod, one entry per requesting container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateResponse {
    pub container_responses: Vec<ContainerAllocateResponse>,
}
