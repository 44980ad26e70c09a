use std::collections::BTreeMap;
use std::path::Path;

use api_types::DeviceSpec;
use api_types::Mount;
use api_types::TopologyInfo;
use serde::Serialize;
use tracing::warn;

use crate::topology::TopologyResolver;

/// A single allocatable device unit maintained by the device plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    state: String,
    nodes: Vec<DeviceSpec>,
    mounts: Vec<Mount>,
    envs: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    topology: Option<TopologyInfo>,
}

impl DeviceInfo {
    /// Creates a device unit. `topology` is usually the result of
    /// [`resolve_topology`] over `nodes`.
    pub fn new(
        state: &str,
        nodes: Vec<DeviceSpec>,
        mounts: Vec<Mount>,
        envs: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
        topology: Option<TopologyInfo>,
    ) -> Self {
        Self {
            state: state.to_string(),
            nodes,
            mounts,
            envs,
            annotations,
            topology,
        }
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn nodes(&self) -> &[DeviceSpec] {
        &self.nodes
    }

    pub fn envs(&self) -> &BTreeMap<String, String> {
        &self.envs
    }

    pub fn topology(&self) -> Option<&TopologyInfo> {
        self.topology.as_ref()
    }
}

/// Resolves the NUMA topology shared by a set of device nodes.
pub fn resolve_topology(resolver: &TopologyResolver, nodes: &[DeviceSpec]) -> Option<TopologyInfo> {
    let paths: Vec<&Path> = nodes.iter().map(|node| Path::new(&node.host_path)).collect();

    match resolver.topology_info(&paths) {
        Ok(topology) => Some(topology),
        Err(e) => {
            warn!("unable to get topology info: {e:?}");
            None
        }
    }
}

/// Device units by device type and unit id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DeviceTree(BTreeMap<String, BTreeMap<String, DeviceInfo>>);

impl DeviceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a unit, replacing any unit with the same type and id.
    pub fn add_device(&mut self, dev_type: &str, id: &str, info: DeviceInfo) {
        self.0
            .entry(dev_type.to_string())
            .or_default()
            .insert(id.to_string(), info);
    }

    pub fn device_type_count(&self, dev_type: &str) -> usize {
        self.0.get(dev_type).map_or(0, BTreeMap::len)
    }

    /// Total number of units over all device types.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device_types(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn devices(&self, dev_type: &str) -> Option<&BTreeMap<String, DeviceInfo>> {
        self.0.get(dev_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &DeviceInfo)> {
        self.0.iter().flat_map(|(dev_type, devices)| {
            devices
                .iter()
                .map(move |(id, info)| (dev_type.as_str(), id.as_str(), info))
        })
    }
}
