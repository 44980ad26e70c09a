use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use api_types::DeviceSpec;
use api_types::HEALTHY;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::warn;

use super::Device;
use super::DriverConfig;
use super::PluginError;
use super::PluginResult;
use crate::deviceplugin::resolve_topology;
use crate::deviceplugin::DeviceInfo;
use crate::deviceplugin::DeviceTree;
use crate::topology::TopologyResolver;

/// Driver control nodes every workload needs regardless of its device.
const GLOBAL_DEVICE_NODES: [&str; 3] = ["/dev/qat_adf_ctl", "/dev/qat_dev_processes", "/dev/usdm_drv"];

/// Name of the environment variable carrying the section of a unit.
pub const SECTION_NAME_ENV: &str = "QAT_SECTION_NAME";

/// Directory listing the UIO devices of the device at `bsf`.
fn uio_device_list_path(root: &Path, bsf: &str) -> PluginResult<PathBuf> {
    let mut fields = bsf.split(':');
    let (Some(bus0), Some(bus1)) = (fields.next(), fields.next()) else {
        return Err(Report::new(PluginError::MalformedBusAddress {
            bsf: bsf.to_string(),
        }));
    };

    Ok(root
        .join("sys/devices")
        .join(format!("pci{bus0}:{bus1}"))
        .join(bsf)
        .join("uio"))
}

/// Names of the UIO devices the kernel created for `device`.
fn uio_devices(root: &Path, device: &Device) -> PluginResult<Vec<String>> {
    let dir = uio_device_list_path(root, &device.bsf)?;
    debug!("path to uio devices of {} ({}): {}", device.id, device.devtype, dir.display());

    let auxiliary_error = || PluginError::AuxiliaryDevices {
        path: dir.display().to_string(),
    };
    let mut names = Vec::new();
    for entry in fs::read_dir(&dir).change_context_lazy(auxiliary_error)? {
        let entry = entry.change_context_lazy(auxiliary_error)?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }

    if names.is_empty() {
        warn!("no uio devices listed in {}", dir.display());
    }
    names.sort();

    Ok(names)
}

/// Builds the catalog of allocatable units.
///
/// Every process slot of a section becomes one unit carrying all device
/// nodes of all online devices. Units are named `{section}_{n}` with `n`
/// counting over the whole tree, so the secondary section variable stamped at
/// allocation time is unique within a cycle.
pub fn build_device_tree(
    resolver: &TopologyResolver,
    devices: &[Device],
    config: &DriverConfig,
) -> PluginResult<DeviceTree> {
    let mut tree = DeviceTree::new();

    let mut nodes: Vec<DeviceSpec> = GLOBAL_DEVICE_NODES
        .iter()
        .copied()
        .map(DeviceSpec::read_write)
        .collect();
    for device in devices {
        for uio in uio_devices(resolver.root(), device)? {
            nodes.push(DeviceSpec::read_write(format!("/dev/{uio}")));
        }
    }

    // all units share the same nodes and thus the same topology
    let topology = resolve_topology(resolver, &nodes);

    let mut unit_counter = 0usize;
    for section in config.sections() {
        let dev_type = section.device_type();

        for endpoint in section.allocatable_endpoints() {
            for _ in 0..endpoint.processes {
                let envs = BTreeMap::from([
                    (
                        format!("{SECTION_NAME_ENV}_{dev_type}_{unit_counter}"),
                        section.name.clone(),
                    ),
                    (SECTION_NAME_ENV.to_string(), section.name.clone()),
                ]);
                let info = DeviceInfo::new(
                    HEALTHY,
                    nodes.clone(),
                    Vec::new(),
                    envs,
                    BTreeMap::new(),
                    topology.clone(),
                );

                unit_counter += 1;
                tree.add_device(&dev_type, &format!("{}_{unit_counter}", section.name), info);
            }
        }
    }

    Ok(tree)
}
