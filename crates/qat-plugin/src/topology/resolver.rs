use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::fs::MetadataExt;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use api_types::NumaNode;
use api_types::TopologyInfo;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

use super::merge_topology_hints;
use super::Hint;
use super::Hints;
use super::TopologyError;
use super::TopologyResult;

const SYS_DEVICES: &str = "sys/devices";
const SYS_DEVICES_VIRTUAL: &str = "sys/devices/virtual";
const SYS_IOMMU_GROUPS: &str = "sys/kernel/iommu_groups";
const SYS_DEV: &str = "sys/dev";

const CPU_LIST_ATTRIBUTE: &str = "local_cpulist";
const NUMA_NODE_ATTRIBUTE: &str = "numa_node";

/// Resolves topology hints from a sysfs tree mounted below `root`.
///
/// Production code uses `/`, tests point the resolver at a fixture directory.
#[derive(Debug, Clone)]
pub struct TopologyResolver {
    root: PathBuf,
}

impl Default for TopologyResolver {
    fn default() -> Self {
        Self::new("/")
    }
}

impl TopologyResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns hints for the device at `dev_path` and for the devices it
    /// depends on (RAID members, devices of a VFIO IOMMU group).
    pub fn topology_hints(&self, dev_path: &Path) -> TopologyResult<Hints> {
        let real_path = fs::canonicalize(dev_path).change_context(TopologyError::RealPath {
            path: dev_path.display().to_string(),
        })?;

        let devices_root = self.root.join(SYS_DEVICES);
        let mut hints = Hints::new();

        let device_dirs = real_path
            .ancestors()
            .take_while(|dir| *dir != devices_root && dir.starts_with(&devices_root));
        for dir in device_dirs {
            let hint = self.hint_for(dir)?;
            if !hint.is_empty() {
                hints.insert(hint.provider.clone(), hint);
                break;
            }
        }

        let from_virtual = self.devices_from_virtual(&real_path).unwrap_or_default();
        let slaves = slave_devices(&real_path);

        for device in slaves.into_iter().chain(from_virtual) {
            let device_hints = self.topology_hints(&device)?;
            hints = merge_topology_hints(hints, device_hints);
        }

        Ok(hints)
    }

    /// Reads the hint provided by a single sysfs directory.
    fn hint_for(&self, dir: &Path) -> TopologyResult<Hint> {
        let mut hint = Hint::new(dir.display().to_string());
        hint.cpus = read_attribute(dir, CPU_LIST_ATTRIBUTE)?.unwrap_or_default();
        hint.numas = read_attribute(dir, NUMA_NODE_ATTRIBUTE)?.unwrap_or_default();

        // -1 means the device or the system is not NUMA aware, not node 0
        if hint.numas == "-1" {
            hint.numas.clear();
        }

        if !hint.numas.is_empty() && hint.cpus.is_empty() {
            // Firmware reported a socket id as NUMA node, look at the parent
            // device or bus for a CPU list first.
            if let Some(parent_hints) = dir
                .parent()
                .and_then(|parent| self.topology_hints(parent).ok())
            {
                let cpus = join_unique(parent_hints.values().map(|h| h.cpus.as_str()));
                if !cpus.is_empty() {
                    hint.cpus = cpus;
                }

                let numas = join_unique(parent_hints.values().map(|h| h.numas.as_str()));
                if !numas.is_empty() {
                    hint.numas = numas;
                }
            }

            if hint.cpus.is_empty() && !hint.numas.is_empty() {
                hint.sockets = std::mem::take(&mut hint.numas);
            }
        }

        Ok(hint)
    }

    /// Returns the real paths of the devices behind a virtual VFIO device.
    fn devices_from_virtual(&self, real_path: &Path) -> TopologyResult<Vec<PathBuf>> {
        let relative = real_path
            .strip_prefix(self.root.join(SYS_DEVICES_VIRTUAL))
            .map_err(|_| {
                Report::new(TopologyError::NotVirtual {
                    path: real_path.display().to_string(),
                })
            })?;

        let mut components = relative.components();
        let group = match (components.next(), components.next(), components.next()) {
            (Some(Component::Normal(class)), Some(Component::Normal(group)), None)
                if class == "vfio" =>
            {
                group
            }
            _ => return Ok(Vec::new()),
        };

        let group_dir = self.root.join(SYS_IOMMU_GROUPS).join(group).join("devices");
        let group_error = || TopologyError::IommuGroup {
            path: group_dir.display().to_string(),
        };

        let mut members = fs::read_dir(&group_dir)
            .change_context_lazy(group_error)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<io::Result<Vec<_>>>()
            .change_context_lazy(group_error)?;
        members.sort();

        members
            .into_iter()
            .map(|member| {
                fs::canonicalize(&member).change_context(TopologyError::RealPath {
                    path: member.display().to_string(),
                })
            })
            .collect()
    }

    /// Maps a device node, or any file, to the sysfs directory of the device
    /// backing it. Returns `None` when `dev` doesn't exist.
    pub fn find_sysfs_device(&self, dev: &Path) -> TopologyResult<Option<PathBuf>> {
        let metadata = match fs::metadata(dev) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Report::new(e).change_context(TopologyError::Stat {
                    path: dev.display().to_string(),
                }))
            }
        };

        let file_type = metadata.file_type();
        let (class, rdev) = if file_type.is_char_device() {
            ("char", metadata.rdev())
        } else if file_type.is_block_device() {
            ("block", metadata.rdev())
        } else {
            // regular files resolve to the storage device they reside on
            ("block", metadata.dev())
        };

        let major = libc::major(rdev);
        let minor = libc::minor(rdev);
        if major == 0 {
            return Err(Report::new(TopologyError::VirtualDeviceNode {
                path: dev.display().to_string(),
            }));
        }

        let dev_path = self
            .root
            .join(SYS_DEV)
            .join(class)
            .join(format!("{major}:{minor}"));
        let real_path = fs::canonicalize(&dev_path).change_context(TopologyError::RealPath {
            path: dev_path.display().to_string(),
        })?;

        Ok(Some(real_path))
    }

    /// Collects the NUMA nodes of all given device nodes.
    pub fn topology_info<P: AsRef<Path>>(&self, devs: &[P]) -> TopologyResult<TopologyInfo> {
        let mut node_ids = BTreeSet::new();

        for dev in devs {
            let dev = dev.as_ref();
            let sysfs_device = self.find_sysfs_device(dev)?.ok_or_else(|| {
                Report::new(TopologyError::MissingDevice {
                    path: dev.display().to_string(),
                })
            })?;

            let hints = self.topology_hints(&sysfs_device)?;
            for hint in hints.values() {
                debug!("{} for {}", hint, dev.display());
                node_ids.extend(parse_numa_nodes(&hint.numas)?);
            }
        }

        Ok(TopologyInfo {
            nodes: node_ids.into_iter().map(|id| NumaNode { id }).collect(),
        })
    }
}

fn parse_numa_nodes(numas: &str) -> TopologyResult<Vec<i64>> {
    numas
        .split(',')
        .map(str::trim)
        .filter(|node| !node.is_empty())
        .map(|node| -> TopologyResult<i64> {
            let invalid = || TopologyError::InvalidNumaNode {
                value: node.to_string(),
            };
            let id = node.parse::<i64>().change_context_lazy(invalid)?;
            if id < 0 {
                return Err(Report::new(invalid()).attach_printable("NUMA node is negative"));
            }
            Ok(id)
        })
        .collect()
}

/// Devices this one is composed of, e.g. the members of a software RAID.
fn slave_devices(real_path: &Path) -> Vec<PathBuf> {
    let pattern = real_path.join("slaves").join("*");
    let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
        return Vec::new();
    };
    paths.filter_map(Result::ok).collect()
}

/// Reads a sysfs attribute, `None` if the attribute doesn't exist.
fn read_attribute(dir: &Path, name: &str) -> TopologyResult<Option<String>> {
    let path = dir.join(name);
    match fs::read_to_string(&path) {
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Report::new(e).change_context(TopologyError::ReadAttribute {
            path: path.display().to_string(),
        })),
    }
}

fn join_unique<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values
        .filter(|value| !value.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(",")
}
