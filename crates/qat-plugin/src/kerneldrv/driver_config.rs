use core::error::Error;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use ini::Ini;
use ini::Properties;
use tracing::debug;

use super::Device;

pub type ConfigResult<T> = Result<T, Report<ConfigError>>;

/// Sections of a device configuration that don't describe a workload pool.
const RESERVED_SECTIONS: &[&str] = &["GENERAL", "SIOV", "KERNEL", "KERNEL_QAT", "DEFAULT"];

const NUM_PROCESSES_KEY: &str = "NumProcesses";
const NUM_CY_INSTANCES_KEY: &str = "NumberCyInstances";
const NUM_DC_INSTANCES_KEY: &str = "NumberDcInstances";
const LIMIT_DEV_ACCESS_KEY: &str = "LimitDevAccess";

/// Errors found while reading or reconciling device configuration.
#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("failed to parse device config {path}")]
    Load { path: String },
    #[display("missing {key} in [{section}]")]
    MissingKey { section: String, key: &'static str },
    #[display("can't parse {key} in [{section}]")]
    InvalidKey { section: String, key: &'static str },
    #[display("value of LimitDevAccess must be consistent across all devices in [{section}]")]
    InconsistentPinning { section: String },
    #[display("for not pinned section [{section}] NumProcesses must be equal for all devices")]
    InconsistentProcesses { section: String },
    #[display(
        "NumberCyInstances and NumberDcInstances must be consistent across all devices in [{section}]"
    )]
    InconsistentEngines { section: String },
    #[display("section [{section}] must be defined for all devices since it contains LimitDevAccess=1")]
    IncompletePinnedSection { section: String },
}

impl Error for ConfigError {}

/// A device's share of a workload section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub device_id: String,
    /// worker processes the device dedicates to the section
    pub processes: u32,
}

/// A workload pool defined across one or more devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub endpoints: Vec<Endpoint>,
    pub crypto_engines: u32,
    pub compression_engines: u32,
    /// `LimitDevAccess`: every process is bound to its own device
    pub pinned: bool,
}

impl Section {
    /// Resource type advertised for units of this section.
    pub fn device_type(&self) -> String {
        format!("cy{}_dc{}", self.crypto_engines, self.compression_engines)
    }

    /// Endpoints that get their own units. Endpoints of a section that isn't
    /// pinned are interchangeable, so only the first one counts.
    pub fn allocatable_endpoints(&self) -> &[Endpoint] {
        if self.pinned {
            &self.endpoints
        } else {
            &self.endpoints[..self.endpoints.len().min(1)]
        }
    }
}

/// Values of a section as defined in one device's configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SectionDefinition {
    processes: u32,
    crypto_engines: u32,
    compression_engines: u32,
    pinned: bool,
}

impl SectionDefinition {
    fn from_properties(section: &str, properties: &Properties) -> ConfigResult<Self> {
        let pinned = optional_flag(section, properties, LIMIT_DEV_ACCESS_KEY)?.unwrap_or(false);

        Ok(Self {
            processes: required_count(section, properties, NUM_PROCESSES_KEY)?,
            crypto_engines: required_count(section, properties, NUM_CY_INSTANCES_KEY)?,
            compression_engines: required_count(section, properties, NUM_DC_INSTANCES_KEY)?,
            pinned,
        })
    }
}

/// Workload sections reconciled over all online devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverConfig {
    sections: BTreeMap<String, Section>,
}

impl DriverConfig {
    pub fn get(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Sections ordered by name, so identical configuration yields
    /// identical catalogs from one scan to the next.
    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.values()
    }

    fn update(
        &mut self,
        device_id: &str,
        name: &str,
        definition: SectionDefinition,
    ) -> ConfigResult<()> {
        let endpoint = Endpoint {
            device_id: device_id.to_string(),
            processes: definition.processes,
        };

        let section = match self.sections.entry(name.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(Section {
                    name: name.to_string(),
                    endpoints: vec![endpoint],
                    crypto_engines: definition.crypto_engines,
                    compression_engines: definition.compression_engines,
                    pinned: definition.pinned,
                });
                return Ok(());
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };

        if section.pinned != definition.pinned {
            return Err(Report::new(ConfigError::InconsistentPinning {
                section: name.to_string(),
            }));
        }

        let first_processes = section.endpoints.first().map(|e| e.processes);
        if !definition.pinned && first_processes != Some(definition.processes) {
            return Err(Report::new(ConfigError::InconsistentProcesses {
                section: name.to_string(),
            })
            .attach_printable(format!(
                "device {device_id} has {} processes",
                definition.processes
            )));
        }

        if section.crypto_engines != definition.crypto_engines
            || section.compression_engines != definition.compression_engines
        {
            return Err(Report::new(ConfigError::InconsistentEngines {
                section: name.to_string(),
            }));
        }

        section.endpoints.push(endpoint);
        Ok(())
    }

    /// Pinned sections must be present on every device.
    fn check_pinned_coverage(&self, device_count: usize) -> ConfigResult<()> {
        match self
            .sections()
            .find(|section| section.pinned && section.endpoints.len() != device_count)
        {
            Some(section) => Err(Report::new(ConfigError::IncompletePinnedSection {
                section: section.name.clone(),
            })
            .attach_printable(format!(
                "defined for {} of {device_count} devices",
                section.endpoints.len()
            ))),
            None => Ok(()),
        }
    }
}

/// Path of the configuration file of `device` within `config_dir`.
pub fn config_path(config_dir: &Path, device: &Device) -> PathBuf {
    config_dir.join(format!("{}_{}.conf", device.devtype, device.id))
}

/// Loads the configuration of every device and reconciles the workload
/// sections they define.
pub fn parse_configs(config_dir: &Path, devices: &[Device]) -> ConfigResult<DriverConfig> {
    let mut config = DriverConfig::default();

    for device in devices {
        let path = config_path(config_dir, device);
        let ini = Ini::load_from_file(&path).change_context(ConfigError::Load {
            path: path.display().to_string(),
        })?;

        for (name, properties) in ini.iter() {
            let Some(name) = name.filter(|name| !RESERVED_SECTIONS.contains(name)) else {
                continue;
            };
            debug!("device {} defines section [{}]", device.id, name);

            let definition = SectionDefinition::from_properties(name, properties)?;
            config.update(&device.id, name, definition)?;
        }
    }

    config.check_pinned_coverage(devices.len())?;

    Ok(config)
}

fn required_count(section: &str, properties: &Properties, key: &'static str) -> ConfigResult<u32> {
    let value = properties.get(key).ok_or_else(|| {
        Report::new(ConfigError::MissingKey {
            section: section.to_string(),
            key,
        })
    })?;

    value
        .trim()
        .parse::<u32>()
        .change_context_lazy(|| ConfigError::InvalidKey {
            section: section.to_string(),
            key,
        })
        .attach_printable_lazy(|| format!("value: {value:?}"))
}

/// `None` when the key is absent, an invalid value is an error.
fn optional_flag(
    section: &str,
    properties: &Properties,
    key: &'static str,
) -> ConfigResult<Option<bool>> {
    let Some(value) = properties.get(key) else {
        return Ok(None);
    };

    match parse_bool(value.trim()) {
        Some(flag) => Ok(Some(flag)),
        None => Err(Report::new(ConfigError::InvalidKey {
            section: section.to_string(),
            key,
        })
        .attach_printable(format!("value: {value:?}"))),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "y" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "n" | "no" | "off" => Some(false),
        _ => None,
    }
}
