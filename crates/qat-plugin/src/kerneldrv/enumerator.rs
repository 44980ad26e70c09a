use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use error_stack::Report;
use error_stack::ResultExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use tracing::warn;

use super::PluginError;
use super::PluginResult;

/// One line of `adf_ctl status` describing a device.
static ADF_CTL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"type: (?P<devtype>[[:alnum:]]+), .* inst_id: (?P<instid>[0-9]+), .* bsf: (?P<domain>[0-9a-f]{4}:)?(?P<bsf>[0-9a-f]{2}:[0-9a-f]{2}\.[0-9a-f]), .* state: (?P<state>[[:alpha:]]+)$",
    )
    .expect("invalid adf_ctl status regex")
});

/// Device types carrying this suffix are virtual functions.
const VF_SUFFIX: &str = "vf";

/// Device types never offered to workloads.
const DEVICES_DENY_LIST: &[&str] = &[];

const SYS_CLASS_IOMMU: &str = "sys/class/iommu";

/// An accelerator reported as up by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// `dev` followed by the driver instance id
    pub id: String,
    pub devtype: String,
    /// PCI address, with the domain when the driver reports one
    pub bsf: String,
}

/// Source of the driver status report.
pub trait StatusSource: Send + Sync {
    fn status(&self) -> PluginResult<String>;
}

/// Runs `adf_ctl status` and captures its combined output.
#[derive(Debug, Clone)]
pub struct AdfCtl {
    program: PathBuf,
}

impl AdfCtl {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for AdfCtl {
    fn default() -> Self {
        Self::new("adf_ctl")
    }
}

impl StatusSource for AdfCtl {
    fn status(&self) -> PluginResult<String> {
        let output = Command::new(&self.program)
            .arg("status")
            .output()
            .change_context(PluginError::DriverStatus)
            .attach_printable_lazy(|| format!("command: {} status", self.program.display()))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(Report::new(PluginError::DriverStatus)
                .attach_printable(format!("{} exited with {}", self.program.display(), output.status))
                .attach_printable(combined));
        }

        Ok(combined)
    }
}

struct StatusRecord<'a> {
    devtype: &'a str,
    inst_id: &'a str,
    bsf: String,
    state: &'a str,
}

impl StatusRecord<'_> {
    fn is_vf(&self) -> bool {
        self.devtype.ends_with(VF_SUFFIX)
    }
}

fn parse_status(output: &str) -> Vec<StatusRecord<'_>> {
    output
        .lines()
        .filter_map(|line| ADF_CTL_REGEX.captures(line))
        .filter_map(|caps| {
            Some(StatusRecord {
                devtype: caps.name("devtype")?.as_str(),
                inst_id: caps.name("instid")?.as_str(),
                bsf: format!(
                    "{}{}",
                    caps.name("domain").map_or("", |m| m.as_str()),
                    caps.name("bsf")?.as_str()
                ),
                state: caps.name("state")?.as_str(),
            })
        })
        .collect()
}

/// Extracts the devices which are up from `adf_ctl status` output.
///
/// Physical functions are dropped when the IOMMU is on, or when any virtual
/// function shows up in the report.
pub fn online_devices(output: &str, iommu_on: bool) -> Vec<Device> {
    let records = parse_status(output);
    let vf_on = records.iter().any(StatusRecord::is_vf);

    records
        .into_iter()
        .filter(|record| record.state == "up")
        .filter(|record| {
            let denied = DEVICES_DENY_LIST.contains(&record.devtype);
            if denied {
                warn!("skip denylisted device {}", record.devtype);
            }
            !denied
        })
        // PFs can't be used with IOMMU enabled
        .filter(|record| !iommu_on || record.is_vf())
        .filter(|record| !vf_on || record.is_vf())
        .map(|record| {
            let device = Device {
                id: format!("dev{}", record.inst_id),
                devtype: record.devtype.to_string(),
                bsf: record.bsf,
            };
            debug!("new online device {:?}", device);
            device
        })
        .collect()
}

/// IOMMU is active when the kernel registered at least one IOMMU.
pub fn iommu_status(root: &Path) -> PluginResult<bool> {
    let dir = root.join(SYS_CLASS_IOMMU);
    let mut iommus = fs::read_dir(&dir)
        .change_context(PluginError::IommuStatus)
        .attach_printable_lazy(|| format!("path: {}", dir.display()))?;

    Ok(iommus.next().is_some())
}
