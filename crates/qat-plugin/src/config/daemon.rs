use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use clap::Parser;

use crate::kerneldrv::AdfCtl;
use crate::kerneldrv::DevicePlugin;

/// Flags shared by every command that scans devices.
#[derive(Args, Debug, Clone)]
pub struct DiscoveryArgs {
    #[arg(
        long,
        env = "QAT_CONFIG_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/etc",
        help = "Directory holding the per-device driver configuration, e.g. /etc/c6xx_dev0.conf"
    )]
    pub config_dir: PathBuf,

    #[arg(
        long,
        env = "QAT_SYSFS_ROOT",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/",
        help = "Root directory under which sys/ is looked up"
    )]
    pub sysfs_root: PathBuf,

    #[arg(
        long,
        env = "QAT_ADF_CTL",
        value_hint = clap::ValueHint::CommandName,
        default_value = "adf_ctl",
        help = "adf_ctl executable used to query the driver status"
    )]
    pub adf_ctl: PathBuf,
}

impl DiscoveryArgs {
    pub fn device_plugin(&self, scan_interval: Duration) -> DevicePlugin<AdfCtl> {
        DevicePlugin::new(
            AdfCtl::new(&self.adf_ctl),
            &self.config_dir,
            &self.sysfs_root,
            scan_interval,
        )
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub discovery: DiscoveryArgs,

    #[arg(
        long,
        env = "QAT_SCAN_INTERVAL_SECS",
        default_value = "5",
        help = "Seconds to sleep between two device scans"
    )]
    pub scan_interval_secs: u64,

    #[arg(
        long,
        env = "QAT_RESOURCE_NAMESPACE",
        default_value = "qat.intel.com",
        help = "Namespace prefixed to the advertised resource names"
    )]
    pub resource_namespace: String,
}

impl DaemonArgs {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ScanArgs {
    #[command(flatten)]
    pub discovery: DiscoveryArgs,
}
