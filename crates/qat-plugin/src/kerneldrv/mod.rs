//! QAT device plugin backed by the kernel driver.
//!
//! Each scan cycle enumerates the devices `adf_ctl` reports as up, reconciles
//! the per-device driver configuration into workload sections and publishes a
//! catalog with one unit per configured worker process.

mod dev_tree;
mod driver_config;
mod enumerator;

use core::error::Error;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use api_types::AllocateResponse;
use error_stack::Report;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

pub use dev_tree::build_device_tree;
pub use dev_tree::SECTION_NAME_ENV;
pub use driver_config::config_path;
pub use driver_config::parse_configs;
pub use driver_config::ConfigError;
pub use driver_config::DriverConfig;
pub use driver_config::Endpoint;
pub use driver_config::Section;
pub use enumerator::iommu_status;
pub use enumerator::online_devices;
pub use enumerator::AdfCtl;
pub use enumerator::Device;
pub use enumerator::StatusSource;

use crate::deviceplugin::DeviceTree;
use crate::deviceplugin::Notifier;
use crate::deviceplugin::PostAllocator;
use crate::deviceplugin::Scanner;
use crate::topology::TopologyResolver;

pub type PluginResult<T> = Result<T, Report<PluginError>>;

/// Errors that abort a scan cycle or an allocation.
#[derive(Debug, derive_more::Display)]
pub enum PluginError {
    #[display("can't get driver status")]
    DriverStatus,
    #[display("unable to read IOMMU status")]
    IommuStatus,
    #[display("failed to reconcile device configuration")]
    Config,
    #[display("can't read {path}")]
    AuxiliaryDevices { path: String },
    #[display("malformed bus address {bsf}")]
    MalformedBusAddress { bsf: String },
    #[display("wrong format of env variable name {key}")]
    MalformedEnvKey { key: String },
}

impl Error for PluginError {}

/// Steps of a scan cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ScanPhase {
    Idle,
    Enumerating,
    Reconciling,
    BuildingCatalog,
    Publishing,
    Sleeping,
}

/// Kernel driver based QAT device plugin.
#[derive(Debug)]
pub struct DevicePlugin<S> {
    status_source: S,
    config_dir: PathBuf,
    topology: TopologyResolver,
    scan_interval: Duration,
}

impl<S: StatusSource> DevicePlugin<S> {
    /// `sysfs_root` is the directory holding `sys/`, `/` outside of tests.
    pub fn new(
        status_source: S,
        config_dir: impl Into<PathBuf>,
        sysfs_root: impl Into<PathBuf>,
        scan_interval: Duration,
    ) -> Self {
        Self {
            status_source,
            config_dir: config_dir.into(),
            topology: TopologyResolver::new(sysfs_root),
            scan_interval,
        }
    }

    /// Runs enumeration, reconciliation and catalog building once.
    #[tracing::instrument(skip(self))]
    pub fn scan_once(&self) -> PluginResult<DeviceTree> {
        debug!(phase = %ScanPhase::Enumerating);
        let iommu_on = iommu_status(self.topology.root())?;
        let status = self.status_source.status()?;
        let devices = online_devices(&status, iommu_on);

        debug!(phase = %ScanPhase::Reconciling, devices = devices.len(), iommu_on);
        let config =
            parse_configs(&self.config_dir, &devices).change_context(PluginError::Config)?;

        debug!(phase = %ScanPhase::BuildingCatalog, sections = config.len());
        build_device_tree(&self.topology, &devices, &config)
    }
}

impl<S: StatusSource> Scanner for DevicePlugin<S> {
    type Error = PluginError;

    /// Publishes a fresh catalog every scan interval. Any cycle failure ends
    /// the loop, restarting is up to the caller.
    async fn scan(
        &self,
        notifier: &dyn Notifier,
        cancellation_token: CancellationToken,
    ) -> PluginResult<()> {
        loop {
            debug!(phase = %ScanPhase::Idle);
            let tree = self.scan_once()?;

            debug!(phase = %ScanPhase::Publishing, units = tree.len());
            notifier.notify(tree);

            debug!(phase = %ScanPhase::Sleeping);
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("device scan shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.scan_interval) => {}
            }
        }
    }
}

impl<S> PostAllocator for DevicePlugin<S> {
    type Error = PluginError;

    /// Renumbers the section variables each container received so that they
    /// form a compact `0..n` sequence per container. The response is left
    /// untouched when any container carries a malformed variable.
    fn post_allocate(&self, response: &mut AllocateResponse) -> PluginResult<()> {
        let renames = response
            .container_responses
            .iter()
            .map(|container_response| section_env_renames(&container_response.envs))
            .collect::<PluginResult<Vec<_>>>()?;

        for (container_response, renames) in response.container_responses.iter_mut().zip(renames) {
            let envs = &mut container_response.envs;
            let moved: Vec<_> = renames
                .into_iter()
                .filter_map(|(old, new)| envs.remove(&old).map(|value| (new, value)))
                .collect();
            envs.extend(moved);
        }
        Ok(())
    }
}

/// Maps every `QAT_SECTION_NAME_<cy>_<dc>_<n>` variable to its name numbered
/// from zero. The new order is unspecified.
fn section_env_renames(envs: &HashMap<String, String>) -> PluginResult<Vec<(String, String)>> {
    let prefix = format!("{SECTION_NAME_ENV}_");
    let mut renames = Vec::new();

    for key in envs.keys().filter(|key| key.starts_with(&prefix)) {
        let parts: Vec<&str> = key.split('_').collect();
        if parts.len() != 6 {
            return Err(Report::new(PluginError::MalformedEnvKey { key: key.clone() }));
        }
        let counter = renames.len();
        renames.push((key.clone(), format!("{}_{counter}", parts[..5].join("_"))));
    }

    Ok(renames)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    use api_types::ContainerAllocateResponse;
    use similar_asserts::assert_eq;
    use tempfile::TempDir;
    use test_log::test;

    use super::*;

    const STATUS: &str = "\
 qat_dev0 - type: c6xx,  inst_id: 0,  node_id: 0,  bsf: 0000:3d:00.0,  #accel: 5 #engines: 10 state: up
";

    struct FixedStatus(PluginResult<String>);

    impl StatusSource for FixedStatus {
        fn status(&self) -> PluginResult<String> {
            match &self.0 {
                Ok(output) => Ok(output.clone()),
                Err(_) => Err(Report::new(PluginError::DriverStatus)),
            }
        }
    }

    /// Records published trees and cancels the scan after `limit` of them.
    struct CancellingNotifier {
        trees: Mutex<Vec<DeviceTree>>,
        limit: usize,
        token: CancellationToken,
    }

    impl Notifier for CancellingNotifier {
        fn notify(&self, tree: DeviceTree) {
            let mut trees = self.trees.lock().expect("poisoned");
            trees.push(tree);
            if trees.len() >= self.limit {
                self.token.cancel();
            }
        }
    }

    struct Fixture {
        sysfs: TempDir,
        conf: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let sysfs = TempDir::new().expect("should create sysfs dir");
            let conf = TempDir::new().expect("should create config dir");
            fs::create_dir_all(sysfs.path().join("sys/class/iommu"))
                .expect("should create iommu dir");
            fs::create_dir_all(sysfs.path().join("sys/devices/pci0000:3d/0000:3d:00.0/uio/uio0"))
                .expect("should create uio dir");
            write(
                conf.path(),
                "c6xx_dev0.conf",
                "[GENERAL]\nServicesEnabled = dc\n[dc]\nNumProcesses = 2\nNumberCyInstances = 0\nNumberDcInstances = 1\n",
            );
            Self { sysfs, conf }
        }

        fn plugin(&self, status: PluginResult<String>) -> DevicePlugin<FixedStatus> {
            DevicePlugin::new(
                FixedStatus(status),
                self.conf.path(),
                self.sysfs.path(),
                Duration::from_millis(10),
            )
        }
    }

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).expect("should write file");
    }

    fn plugin() -> DevicePlugin<AdfCtl> {
        DevicePlugin::new(AdfCtl::default(), "/etc", "/", Duration::from_secs(5))
    }

    #[test]
    fn scan_once_builds_catalog() {
        let fixture = Fixture::new();

        let tree = fixture
            .plugin(Ok(STATUS.to_string()))
            .scan_once()
            .expect("should scan");

        assert_eq!(tree.device_types().collect::<Vec<_>>(), vec!["cy0_dc1"]);
        assert_eq!(tree.device_type_count("cy0_dc1"), 2);
    }

    #[test]
    fn scan_once_reports_driver_failure() {
        let fixture = Fixture::new();

        let err = fixture
            .plugin(Err(Report::new(PluginError::DriverStatus)))
            .scan_once()
            .expect_err("should fail");

        assert!(matches!(err.current_context(), PluginError::DriverStatus));
    }

    #[test]
    fn scan_once_reports_config_failure() {
        let fixture = Fixture::new();
        write(fixture.conf.path(), "c6xx_dev0.conf", "[dc]\nNumProcesses = 2\n");

        let err = fixture
            .plugin(Ok(STATUS.to_string()))
            .scan_once()
            .expect_err("should fail");

        assert!(matches!(err.current_context(), PluginError::Config));
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test(tokio::test)]
    async fn scan_publishes_until_cancelled() {
        let fixture = Fixture::new();
        let token = CancellationToken::new();
        let notifier = CancellingNotifier {
            trees: Mutex::new(Vec::new()),
            limit: 2,
            token: token.clone(),
        };

        fixture
            .plugin(Ok(STATUS.to_string()))
            .scan(&notifier, token)
            .await
            .expect("should stop cleanly");

        let trees = notifier.trees.into_inner().expect("poisoned");
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[0], trees[1]);
    }

    #[test(tokio::test)]
    async fn scan_stops_on_cycle_failure() {
        let fixture = Fixture::new();
        let token = CancellationToken::new();
        let notifier = CancellingNotifier {
            trees: Mutex::new(Vec::new()),
            limit: usize::MAX,
            token: token.clone(),
        };

        let err = fixture
            .plugin(Err(Report::new(PluginError::DriverStatus)))
            .scan(&notifier, token)
            .await
            .expect_err("should fail");

        assert!(matches!(err.current_context(), PluginError::DriverStatus));
        assert!(notifier.trees.lock().expect("poisoned").is_empty());
    }

    fn response(keys: &[(&str, &str)]) -> AllocateResponse {
        AllocateResponse {
            container_responses: vec![ContainerAllocateResponse {
                envs: keys
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn post_allocate_renumbers_section_variables() {
        let mut response = response(&[
            ("QAT_SECTION_NAME", "dc1"),
            ("QAT_SECTION_NAME_cy0_dc1_7", "dc1"),
            ("QAT_SECTION_NAME_cy0_dc1_12", "dc1"),
            ("QAT_SECTION_NAME_cy1_dc0_3", "ssl"),
            ("OTHER", "kept"),
        ]);

        plugin()
            .post_allocate(&mut response)
            .expect("should renumber");

        let envs = &response.container_responses[0].envs;
        assert_eq!(envs.len(), 5);
        assert_eq!(envs["QAT_SECTION_NAME"], "dc1");
        assert_eq!(envs["OTHER"], "kept");

        let suffixes: BTreeSet<_> = envs
            .keys()
            .filter(|key| key.starts_with("QAT_SECTION_NAME_"))
            .map(|key| key.rsplit('_').next().expect("has suffix").to_string())
            .collect();
        assert_eq!(suffixes, BTreeSet::from(["0", "1", "2"].map(String::from)));

        let ssl: Vec<_> = envs
            .iter()
            .filter(|(key, _)| key.starts_with("QAT_SECTION_NAME_cy1_dc0_"))
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(ssl, vec!["ssl"]);
    }

    #[test]
    fn post_allocate_rejects_malformed_keys() {
        let mut response = response(&[("QAT_SECTION_NAME_dc1_0", "dc1")]);

        let err = plugin()
            .post_allocate(&mut response)
            .expect_err("should reject key");

        assert!(matches!(
            err.current_context(),
            PluginError::MalformedEnvKey { key } if key == "QAT_SECTION_NAME_dc1_0"
        ));
    }

    #[test]
    fn post_allocate_failure_leaves_every_container_untouched() {
        let mut response = AllocateResponse {
            container_responses: vec![
                ContainerAllocateResponse {
                    envs: HashMap::from([(
                        "QAT_SECTION_NAME_cy0_dc1_7".to_string(),
                        "dc1".to_string(),
                    )]),
                    ..Default::default()
                },
                ContainerAllocateResponse {
                    envs: HashMap::from([(
                        "QAT_SECTION_NAME_broken".to_string(),
                        "dc1".to_string(),
                    )]),
                    ..Default::default()
                },
            ],
        };
        let expected = response.clone();

        let err = plugin()
            .post_allocate(&mut response)
            .expect_err("should reject second container");

        assert!(matches!(
            err.current_context(),
            PluginError::MalformedEnvKey { key } if key == "QAT_SECTION_NAME_broken"
        ));
        assert_eq!(response, expected);
    }

    #[test]
    fn post_allocate_without_section_variables() {
        let mut response = response(&[("QAT_SECTION_NAME", "dc1")]);
        let expected = response.clone();

        plugin()
            .post_allocate(&mut response)
            .expect("should accept response");

        assert_eq!(response, expected);
    }
}
