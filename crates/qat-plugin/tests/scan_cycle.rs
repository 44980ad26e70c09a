use std::fs;
use std::path::Path;
use std::time::Duration;

use api_types::AllocateResponse;
use api_types::ContainerAllocateResponse;
use api_types::HEALTHY;
use qat_plugin::deviceplugin::ChannelNotifier;
use qat_plugin::deviceplugin::PostAllocator;
use qat_plugin::deviceplugin::Scanner;
use qat_plugin::kerneldrv::DevicePlugin;
use qat_plugin::kerneldrv::PluginResult;
use qat_plugin::kerneldrv::StatusSource;
use similar_asserts::assert_eq;
use tempfile::TempDir;
use test_log::test;
use tokio_util::sync::CancellationToken;

const STATUS: &str = "\
Checking status of all devices.
There is 3 QAT acceleration device(s) in the system:
 qat_dev0 - type: c6xx,  inst_id: 0,  node_id: 0,  bsf: 0000:3d:00.0,  #accel: 5 #engines: 10 state: up
 qat_dev1 - type: c6xx,  inst_id: 1,  node_id: 0,  bsf: 0000:3f:00.0,  #accel: 5 #engines: 10 state: up
 qat_dev2 - type: c6xx,  inst_id: 2,  node_id: 1,  bsf: 0000:da:00.0,  #accel: 5 #engines: 10 state: down
";

const DEV_CONFIG: &str = "\
[GENERAL]
ServicesEnabled = cy;dc

[KERNEL]
NumberCyInstances = 1

[SSL]
NumberCyInstances = 1
NumberDcInstances = 0
NumProcesses = 2
LimitDevAccess = 1

[SHIM]
NumberCyInstances = 0
NumberDcInstances = 1
NumProcesses = 3
LimitDevAccess = 0
";

struct CannedStatus;

impl StatusSource for CannedStatus {
    fn status(&self) -> PluginResult<String> {
        Ok(STATUS.to_string())
    }
}

fn create_dir(path: &Path) {
    fs::create_dir_all(path).expect("should create dir");
}

/// Host with two online c6xx devices, each owning one UIO device.
fn host() -> (TempDir, TempDir) {
    let sysfs = TempDir::new().expect("should create sysfs root");
    let conf = TempDir::new().expect("should create config dir");

    create_dir(&sysfs.path().join("sys/class/iommu"));
    create_dir(&sysfs.path().join("sys/devices/pci0000:3d/0000:3d:00.0/uio/uio0"));
    create_dir(&sysfs.path().join("sys/devices/pci0000:3f/0000:3f:00.0/uio/uio1"));

    for device in ["dev0", "dev1"] {
        fs::write(conf.path().join(format!("c6xx_{device}.conf")), DEV_CONFIG)
            .expect("should write device config");
    }

    (sysfs, conf)
}

#[test(tokio::test)]
async fn scan_cycle_publishes_catalog() {
    let (sysfs, conf) = host();
    let plugin = DevicePlugin::new(
        CannedStatus,
        conf.path(),
        sysfs.path(),
        Duration::from_millis(10),
    );
    let (notifier, mut receiver) = ChannelNotifier::new();
    let token = CancellationToken::new();

    let (scan_result, tree) = tokio::join!(plugin.scan(&notifier, token.clone()), async {
        receiver.changed().await.expect("notifier alive");
        let tree = receiver.borrow_and_update().clone();
        token.cancel();
        tree
    });
    scan_result.expect("scan should stop cleanly");

    // pinned SSL: one unit per process on every device, unpinned SHIM: first device only
    assert_eq!(tree.device_types().collect::<Vec<_>>(), vec!["cy0_dc1", "cy1_dc0"]);
    assert_eq!(tree.device_type_count("cy1_dc0"), 4);
    assert_eq!(tree.device_type_count("cy0_dc1"), 3);

    let mut ids: Vec<_> = tree.iter().map(|(_, id, _)| id.to_string()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 7);

    for (_, _, info) in tree.iter() {
        assert_eq!(info.state(), HEALTHY);
        let host_paths: Vec<_> = info.nodes().iter().map(|n| n.host_path.as_str()).collect();
        assert_eq!(
            host_paths,
            vec![
                "/dev/qat_adf_ctl",
                "/dev/qat_dev_processes",
                "/dev/usdm_drv",
                "/dev/uio0",
                "/dev/uio1",
            ]
        );
        assert_eq!(info.envs().len(), 2);
    }
}

#[test]
fn allocation_renumbers_units_of_one_container() {
    let (sysfs, conf) = host();
    let plugin = DevicePlugin::new(
        CannedStatus,
        conf.path(),
        sysfs.path(),
        Duration::from_secs(5),
    );
    let tree = plugin.scan_once().expect("should scan");

    // a container granted every SSL unit gets the union of their variables
    let mut container = ContainerAllocateResponse::default();
    for (_, _, info) in tree.iter().filter(|(dev_type, _, _)| *dev_type == "cy1_dc0") {
        container
            .envs
            .extend(info.envs().iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    let mut response = AllocateResponse {
        container_responses: vec![container],
    };

    plugin
        .post_allocate(&mut response)
        .expect("should renumber");

    let mut keys: Vec<_> = response.container_responses[0].envs.keys().cloned().collect();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            "QAT_SECTION_NAME",
            "QAT_SECTION_NAME_cy1_dc0_0",
            "QAT_SECTION_NAME_cy1_dc0_1",
            "QAT_SECTION_NAME_cy1_dc0_2",
            "QAT_SECTION_NAME_cy1_dc0_3",
        ]
    );
    assert!(response.container_responses[0]
        .envs
        .values()
        .all(|section| section == "SSL"));
}
