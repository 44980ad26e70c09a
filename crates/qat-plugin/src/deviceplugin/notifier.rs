use tokio::sync::watch;

use super::DeviceTree;
use super::Notifier;

/// Notifier that forwards changed device trees to a watch channel.
///
/// Receivers are only woken when a tree differs from the last published one,
/// an identical rescan is dropped.
#[derive(Debug)]
pub struct ChannelNotifier {
    sender: watch::Sender<DeviceTree>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, watch::Receiver<DeviceTree>) {
        let (sender, receiver) = watch::channel(DeviceTree::new());
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, tree: DeviceTree) {
        self.sender.send_if_modified(|current| {
            if *current == tree {
                return false;
            }
            *current = tree;
            true
        });
    }
}
