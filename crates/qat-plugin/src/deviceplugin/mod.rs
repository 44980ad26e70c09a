//! Device plugin framework seams.
//!
//! A [`Scanner`] periodically discovers devices and hands a complete
//! [`DeviceTree`] to a [`Notifier`]. The RPC server that advertises the tree to
//! the kubelet lives behind these traits, as does the optional
//! [`PostAllocator`] hook that rewrites allocation responses.

mod device_tree;
mod notifier;

use std::future::Future;

use api_types::AllocateResponse;
use error_stack::Context;
use error_stack::Report;
use tokio_util::sync::CancellationToken;

pub use device_tree::resolve_topology;
pub use device_tree::DeviceInfo;
pub use device_tree::DeviceTree;
pub use notifier::ChannelNotifier;

/// Receives device trees produced by a [`Scanner`].
pub trait Notifier: Send + Sync {
    /// Publishes a complete device tree, never a partial update.
    fn notify(&self, tree: DeviceTree);
}

/// Discovers devices and publishes them to a [`Notifier`] until cancelled or
/// until discovery fails.
pub trait Scanner {
    type Error: Context;

    fn scan(
        &self,
        notifier: &dyn Notifier,
        cancellation_token: CancellationToken,
    ) -> impl Future<Output = Result<(), Report<Self::Error>>> + Send;
}

/// Modifies allocation responses before they are returned to the kubelet.
pub trait PostAllocator {
    type Error: Context;

    fn post_allocate(&self, response: &mut AllocateResponse) -> Result<(), Report<Self::Error>>;
}
