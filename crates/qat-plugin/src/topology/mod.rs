//! Device topology discovery.
//!
//! Walks the sysfs device hierarchy to find out which CPUs, NUMA nodes and
//! sockets a device node is attached to. The main components are:
//! - [`Hint`]: affinity detected at a single sysfs provider directory
//! - [`Hints`]: hints for a device and every device it depends on
//! - [`TopologyResolver`]: resolves hints relative to an injectable root

mod hints;
mod resolver;

use core::error::Error;

use error_stack::Report;

pub use hints::merge_topology_hints;
pub use hints::Hint;
pub use hints::Hints;
pub use resolver::TopologyResolver;

pub type TopologyResult<T> = Result<T, Report<TopologyError>>;

/// Errors that can occur while resolving device topology.
#[derive(Debug, derive_more::Display)]
pub enum TopologyError {
    #[display("failed to get real path for {path}")]
    RealPath { path: String },
    #[display("unable to read sysfs attribute {path}")]
    ReadAttribute { path: String },
    #[display("{path} is not a virtual device")]
    NotVirtual { path: String },
    #[display("failed to read IOMMU group {path}")]
    IommuGroup { path: String },
    #[display("unable to get stat for {path}")]
    Stat { path: String },
    #[display("{path} is a virtual device node")]
    VirtualDeviceNode { path: String },
    #[display("device {path} doesn't exist")]
    MissingDevice { path: String },
    #[display("invalid NUMA node {value}")]
    InvalidNumaNode { value: String },
}

impl Error for TopologyError {}
