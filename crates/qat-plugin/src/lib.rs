//! Discovery of Intel QuickAssist accelerators for a device plugin.
//!
//! The [`kerneldrv`] plugin enumerates accelerators through the kernel driver,
//! reconciles their configuration into workload sections and publishes the
//! resulting catalog through the [`deviceplugin`] seams. NUMA affinity of the
//! published device nodes comes from [`topology`].

pub mod config;
pub mod deviceplugin;
pub mod kerneldrv;
pub mod topology;
