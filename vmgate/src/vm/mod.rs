//! Hypervisor plumbing: the qemu-system command line and process, the QMP
//! monitor client, and the qemu-img wrapper.

pub mod img;
pub mod qemu;
pub mod qmp;

pub use img::QemuImg;
pub use qmp::{QmpClient, VmStatus};
