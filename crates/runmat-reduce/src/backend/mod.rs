pub mod host;
#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use host::{HostDevice, HostDeviceConfig, LaunchRecord};
