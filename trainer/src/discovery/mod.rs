pub mod beacon;
pub mod interfaces;
pub mod roster;
pub mod service;

pub use beacon::{Beacon, BeaconKind, SERVICE_TYPE};
pub use roster::{create_hostfile, ClusterRoster, DeviceInfo, DeviceStatus};
pub use service::{
    discover_devices, DiscoveryConfig, DiscoveryReport, DiscoveryService, InterfaceFailure,
};
