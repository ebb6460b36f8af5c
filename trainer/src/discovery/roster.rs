use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use crate::errors::{Result, TrainerError};
use crate::hardware::HardwareProfile;

use super::interfaces;

/// Availability of a device in the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Discovered peer, ready to be launched on
    Available,
    /// The device this process runs on
    Active,
}

/// A device taking part in (or offered to) a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub hostname: String,
    pub address: IpAddr,
    pub device_type: String,
    pub memory_gb: f64,
    pub status: DeviceStatus,
}

impl DeviceInfo {
    /// Build the local device entry from a hardware profile and host identity.
    pub fn local(profile: &HardwareProfile) -> Self {
        let address = interfaces::ipv4_interfaces()
            .first()
            .map(|iface| IpAddr::V4(iface.addr))
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        Self {
            hostname: interfaces::local_hostname(),
            address,
            device_type: profile.device_type.clone(),
            memory_gb: profile.total_memory_gb.max(0.0),
            status: DeviceStatus::Active,
        }
    }

    /// Identity used for roster deduplication.
    pub fn identity(&self) -> (&str, IpAddr) {
        (&self.hostname, self.address)
    }
}

/// Ordered, deduplicated set of devices; the local device is always first.
///
/// A device's rank is its index, the cluster size is the roster length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRoster {
    devices: Vec<DeviceInfo>,
}

impl ClusterRoster {
    /// Create a roster containing only the local device.
    pub fn new(local: DeviceInfo) -> Self {
        Self {
            devices: vec![local],
        }
    }

    /// Append a peer unless a device with the same (hostname, address) is
    /// already present. Returns whether the peer was added.
    pub fn insert_peer(&mut self, peer: DeviceInfo) -> bool {
        if self.contains(peer.identity()) {
            return false;
        }
        self.devices.push(peer);
        true
    }

    pub fn contains(&self, identity: (&str, IpAddr)) -> bool {
        self.devices.iter().any(|d| d.identity() == identity)
    }

    pub fn local(&self) -> &DeviceInfo {
        &self.devices[0]
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Always false: a roster holds at least the local device.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Rank of the device with the given identity, if present.
    pub fn rank_of(&self, identity: (&str, IpAddr)) -> Option<usize> {
        self.devices.iter().position(|d| d.identity() == identity)
    }

    /// Total memory across the roster in GB.
    pub fn total_memory_gb(&self) -> f64 {
        self.devices.iter().map(|d| d.memory_gb).sum()
    }

    /// Ring addresses, index `i` being rank `i`.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.devices.iter().map(|d| d.address).collect()
    }

    /// Write the roster as JSON so every host can launch from the same order.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| TrainerError::Serialization(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let roster: Self = serde_json::from_str(&json).map_err(|e| {
            TrainerError::Serialization(format!("Roster {}: {}", path.display(), e))
        })?;
        if roster.is_empty() {
            return Err(TrainerError::Config(format!(
                "Roster {} lists no devices",
                path.display()
            )));
        }
        Ok(roster)
    }
}

/// Render an MPI-style hostfile: one `"<hostname> slots=1"` line per device,
/// in roster order.
pub fn create_hostfile(roster: &ClusterRoster) -> String {
    roster
        .devices()
        .iter()
        .map(|device| format!("{} slots=1", device.hostname))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(hostname: &str, last_octet: u8, status: DeviceStatus) -> DeviceInfo {
        DeviceInfo {
            hostname: hostname.to_string(),
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)),
            device_type: "M2 Max".to_string(),
            memory_gb: 32.0,
            status,
        }
    }

    #[test]
    fn test_local_device_first() {
        let mut roster = ClusterRoster::new(device("studio", 1, DeviceStatus::Active));
        roster.insert_peer(device("mini", 2, DeviceStatus::Available));

        assert_eq!(roster.len(), 2);
        assert_eq!(roster.local().hostname, "studio");
        assert_eq!(roster.local().status, DeviceStatus::Active);
    }

    #[test]
    fn test_dedup_by_hostname_and_address() {
        let mut roster = ClusterRoster::new(device("studio", 1, DeviceStatus::Active));

        assert!(roster.insert_peer(device("mini", 2, DeviceStatus::Available)));
        assert!(!roster.insert_peer(device("mini", 2, DeviceStatus::Available)));
        // Same host seen on a second address is a distinct entry
        assert!(roster.insert_peer(device("mini", 3, DeviceStatus::Available)));
        // A peer echoing the local identity is dropped
        assert!(!roster.insert_peer(device("studio", 1, DeviceStatus::Available)));

        assert_eq!(roster.len(), 3);
    }

    #[test]
    fn test_rank_is_index() {
        let mut roster = ClusterRoster::new(device("a", 1, DeviceStatus::Active));
        roster.insert_peer(device("b", 2, DeviceStatus::Available));
        roster.insert_peer(device("c", 3, DeviceStatus::Available));

        let c = &roster.devices()[2];
        assert_eq!(roster.rank_of(c.identity()), Some(2));
        assert_eq!(
            roster.rank_of(("z", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)))),
            None
        );
    }

    #[test]
    fn test_saved_roster_keeps_rank_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("roster.json");

        let mut roster = ClusterRoster::new(device("studio", 1, DeviceStatus::Active));
        roster.insert_peer(device("mini", 2, DeviceStatus::Available));
        roster.save(&path).unwrap();

        let loaded = ClusterRoster::load(&path).unwrap();
        assert_eq!(loaded, roster);
        assert_eq!(
            loaded.addresses(),
            vec![
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))
            ]
        );
    }

    #[test]
    fn test_empty_roster_file_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("roster.json");
        std::fs::write(&path, r#"{"devices": []}"#).unwrap();
        assert!(matches!(ClusterRoster::load(&path), Err(TrainerError::Config(_))));
    }

    #[test]
    fn test_create_hostfile() {
        let mut roster = ClusterRoster::new(device("studio", 1, DeviceStatus::Active));
        roster.insert_peer(device("mini-1", 2, DeviceStatus::Available));
        roster.insert_peer(device("mini-2", 3, DeviceStatus::Available));

        assert_eq!(
            create_hostfile(&roster),
            "studio slots=1\nmini-1 slots=1\nmini-2 slots=1"
        );
    }

    #[test]
    fn test_hostfile_single_device_has_no_trailing_newline() {
        let roster = ClusterRoster::new(device("studio", 1, DeviceStatus::Active));
        assert_eq!(create_hostfile(&roster), "studio slots=1");
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&DeviceStatus::Available).unwrap();
        assert_eq!(json, "\"available\"");
    }

    #[test]
    fn test_local_entry_from_profile() {
        let local = DeviceInfo::local(&HardwareProfile::fallback());
        assert_eq!(local.status, DeviceStatus::Active);
        assert!(!local.hostname.is_empty());
        assert_eq!(local.device_type, "Apple Silicon");
    }
}
