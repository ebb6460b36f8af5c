use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

use crate::errors::Result;

use super::roster::{DeviceInfo, DeviceStatus};

/// Multicast settings for LAN discovery
pub const DISCOVERY_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 192, 0, 2);
pub const DISCOVERY_MULTICAST_PORT: u16 = 42425;
pub const SERVICE_TYPE: &str = "_meshtrain._tcp.local.";
pub const BEACON_VERSION: u8 = 1;

/// Largest datagram we expect to receive.
pub const MAX_BEACON_BYTES: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeaconKind {
    /// "Who is out there?" Sent once per interface when a scan starts
    Query,
    /// "I am here." Sent in answer to a query
    Announce,
}

/// Discovery beacon packet (UDP multicast, CBOR encoded)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    /// Protocol version (v1)
    pub version: u8,
    /// Service type; beacons for other services are ignored
    pub service: String,
    /// Per-process identifier, used to drop our own multicast echoes
    pub node_id: Uuid,
    pub kind: BeaconKind,
    pub hostname: String,
    /// Address the sender believes it is reachable at
    pub address: IpAddr,
    pub device_type: String,
    pub memory_gb: f64,
}

impl Beacon {
    pub fn new(service: &str, node_id: Uuid, kind: BeaconKind, local: &DeviceInfo) -> Self {
        Beacon {
            version: BEACON_VERSION,
            service: service.to_string(),
            node_id,
            kind,
            hostname: local.hostname.clone(),
            address: local.address,
            device_type: local.device_type.clone(),
            memory_gb: local.memory_gb,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut packet = Vec::new();
        ciborium::ser::into_writer(self, &mut packet)?;
        Ok(packet)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(ciborium::de::from_reader(bytes)?)
    }

    /// Whether the advertised memory is a usable amount (finite, not negative)
    pub fn has_valid_memory(&self) -> bool {
        self.memory_gb.is_finite() && self.memory_gb >= 0.0
    }

    /// Peer entry for this beacon.
    ///
    /// The advertised address wins unless it is loopback or unspecified, in
    /// which case the datagram's source address is used. Invalid memory
    /// figures become 0.
    pub fn to_device(&self, sender: IpAddr) -> DeviceInfo {
        let address = if self.address.is_loopback() || self.address.is_unspecified() {
            sender
        } else {
            self.address
        };

        DeviceInfo {
            hostname: self.hostname.clone(),
            address,
            device_type: self.device_type.clone(),
            memory_gb: if self.has_valid_memory() {
                self.memory_gb
            } else {
                0.0
            },
            status: DeviceStatus::Available,
        }
    }
}

/// What a received beacon means to this node.
#[derive(Debug, Clone, PartialEq)]
pub enum BeaconDisposition {
    /// Echo of our own beacon, other service, or unknown version
    Ignore,
    /// Another node asked who is out there
    AnswerQuery,
    /// Another node announced itself
    Peer(DeviceInfo),
}

/// Classify a received beacon relative to our own node and service.
pub fn classify_beacon(
    beacon: &Beacon,
    sender: IpAddr,
    my_node_id: Uuid,
    service: &str,
) -> BeaconDisposition {
    if beacon.node_id == my_node_id {
        return BeaconDisposition::Ignore;
    }

    if beacon.service != service || beacon.version != BEACON_VERSION {
        tracing::trace!(
            service = %beacon.service,
            version = beacon.version,
            "Ignoring beacon from another service"
        );
        return BeaconDisposition::Ignore;
    }

    match beacon.kind {
        BeaconKind::Query => BeaconDisposition::AnswerQuery,
        BeaconKind::Announce if !beacon.has_valid_memory() => {
            tracing::debug!(
                hostname = %beacon.hostname,
                memory_gb = beacon.memory_gb,
                "Ignoring announcement with invalid memory"
            );
            BeaconDisposition::Ignore
        }
        BeaconKind::Announce => BeaconDisposition::Peer(beacon.to_device(sender)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> DeviceInfo {
        DeviceInfo {
            hostname: "studio".to_string(),
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            device_type: "M2 Ultra".to_string(),
            memory_gb: 192.0,
            status: DeviceStatus::Active,
        }
    }

    fn sender() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))
    }

    #[test]
    fn test_create_beacon() {
        let node_id = Uuid::new_v4();
        let beacon = Beacon::new(SERVICE_TYPE, node_id, BeaconKind::Announce, &local());

        assert_eq!(beacon.version, BEACON_VERSION);
        assert_eq!(beacon.node_id, node_id);
        assert_eq!(beacon.hostname, "studio");
        assert_eq!(beacon.memory_gb, 192.0);
    }

    #[test]
    fn test_beacon_serialization() {
        let beacon = Beacon::new(SERVICE_TYPE, Uuid::new_v4(), BeaconKind::Query, &local());

        let bytes = beacon.encode().unwrap();
        assert!(bytes.len() < MAX_BEACON_BYTES);

        let decoded = Beacon::decode(&bytes).unwrap();
        assert_eq!(decoded, beacon);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Beacon::decode(&[0xff, 0x00, 0x13]).is_err());
    }

    #[test]
    fn test_own_beacon_ignored() {
        let me = Uuid::new_v4();
        let beacon = Beacon::new(SERVICE_TYPE, me, BeaconKind::Announce, &local());

        assert_eq!(
            classify_beacon(&beacon, sender(), me, SERVICE_TYPE),
            BeaconDisposition::Ignore
        );
    }

    #[test]
    fn test_other_service_ignored() {
        let beacon = Beacon::new(
            "_other._tcp.local.",
            Uuid::new_v4(),
            BeaconKind::Announce,
            &local(),
        );

        assert_eq!(
            classify_beacon(&beacon, sender(), Uuid::new_v4(), SERVICE_TYPE),
            BeaconDisposition::Ignore
        );
    }

    #[test]
    fn test_query_is_answered() {
        let beacon = Beacon::new(SERVICE_TYPE, Uuid::new_v4(), BeaconKind::Query, &local());

        assert_eq!(
            classify_beacon(&beacon, sender(), Uuid::new_v4(), SERVICE_TYPE),
            BeaconDisposition::AnswerQuery
        );
    }

    #[test]
    fn test_announce_becomes_available_peer() {
        let beacon = Beacon::new(SERVICE_TYPE, Uuid::new_v4(), BeaconKind::Announce, &local());

        match classify_beacon(&beacon, sender(), Uuid::new_v4(), SERVICE_TYPE) {
            BeaconDisposition::Peer(device) => {
                assert_eq!(device.hostname, "studio");
                assert_eq!(device.memory_gb, 192.0);
                assert_eq!(device.status, DeviceStatus::Available);
            }
            other => panic!("expected peer, got {:?}", other),
        }
    }

    #[test]
    fn test_advertised_address_preferred() {
        let beacon = Beacon::new(SERVICE_TYPE, Uuid::new_v4(), BeaconKind::Announce, &local());
        let device = beacon.to_device(sender());
        assert_eq!(device.address, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)));
    }

    #[test]
    fn test_loopback_advertisement_uses_sender() {
        let mut me = local();
        me.address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let beacon = Beacon::new(SERVICE_TYPE, Uuid::new_v4(), BeaconKind::Announce, &me);

        assert_eq!(beacon.to_device(sender()).address, sender());
    }

    #[test]
    fn test_invalid_memory_ignored() {
        for memory_gb in [f64::NAN, -4.0, f64::INFINITY] {
            let mut beacon =
                Beacon::new(SERVICE_TYPE, Uuid::new_v4(), BeaconKind::Announce, &local());
            beacon.memory_gb = memory_gb;

            assert_eq!(
                classify_beacon(&beacon, sender(), Uuid::new_v4(), SERVICE_TYPE),
                BeaconDisposition::Ignore
            );
            assert_eq!(beacon.to_device(sender()).memory_gb, 0.0);
        }
    }
}
