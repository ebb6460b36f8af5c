use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::errors::{Result, TrainerError};
use crate::hardware::HardwareProfile;

use super::beacon::{
    classify_beacon, Beacon, BeaconDisposition, BeaconKind, DISCOVERY_MULTICAST_ADDR,
    DISCOVERY_MULTICAST_PORT, MAX_BEACON_BYTES, SERVICE_TYPE,
};
use super::interfaces::{self, InterfaceAddr};
use super::roster::{ClusterRoster, DeviceInfo};

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Service identifier carried by every beacon
    pub service_name: String,

    /// Multicast group beacons are sent to
    pub multicast_addr: Ipv4Addr,

    /// UDP port of the multicast group (0 picks an ephemeral port)
    pub port: u16,

    /// How long `discover()` listens for announcements
    pub listen_window_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_TYPE.to_string(),
            multicast_addr: DISCOVERY_MULTICAST_ADDR,
            port: DISCOVERY_MULTICAST_PORT,
            listen_window_ms: 2000,
        }
    }
}

impl DiscoveryConfig {
    pub fn listen_window(&self) -> Duration {
        Duration::from_millis(self.listen_window_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.multicast_addr.is_multicast() {
            return Err(TrainerError::Config(format!(
                "discovery.multicast_addr {} is not a multicast address",
                self.multicast_addr
            )));
        }
        if self.service_name.trim().is_empty() {
            return Err(TrainerError::Config(
                "discovery.service_name must not be empty".into(),
            ));
        }
        if self.listen_window_ms == 0 {
            return Err(TrainerError::Config(
                "discovery.listen_window_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// An interface whose scan failed; the rest of the scan carried on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceFailure {
    pub interface: String,
    pub address: Ipv4Addr,
    pub error: String,
}

/// Outcome of one discovery round.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub roster: ClusterRoster,
    pub interface_failures: Vec<InterfaceFailure>,
    /// True when the multicast listener could not be opened
    pub local_only: bool,
}

/// LAN discovery over UDP multicast.
///
/// Opened once, used for one or more rounds, then closed. When the listener
/// can't be bound the service runs in local-only mode and every round returns
/// a roster holding just the local device.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    node_id: Uuid,
    local: DeviceInfo,
    socket: Option<UdpSocket>,
    target: SocketAddrV4,
}

impl DiscoveryService {
    pub async fn open(config: DiscoveryConfig, local: DeviceInfo) -> Self {
        let node_id = Uuid::new_v4();

        let socket = match Self::bind_listener(&config).await {
            Ok(socket) => Some(socket),
            Err(e) => {
                tracing::warn!(
                    multicast_addr = %config.multicast_addr,
                    port = config.port,
                    error = %e,
                    "Discovery listener unavailable, running local-only"
                );
                None
            }
        };

        // With port 0 the group port is whatever the listener was given
        let port = socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|addr| addr.port())
            .unwrap_or(config.port);

        tracing::info!(
            multicast_addr = %config.multicast_addr,
            port,
            node_id = %node_id,
            service = %config.service_name,
            "Discovery service opened"
        );

        Self {
            target: SocketAddrV4::new(config.multicast_addr, port),
            config,
            node_id,
            local,
            socket,
        }
    }

    async fn bind_listener(config: &DiscoveryConfig) -> Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?;
        socket.join_multicast_v4(config.multicast_addr, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        Ok(socket)
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn local_device(&self) -> &DeviceInfo {
        &self.local
    }

    pub fn is_local_only(&self) -> bool {
        self.socket.is_none()
    }

    /// Run one discovery round across all non-loopback IPv4 interfaces.
    pub async fn discover(&self) -> DiscoveryReport {
        self.discover_on(&interfaces::ipv4_interfaces()).await
    }

    /// Run one discovery round, querying the given interfaces.
    ///
    /// Returns once the listen window has elapsed. Interface errors are
    /// logged and collected, never raised.
    pub async fn discover_on(&self, ifaces: &[InterfaceAddr]) -> DiscoveryReport {
        let mut roster = ClusterRoster::new(self.local.clone());

        let Some(socket) = &self.socket else {
            tracing::info!("Local-only discovery, skipping network scan");
            return DiscoveryReport {
                roster,
                interface_failures: Vec::new(),
                local_only: true,
            };
        };

        let deadline = Instant::now() + self.config.listen_window();
        let mut interface_failures = Vec::new();

        for iface in ifaces {
            match self.send_query(iface).await {
                Ok(()) => {
                    tracing::debug!(interface = %iface.name, address = %iface.addr, "Query sent");
                }
                Err(e) => {
                    tracing::warn!(
                        interface = %iface.name,
                        address = %iface.addr,
                        error = %e,
                        "Could not scan interface"
                    );
                    interface_failures.push(InterfaceFailure {
                        interface: iface.name.clone(),
                        address: iface.addr,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.listen_until(socket, deadline, &mut roster).await;

        tracing::info!(
            devices = roster.len(),
            failed_interfaces = interface_failures.len(),
            "Discovery complete"
        );

        DiscoveryReport {
            roster,
            interface_failures,
            local_only: false,
        }
    }

    /// Answer queries from other nodes for `duration`, so a launcher running
    /// `discover()` elsewhere can find this device.
    pub async fn serve(&self, duration: Duration) -> Result<()> {
        let Some(socket) = &self.socket else {
            tracing::warn!("Local-only discovery, nothing to serve");
            return Ok(());
        };

        // Announce once up front so an in-progress round sees us
        self.announce(socket).await;

        let mut seen = ClusterRoster::new(self.local.clone());
        self.listen_until(socket, Instant::now() + duration, &mut seen)
            .await;
        Ok(())
    }

    /// Leave the multicast group and release the socket.
    pub fn close(self) {
        if let Some(socket) = self.socket {
            if let Err(e) = socket.leave_multicast_v4(self.config.multicast_addr, Ipv4Addr::UNSPECIFIED)
            {
                tracing::debug!(error = %e, "Failed to leave multicast group");
            }
        }
        tracing::debug!(node_id = %self.node_id, "Discovery service closed");
    }

    /// Send one query with egress pinned to `iface` (the socket is bound to
    /// the interface address, which selects the outgoing interface).
    async fn send_query(&self, iface: &InterfaceAddr) -> Result<()> {
        let sender = UdpSocket::bind((iface.addr, 0)).await?;
        sender.set_multicast_ttl_v4(1)?;

        let packet = Beacon::new(
            &self.config.service_name,
            self.node_id,
            BeaconKind::Query,
            &self.local,
        )
        .encode()?;

        sender.send_to(&packet, self.target).await?;
        Ok(())
    }

    async fn announce(&self, socket: &UdpSocket) {
        let beacon = Beacon::new(
            &self.config.service_name,
            self.node_id,
            BeaconKind::Announce,
            &self.local,
        );

        match beacon.encode() {
            Ok(packet) => match socket.send_to(&packet, self.target).await {
                Ok(sent) => {
                    tracing::trace!(node_id = %self.node_id, bytes = sent, "Announce sent");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to send announce");
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize announce");
            }
        }
    }

    async fn listen_until(&self, socket: &UdpSocket, deadline: Instant, roster: &mut ClusterRoster) {
        let mut buf = vec![0u8; MAX_BEACON_BYTES];

        loop {
            let (len, sender) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Failed to receive beacon");
                    continue;
                }
            };

            let beacon = match Beacon::decode(&buf[..len]) {
                Ok(beacon) => beacon,
                Err(e) => {
                    tracing::debug!(error = %e, sender = %sender, "Failed to parse beacon");
                    continue;
                }
            };

            match classify_beacon(&beacon, sender.ip(), self.node_id, &self.config.service_name) {
                BeaconDisposition::Ignore => {}
                BeaconDisposition::AnswerQuery => self.announce(socket).await,
                BeaconDisposition::Peer(device) => {
                    let hostname = device.hostname.clone();
                    let address = device.address;
                    if roster.insert_peer(device) {
                        tracing::info!(
                            hostname = %hostname,
                            address = %address,
                            node_id = %beacon.node_id,
                            "LAN peer discovered"
                        );
                    }
                }
            }
        }
    }
}

/// Detect local hardware, run one discovery round, and return the roster.
///
/// Always contains the local device first, even if no peers answer.
pub async fn discover_devices(config: &DiscoveryConfig) -> ClusterRoster {
    let local = DeviceInfo::local(&HardwareProfile::detect());
    let service = DiscoveryService::open(config.clone(), local).await;
    let report = service.discover().await;
    service.close();
    report.roster
}
