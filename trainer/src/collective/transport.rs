use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::errors::{Result, TrainerError};

use super::codec::{read_frame, write_frame};
use super::message::TensorMessage;

/// Point-to-point links of one rank in a ring: send to the right neighbour,
/// receive from the left neighbour.
#[async_trait]
pub trait RingTransport: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn left_rank(&self) -> usize {
        (self.rank() + self.size() - 1) % self.size()
    }

    fn right_rank(&self) -> usize {
        (self.rank() + 1) % self.size()
    }

    async fn send_right(&mut self, message: TensorMessage) -> Result<()>;

    async fn recv_left(&mut self) -> Result<TensorMessage>;
}

/// In-process ring over tokio channels; one endpoint per rank.
pub struct ChannelRing {
    rank: usize,
    size: usize,
    right: mpsc::Sender<TensorMessage>,
    left: mpsc::Receiver<TensorMessage>,
}

impl ChannelRing {
    /// Messages buffered per link before a sender waits.
    pub const LINK_CAPACITY: usize = 64;

    /// Build a connected ring of `size` endpoints; endpoint `i` is rank `i`.
    pub fn build(size: usize) -> Vec<ChannelRing> {
        let (senders, mut receivers): (Vec<_>, Vec<_>) = (0..size)
            .map(|_| mpsc::channel(Self::LINK_CAPACITY))
            .unzip();

        // Link i carries rank i -> rank i+1, so rank r reads link r-1
        receivers.rotate_right(1);

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (right, left))| ChannelRing {
                rank,
                size,
                right,
                left,
            })
            .collect()
    }
}

#[async_trait]
impl RingTransport for ChannelRing {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn send_right(&mut self, message: TensorMessage) -> Result<()> {
        self.right.send(message).await.map_err(|_| {
            TrainerError::Collective(format!(
                "Link to rank {} closed",
                (self.rank + 1) % self.size
            ))
        })
    }

    async fn recv_left(&mut self) -> Result<TensorMessage> {
        self.left.recv().await.ok_or_else(|| {
            TrainerError::Collective(format!(
                "Link from rank {} closed",
                (self.rank + self.size - 1) % self.size
            ))
        })
    }
}

/// TCP ring settings
#[derive(Debug, Clone)]
pub struct TcpRingConfig {
    /// Rank `r` listens on `base_port + r`
    pub base_port: u16,
    /// How long to wait for both neighbour links to come up
    pub connect_timeout: Duration,
}

impl Default for TcpRingConfig {
    fn default() -> Self {
        Self {
            base_port: 47100,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Ring over TCP: one inbound connection from the left neighbour and one
/// outbound connection to the right neighbour, carrying length-prefixed CBOR
/// frames.
///
/// Socket IO runs in background tasks behind channels, so a collective that
/// times out mid-exchange never leaves a half-written or half-read frame on
/// the stream.
pub struct TcpRing {
    rank: usize,
    size: usize,
    right: mpsc::Sender<TensorMessage>,
    left: mpsc::Receiver<TensorMessage>,
    reader: JoinHandle<()>,
}

impl TcpRing {
    /// Join the ring as `rank`; `peers[i]` is the address of rank `i`.
    pub async fn connect(rank: usize, peers: &[IpAddr], config: &TcpRingConfig) -> Result<Self> {
        let size = peers.len();
        if size < 2 {
            return Err(TrainerError::Config(
                "A TCP ring needs at least two ranks".into(),
            ));
        }
        if rank >= size {
            return Err(TrainerError::Config(format!(
                "Rank {} out of range for {} peers",
                rank, size
            )));
        }

        let left_rank = (rank + size - 1) % size;
        let right_rank = (rank + 1) % size;

        let listen_port = port_for(config.base_port, rank)?;
        let right_addr = SocketAddr::new(peers[right_rank], port_for(config.base_port, right_rank)?);

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, listen_port))
            .await
            .map_err(|e| {
                TrainerError::Network(format!("Failed to listen on port {}: {}", listen_port, e))
            })?;

        tracing::info!(
            rank,
            size,
            listen_port,
            right = %right_addr,
            "Joining TCP ring"
        );

        let links = async {
            tokio::try_join!(
                accept_left(&listener, left_rank),
                connect_right(right_addr, rank)
            )
        };

        let (left, right) = tokio::time::timeout(config.connect_timeout, links)
            .await
            .map_err(|_| TrainerError::RankUnreachable {
                rank: right_rank,
                timeout: config.connect_timeout,
            })?
            .map_err(|e| TrainerError::Network(format!("Ring link setup failed: {}", e)))?;

        tracing::info!(rank, left_rank, right_rank, "TCP ring connected");

        let (outbound, outbound_rx) = mpsc::channel(ChannelRing::LINK_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel(ChannelRing::LINK_CAPACITY);
        tokio::spawn(write_loop(right, outbound_rx, right_rank));
        let reader = tokio::spawn(read_loop(left, inbound_tx, left_rank));

        Ok(Self {
            rank,
            size,
            right: outbound,
            left: inbound,
            reader,
        })
    }
}

impl Drop for TcpRing {
    fn drop(&mut self) {
        // The writer drains what is queued and exits once the sender is gone
        self.reader.abort();
    }
}

async fn write_loop(mut stream: TcpStream, mut outbound: mpsc::Receiver<TensorMessage>, peer: usize) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = write_frame(&mut stream, &message).await {
            tracing::warn!(peer, error = %e, "Send to right neighbour failed, closing link");
            return;
        }
    }
}

async fn read_loop(mut stream: TcpStream, inbound: mpsc::Sender<TensorMessage>, peer: usize) {
    loop {
        match read_frame::<_, TensorMessage>(&mut stream).await {
            Ok(message) => {
                if inbound.send(message).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(peer, error = %e, "Receive from left neighbour failed, closing link");
                return;
            }
        }
    }
}

fn port_for(base_port: u16, rank: usize) -> Result<u16> {
    u16::try_from(rank)
        .ok()
        .and_then(|r| base_port.checked_add(r))
        .ok_or_else(|| {
            TrainerError::Config(format!(
                "Port for rank {} overflows (base port {})",
                rank, base_port
            ))
        })
}

async fn accept_left(listener: &TcpListener, left_rank: usize) -> std::io::Result<TcpStream> {
    loop {
        let (mut stream, peer) = listener.accept().await?;

        let mut hello = [0u8; 4];
        stream.read_exact(&mut hello).await?;
        let claimed = u32::from_be_bytes(hello) as usize;

        if claimed == left_rank {
            stream.set_nodelay(true)?;
            return Ok(stream);
        }

        tracing::warn!(
            peer = %peer,
            claimed_rank = claimed,
            expected_rank = left_rank,
            "Rejecting ring connection from unexpected rank"
        );
    }
}

async fn connect_right(addr: SocketAddr, my_rank: usize) -> std::io::Result<TcpStream> {
    loop {
        match TcpStream::connect(addr).await {
            Ok(mut stream) => {
                stream.set_nodelay(true)?;
                stream.write_all(&(my_rank as u32).to_be_bytes()).await?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::trace!(addr = %addr, error = %e, "Right neighbour not ready, retrying");
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
        }
    }
}

#[async_trait]
impl RingTransport for TcpRing {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn send_right(&mut self, message: TensorMessage) -> Result<()> {
        self.right.send(message).await.map_err(|_| {
            TrainerError::Network(format!(
                "Connection to rank {} closed",
                (self.rank + 1) % self.size
            ))
        })
    }

    async fn recv_left(&mut self) -> Result<TensorMessage> {
        self.left.recv().await.ok_or_else(|| {
            TrainerError::Network(format!(
                "Connection from rank {} closed",
                (self.rank + self.size - 1) % self.size
            ))
        })
    }
}
