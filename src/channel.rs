//! Unreliable channel shim.
//!
//! Wraps the UDP socket with injectable loss, duplication, corruption and
//! reordering, all driven by one per-connection seeded RNG so that test runs
//! are reproducible. Every frame emitted by the upper layers goes through
//! [`FaultyChannel::send`]; bypassing it is a bug. Faults are injected on
//! the emit path only -- the peer's shim covers the opposite direction, and
//! the receive side is a pass-through.

use std::net::SocketAddr;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::{ToSocketAddrs, UdpSocket};

use crate::error::{Result, TautError};
use crate::frame::Frame;

/// Emit-path counters, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    /// Datagrams actually written to the socket.
    pub sent: u64,
    /// Frames silently dropped by loss injection.
    pub dropped: u64,
    /// Frames emitted with a deliberately bad checksum.
    pub corrupted: u64,
    /// Extra copies emitted by duplication injection.
    pub duplicated: u64,
}

pub struct FaultyChannel {
    socket: UdpSocket,
    rng: StdRng,
    loss_rate: f64,
    dup_rate: f64,
    corrupt_rate: f64,
    /// Number of datagrams to stash before flushing them in reverse order.
    /// Zero disables reordering.
    reorder_depth: usize,
    stash: Vec<(Bytes, SocketAddr)>,
    stats: ChannelStats,
}

impl FaultyChannel {
    /// Bind the underlying UDP socket.
    pub async fn bind(addr: impl ToSocketAddrs, seed: Option<u64>) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(TautError::BindFailed)?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            socket,
            rng,
            loss_rate: 0.0,
            dup_rate: 0.0,
            corrupt_rate: 0.0,
            reorder_depth: 0,
            stash: Vec::new(),
            stats: ChannelStats::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn set_loss_rate(&mut self, p: f64) {
        self.loss_rate = p.clamp(0.0, 1.0);
    }

    pub fn set_dup_rate(&mut self, p: f64) {
        self.dup_rate = p.clamp(0.0, 1.0);
    }

    pub fn set_corrupt_rate(&mut self, p: f64) {
        self.corrupt_rate = p.clamp(0.0, 1.0);
    }

    /// Stash this many datagrams, then flush them in reverse order. Zero
    /// disables reordering; a pending stash drains on the next send.
    pub fn set_reorder_depth(&mut self, depth: usize) {
        self.reorder_depth = depth;
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Draw an initial sequence number from the connection's RNG.
    pub fn draw_initial_seq(&mut self, seq_space: u64) -> u32 {
        self.rng.random_range(0..seq_space) as u32
    }

    /// Emit one frame toward `peer`, subject to the configured fault model.
    pub async fn send(&mut self, frame: &Frame, peer: SocketAddr) -> Result<()> {
        if self.loss_rate > 0.0 && self.rng.random_bool(self.loss_rate) {
            self.stats.dropped += 1;
            tracing::debug!(seq = frame.seq, flags = %frame.flags, "loss injection: frame dropped");
            return Ok(());
        }
        let datagram = if self.corrupt_rate > 0.0 && self.rng.random_bool(self.corrupt_rate) {
            self.stats.corrupted += 1;
            tracing::debug!(seq = frame.seq, flags = %frame.flags, "corruption injection: bad checksum");
            frame.encode_corrupted(self.rng.random())?
        } else {
            frame.encode()?
        };
        let duplicate = self.dup_rate > 0.0 && self.rng.random_bool(self.dup_rate);
        self.emit(datagram.clone(), peer).await?;
        if duplicate {
            self.stats.duplicated += 1;
            tracing::debug!(seq = frame.seq, flags = %frame.flags, "duplication injection");
            self.emit(datagram, peer).await?;
        }
        Ok(())
    }

    async fn emit(&mut self, datagram: Bytes, peer: SocketAddr) -> Result<()> {
        if self.reorder_depth > 0 {
            self.stash.push((datagram, peer));
            if self.stash.len() >= self.reorder_depth {
                self.flush_reversed().await?;
            }
            return Ok(());
        }
        if !self.stash.is_empty() {
            self.flush_reversed().await?;
        }
        self.write(&datagram, peer).await
    }

    async fn flush_reversed(&mut self) -> Result<()> {
        let stash = std::mem::take(&mut self.stash);
        for (datagram, peer) in stash.into_iter().rev() {
            self.write(&datagram, peer).await?;
        }
        Ok(())
    }

    async fn write(&mut self, datagram: &[u8], peer: SocketAddr) -> Result<()> {
        self.socket.send_to(datagram, peer).await?;
        self.stats.sent += 1;
        Ok(())
    }

    /// Receive one datagram. Pass-through: faults are injected on emit only.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }
}
