//! Endpoint façade.
//!
//! Composes the channel shim, the connection state machine and the two
//! window engines into a byte-stream API. Each operation runs a single
//! cooperative loop: the only suspension point is the timed socket read,
//! and a read timeout doubles as the retransmission timer tick.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::ToSocketAddrs;
use tokio::time::timeout;

use crate::channel::{ChannelStats, FaultyChannel};
use crate::config::Config;
use crate::connection::{Connection, State};
use crate::error::{Result, TautError};
use crate::frame::{Frame, MTU};
use crate::receiver::RecvWindow;
use crate::sender::SendWindow;
use crate::seq;

pub struct Endpoint {
    config: Config,
    channel: FaultyChannel,
    conn: Connection,
    /// Created once the handshake fixes the sequence bases.
    send_win: Option<SendWindow>,
    recv_win: Option<RecvWindow>,
}

impl Endpoint {
    /// Bind the underlying UDP socket.
    pub async fn bind(addr: impl ToSocketAddrs, config: Config) -> Result<Self> {
        config.validate()?;
        let mut channel = FaultyChannel::bind(addr, config.rng_seed).await?;
        channel.set_loss_rate(config.loss_rate);
        channel.set_dup_rate(config.dup_rate);
        channel.set_corrupt_rate(config.corrupt_rate);
        Ok(Self {
            conn: Connection::new(config.seq_space),
            config,
            channel,
            send_win: None,
            recv_win: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.channel.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer()
    }

    pub fn state(&self) -> State {
        self.conn.state()
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    pub fn set_loss_rate(&mut self, p: f64) {
        self.channel.set_loss_rate(p);
    }

    pub fn set_dup_rate(&mut self, p: f64) {
        self.channel.set_dup_rate(p);
    }

    pub fn set_corrupt_rate(&mut self, p: f64) {
        self.channel.set_corrupt_rate(p);
    }

    pub fn set_reorder_depth(&mut self, depth: usize) {
        self.channel.set_reorder_depth(depth);
    }

    /// Run the initiator handshake against `peer`.
    pub async fn connect(&mut self, peer: SocketAddr) -> Result<()> {
        let res = self.connect_inner(peer).await;
        if res.is_err() {
            self.conn.force_closed();
        }
        res
    }

    /// Run the responder handshake on the bound socket.
    pub async fn accept(&mut self) -> Result<()> {
        let res = self.accept_inner().await;
        if res.is_err() {
            self.conn.force_closed();
        }
        res
    }

    /// Reliable, ordered delivery of `data`. Blocks until every segment is
    /// acknowledged; retry exhaustion fails with `DeliveryFailed` and closes
    /// the connection.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.transfer(data, false).await
    }

    /// Send the final payload: the last segment carries `DATA|FIN`, after
    /// which the connection is torn down.
    pub async fn send_final(&mut self, data: &[u8]) -> Result<()> {
        self.transfer(data, true).await?;
        // The FIN went out with the data and is acknowledged; wait out the
        // peer's half of the teardown.
        self.conn.begin_close();
        self.await_peer_close().await
    }

    /// Return the next in-order payload unit, or `None` once the peer has
    /// closed its half of the stream.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        let deadline = Instant::now() + self.config.timeout * self.config.max_retries;
        loop {
            if let Some(win) = self.recv_win.as_mut() {
                if let Some(payload) = win.pop() {
                    return Ok(Some(payload));
                }
                if win.eof() {
                    return Ok(None);
                }
            }
            match self.conn.state() {
                State::Established | State::FinWait => {}
                State::CloseWait => return Ok(None),
                _ => return Err(TautError::ConnectionClosed),
            }
            let Some((frame, from)) = self.recv_frame_until(deadline).await? else {
                return Err(TautError::TimedOut);
            };
            if !self.conn.is_peer(from) {
                tracing::warn!(%from, "datagram from unbound peer dropped");
                continue;
            }
            let res = self.dispatch(frame).await;
            if let Err(e) = &res {
                if matches!(e, TautError::ProtocolViolation(_)) {
                    tracing::warn!(error = %e, "closing connection");
                    self.conn.force_closed();
                }
            }
            res?;
        }
    }

    /// Initiate teardown. Idempotent; always drives the state to `CLOSED`.
    pub async fn close(&mut self) -> Result<()> {
        match self.conn.state() {
            State::Closed => Ok(()),
            State::Listen | State::SynSent | State::SynReceived => {
                self.conn.force_closed();
                Ok(())
            }
            State::Established | State::FinWait => {
                let fin = Frame::fin(self.send_seq());
                self.conn.begin_close();
                self.teardown_initiator(fin).await
            }
            State::CloseWait => self.teardown_responder().await,
        }
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    async fn connect_inner(&mut self, peer: SocketAddr) -> Result<()> {
        let iss = self.channel.draw_initial_seq(self.config.seq_space);
        let syn = self.conn.connect_start(iss, peer)?;
        let mut attempts = 0;
        while attempts < self.config.max_retries {
            self.channel.send(&syn, peer).await?;
            attempts += 1;
            let deadline = Instant::now() + self.config.handshake_timeout;
            while let Some((frame, from)) = self.recv_frame_until(deadline).await? {
                if from != peer {
                    tracing::warn!(%from, "handshake datagram from unexpected peer dropped");
                    continue;
                }
                if frame.is_syn() && frame.is_ack() {
                    let ack = match self.conn.on_syn_ack(&frame) {
                        Ok(ack) => ack,
                        Err(e) => {
                            tracing::warn!(error = %e, "refusing SYN|ACK");
                            return Err(TautError::HandshakeFailed { attempts });
                        }
                    };
                    self.channel.send(&ack, peer).await?;
                    self.open_windows();
                    tracing::debug!(%peer, "connection established");
                    return Ok(());
                }
                tracing::debug!(flags = %frame.flags, "ignoring frame during handshake");
            }
        }
        Err(TautError::HandshakeFailed { attempts })
    }

    async fn accept_inner(&mut self) -> Result<()> {
        let iss = self.channel.draw_initial_seq(self.config.seq_space);
        self.conn.listen(iss)?;

        // Wait for a SYN; bounded like every blocking operation.
        let syn_deadline =
            Instant::now() + self.config.handshake_timeout * self.config.max_retries;
        let (syn_ack, peer) = loop {
            match self.recv_frame_until(syn_deadline).await? {
                None => return Err(TautError::HandshakeFailed { attempts: 0 }),
                Some((frame, from)) if frame.is_syn() && !frame.is_ack() => {
                    break (self.conn.on_syn(&frame, from)?, from);
                }
                Some((frame, from)) => {
                    tracing::debug!(%from, flags = %frame.flags, "ignoring frame while listening");
                }
            }
        };

        // Answer with SYN|ACK until the completing ACK arrives.
        let mut attempts = 0;
        while attempts < self.config.max_retries {
            self.channel.send(&syn_ack, peer).await?;
            attempts += 1;
            let deadline = Instant::now() + self.config.handshake_timeout;
            while let Some((frame, from)) = self.recv_frame_until(deadline).await? {
                if !self.conn.is_peer(from) {
                    tracing::warn!(%from, "handshake datagram from unexpected peer dropped");
                    continue;
                }
                if frame.is_syn() && !frame.is_ack() {
                    // Duplicate SYN: our SYN|ACK was lost.
                    self.channel.send(&syn_ack, peer).await?;
                    continue;
                }
                if frame.is_data() {
                    // The completing ACK was lost but the initiator is
                    // clearly established; recover instead of stalling.
                    self.conn.establish_implicit();
                    self.open_windows();
                    self.handle_data(frame).await?;
                    tracing::debug!(%peer, "connection established (implicit)");
                    return Ok(());
                }
                if frame.is_ack() && !frame.is_syn() && !frame.is_fin() {
                    if let Err(e) = self.conn.on_handshake_ack(&frame) {
                        tracing::warn!(error = %e, "refusing handshake ACK");
                        return Err(TautError::HandshakeFailed { attempts });
                    }
                    self.open_windows();
                    tracing::debug!(%peer, "connection established");
                    return Ok(());
                }
            }
        }
        Err(TautError::HandshakeFailed { attempts })
    }

    fn open_windows(&mut self) {
        self.send_win = Some(SendWindow::new(
            self.conn.send_next(),
            self.config.window_size as u64,
            self.config.seq_space,
            self.config.timeout,
            self.config.max_retries,
        ));
        self.recv_win = Some(RecvWindow::new(
            self.conn.recv_next(),
            self.config.window_size as u64,
            self.config.seq_space,
        ));
    }

    // ------------------------------------------------------------------
    // Data transfer
    // ------------------------------------------------------------------

    async fn transfer(&mut self, data: &[u8], fin: bool) -> Result<()> {
        match self.conn.state() {
            // CLOSE_WAIT stays open for local sends until local close().
            State::Established | State::CloseWait => {}
            _ => return Err(TautError::ConnectionClosed),
        }
        if data.is_empty() && !fin {
            return Ok(());
        }
        let res = self.transfer_inner(data, fin).await;
        if let Err(e) = &res {
            if matches!(
                e,
                TautError::DeliveryFailed { .. } | TautError::ProtocolViolation(_)
            ) {
                tracing::warn!(error = %e, "send failed; closing connection");
                self.conn.force_closed();
            }
        }
        res
    }

    async fn transfer_inner(&mut self, data: &[u8], fin: bool) -> Result<()> {
        let peer = self.peer()?;
        tracing::trace!(bytes = data.len(), fin, "payload submitted");
        let mut offset = 0;
        let mut queued_all = false;
        loop {
            if !queued_all {
                // Allocation is window-gated: top up from the remainder of
                // the payload as acknowledgements free space.
                let (consumed, done) = self.send_win_mut()?.enqueue(&data[offset..], fin);
                offset += consumed;
                queued_all = done;
            }
            let due = self.send_win_mut()?.due(Instant::now())?;
            for frame in &due {
                self.channel.send(frame, peer).await?;
            }
            if queued_all && self.send_win_mut()?.is_empty() {
                return Ok(());
            }
            let deadline = Instant::now() + self.config.timeout;
            if let Some((frame, from)) = self.recv_frame_until(deadline).await? {
                if self.conn.is_peer(from) {
                    self.dispatch(frame).await?;
                } else {
                    tracing::warn!(%from, "datagram from unbound peer dropped");
                }
            }
        }
    }

    /// Shared inbound handler for the established phase.
    async fn dispatch(&mut self, frame: Frame) -> Result<()> {
        let peer = self.peer()?;
        if frame.is_syn() {
            // A handshake frame here means our completing ACK was lost.
            let answer = if frame.is_ack() {
                self.conn.on_syn_ack(&frame)?
            } else {
                self.conn.on_syn(&frame, peer)?
            };
            return self.channel.send(&answer, peer).await;
        }
        if frame.is_data() {
            return self.handle_data(frame).await;
        }
        if frame.is_fin() {
            let local_seq = self.send_seq();
            let answer = if frame.is_ack() {
                self.conn.on_fin_ack(&frame, local_seq)
            } else {
                self.conn.on_fin(&frame, local_seq)
            };
            if let Some(answer) = answer {
                return self.channel.send(&answer, peer).await;
            }
            return Ok(());
        }
        if frame.is_ack() {
            if let Some(win) = self.send_win.as_mut() {
                let freed = win.on_ack(frame.ack);
                if freed > 0 {
                    tracing::trace!(ack = frame.ack, freed, "window advanced");
                }
            }
            return Ok(());
        }
        tracing::warn!(seq = frame.seq, flags = %frame.flags, "frame with no actionable flags dropped");
        Ok(())
    }

    /// Buffer an inbound DATA segment and acknowledge it -- in-window or not.
    async fn handle_data(&mut self, frame: Frame) -> Result<()> {
        let peer = self.peer()?;
        let seq_num = frame.seq;
        let fin = frame.is_fin();
        let win = self.recv_win.as_mut().ok_or(TautError::ConnectionClosed)?;
        let ack_num = win.on_data(seq_num, frame.payload, fin);
        if fin {
            self.conn.on_peer_fin_data(seq_num);
        }
        let ack = Frame::ack(self.send_seq(), ack_num);
        self.channel.send(&ack, peer).await
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Our side sent the FIN: retransmit it until acknowledged, then wait
    /// (bounded by linger) for the peer's FIN|ACK and answer it.
    async fn teardown_initiator(&mut self, fin: Frame) -> Result<()> {
        let peer = self.peer()?;
        let fin_ack_num = seq::next(fin.seq, self.config.seq_space);
        let mut fin_acked = false;
        let mut attempts = 0;
        let linger_deadline = Instant::now() + self.config.linger();
        'retry: while Instant::now() < linger_deadline {
            if !fin_acked {
                if attempts >= self.config.max_retries {
                    break;
                }
                self.channel.send(&fin, peer).await?;
                attempts += 1;
            }
            let tick = if fin_acked {
                linger_deadline
            } else {
                (Instant::now() + self.config.handshake_timeout).min(linger_deadline)
            };
            while let Some((frame, from)) = self.recv_frame_until(tick).await? {
                if !self.conn.is_peer(from) {
                    continue;
                }
                if frame.is_fin() && frame.is_ack() {
                    if let Some(answer) = self.conn.on_fin_ack(&frame, fin.seq) {
                        self.channel.send(&answer, peer).await?;
                    }
                    return Ok(());
                }
                if frame.is_fin() {
                    // Simultaneous close: our FIN and theirs crossed.
                    if let Some(answer) = self.conn.on_fin(&frame, fin.seq) {
                        self.channel.send(&answer, peer).await?;
                    }
                    continue;
                }
                if frame.is_ack() && !frame.is_data() && frame.ack == fin_ack_num {
                    fin_acked = true;
                    continue 'retry;
                }
                if frame.is_data() {
                    // The peer may still be draining its own send.
                    self.handle_data(frame).await?;
                }
            }
        }
        tracing::debug!("teardown wait expired; forcing CLOSED");
        self.conn.force_closed();
        Ok(())
    }

    /// Peer closed first: emit our FIN|ACK from CLOSE_WAIT until the final
    /// ACK arrives or the linger bound expires.
    async fn teardown_responder(&mut self) -> Result<()> {
        let peer = self.peer()?;
        let local_seq = self.send_seq();
        let ack_num = match self.conn.peer_fin_seq() {
            Some(fin_seq) => seq::next(fin_seq, self.config.seq_space),
            None => self.recv_expected(),
        };
        let fin_ack = Frame::fin_ack(local_seq, ack_num);
        let expected_final = seq::next(local_seq, self.config.seq_space);
        let mut attempts = 0;
        let linger_deadline = Instant::now() + self.config.linger();
        while Instant::now() < linger_deadline && attempts < self.config.max_retries {
            self.channel.send(&fin_ack, peer).await?;
            attempts += 1;
            let tick = (Instant::now() + self.config.handshake_timeout).min(linger_deadline);
            while let Some((frame, from)) = self.recv_frame_until(tick).await? {
                if !self.conn.is_peer(from) {
                    continue;
                }
                if frame.is_ack() && !frame.is_data() && !frame.is_fin() && frame.ack == expected_final
                {
                    self.conn.on_final_ack();
                    return Ok(());
                }
                if frame.is_fin() && !frame.is_ack() {
                    // Duplicate FIN: our FIN|ACK was lost, resend it.
                    break;
                }
            }
        }
        tracing::debug!("teardown wait expired; forcing CLOSED");
        self.conn.force_closed();
        Ok(())
    }

    /// After `send_final`: the FIN was delivered with the data. Wait for the
    /// peer's own FIN|ACK, bounded by linger.
    async fn await_peer_close(&mut self) -> Result<()> {
        let peer = self.peer()?;
        let deadline = Instant::now() + self.config.linger();
        while let Some((frame, from)) = self.recv_frame_until(deadline).await? {
            if !self.conn.is_peer(from) {
                continue;
            }
            if frame.is_fin() {
                let local_seq = self.send_seq();
                let answer = if frame.is_ack() {
                    self.conn.on_fin_ack(&frame, local_seq)
                } else {
                    self.conn.on_fin(&frame, local_seq)
                };
                if let Some(answer) = answer {
                    self.channel.send(&answer, peer).await?;
                }
                if self.conn.state() == State::Closed {
                    return Ok(());
                }
            } else if frame.is_data() {
                self.handle_data(frame).await?;
            }
        }
        self.conn.force_closed();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    /// Receive the next verified frame, or `None` once `deadline` passes.
    /// Corrupted datagrams are dropped here and never ACKed.
    async fn recv_frame_until(
        &mut self,
        deadline: Instant,
    ) -> Result<Option<(Frame, SocketAddr)>> {
        let mut buf = [0u8; MTU];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match timeout(remaining, self.channel.recv(&mut buf)).await {
                Err(_elapsed) => return Ok(None),
                Ok(Err(e)) => return Err(e),
                Ok(Ok((len, from))) => match Frame::decode(&buf[..len]) {
                    Ok(frame) => return Ok(Some((frame, from))),
                    Err(e) if e.is_corruption() => {
                        tracing::debug!(%from, error = %e, "dropping corrupted datagram");
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }

    fn peer(&self) -> Result<SocketAddr> {
        self.conn.peer().ok_or(TautError::ConnectionClosed)
    }

    fn send_win_mut(&mut self) -> Result<&mut SendWindow> {
        self.send_win.as_mut().ok_or(TautError::ConnectionClosed)
    }

    /// The sequence field to stamp on outgoing control frames.
    fn send_seq(&self) -> u32 {
        self.send_win
            .as_ref()
            .map(|w| w.next_seq())
            .unwrap_or_else(|| self.conn.send_next())
    }

    fn recv_expected(&self) -> u32 {
        self.recv_win
            .as_ref()
            .map(|w| w.expected_seq())
            .unwrap_or_else(|| self.conn.recv_next())
    }
}
