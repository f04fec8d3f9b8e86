//! Connection lifecycle state machine.
//!
//! Owns the phase, role, peer binding and the sequence bases agreed during
//! the handshake. Transitions are synchronous frame-in / frame-out steps;
//! the endpoint loop performs the socket I/O and retransmission timing.
//!
//! ```text
//! CLOSED -> LISTEN     -> SYN_RECEIVED -> ESTABLISHED   (responder)
//! CLOSED -> SYN_SENT   -> ESTABLISHED                   (initiator)
//! ESTABLISHED -> FIN_WAIT   -> CLOSED                   (local close)
//! ESTABLISHED -> CLOSE_WAIT -> CLOSED                   (peer close)
//! ```

use std::fmt;
use std::net::SocketAddr;

use crate::error::{Result, TautError};
use crate::frame::Frame;
use crate::seq;

/// Connection states. `Closed` is both the start and the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait,
    CloseWait,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN_SENT"),
            State::SynReceived => write!(f, "SYN_RECEIVED"),
            State::Established => write!(f, "ESTABLISHED"),
            State::FinWait => write!(f, "FIN_WAIT"),
            State::CloseWait => write!(f, "CLOSE_WAIT"),
        }
    }
}

/// Which side of the handshake this endpoint played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

pub struct Connection {
    state: State,
    role: Role,
    peer: Option<SocketAddr>,
    /// Local initial sequence number.
    iss: u32,
    /// First data sequence number we send (ISS + 1 once established).
    send_next: u32,
    /// First data sequence number expected from the peer.
    recv_next: u32,
    /// The peer's FIN sequence number, once observed.
    peer_fin_seq: Option<u32>,
    seq_space: u64,
}

impl Connection {
    pub fn new(seq_space: u64) -> Self {
        Self {
            state: State::Closed,
            role: Role::Initiator,
            peer: None,
            iss: 0,
            send_next: 0,
            recv_next: 0,
            peer_fin_seq: None,
            seq_space,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether `from` matches the bound peer address.
    pub fn is_peer(&self, from: SocketAddr) -> bool {
        self.peer == Some(from)
    }

    /// First data sequence number for the send window.
    pub fn send_next(&self) -> u32 {
        self.send_next
    }

    /// First data sequence number for the receive window.
    pub fn recv_next(&self) -> u32 {
        self.recv_next
    }

    pub fn peer_fin_seq(&self) -> Option<u32> {
        self.peer_fin_seq
    }

    /// Initiator: `CLOSED -> SYN_SENT`. Returns the SYN to transmit.
    pub fn connect_start(&mut self, iss: u32, peer: SocketAddr) -> Result<Frame> {
        match self.state {
            State::Closed => {
                self.role = Role::Initiator;
                self.peer = Some(peer);
                self.iss = iss;
                self.state = State::SynSent;
                Ok(Frame::syn(iss))
            }
            other => Err(TautError::ProtocolViolation(format!(
                "connect while {other}"
            ))),
        }
    }

    /// Responder: `CLOSED -> LISTEN`.
    pub fn listen(&mut self, iss: u32) -> Result<()> {
        match self.state {
            State::Closed => {
                self.role = Role::Responder;
                self.iss = iss;
                self.state = State::Listen;
                Ok(())
            }
            other => Err(TautError::ProtocolViolation(format!(
                "accept while {other}"
            ))),
        }
    }

    /// `LISTEN -> SYN_RECEIVED` on a SYN from `from`: binds the peer and
    /// returns the SYN|ACK. Duplicate SYNs are idempotently re-answered.
    pub fn on_syn(&mut self, frame: &Frame, from: SocketAddr) -> Result<Frame> {
        match self.state {
            State::Listen => {
                self.peer = Some(from);
                self.recv_next = seq::next(frame.seq, self.seq_space);
                self.state = State::SynReceived;
                Ok(Frame::syn_ack(self.iss, self.recv_next))
            }
            State::SynReceived | State::Established if self.is_peer(from) => {
                Ok(Frame::syn_ack(self.iss, self.recv_next))
            }
            other => Err(TautError::ProtocolViolation(format!("SYN while {other}"))),
        }
    }

    /// `SYN_SENT -> ESTABLISHED` on the SYN|ACK. Returns the completing ACK.
    /// In `ESTABLISHED` a duplicate SYN|ACK means our ACK was lost; it is
    /// re-answered with the original handshake values.
    pub fn on_syn_ack(&mut self, frame: &Frame) -> Result<Frame> {
        match self.state {
            State::SynSent => {
                let expected = seq::next(self.iss, self.seq_space);
                if frame.ack != expected {
                    return Err(TautError::ProtocolViolation(format!(
                        "SYN|ACK acknowledges {} but {} was expected",
                        frame.ack, expected
                    )));
                }
                self.send_next = expected;
                self.recv_next = seq::next(frame.seq, self.seq_space);
                self.state = State::Established;
                Ok(Frame::ack(self.send_next, self.recv_next))
            }
            State::Established | State::CloseWait | State::FinWait
                if self.role == Role::Initiator =>
            {
                Ok(Frame::ack(self.send_next, self.recv_next))
            }
            other => Err(TautError::ProtocolViolation(format!(
                "SYN|ACK while {other}"
            ))),
        }
    }

    /// `SYN_RECEIVED -> ESTABLISHED` on the completing ACK.
    pub fn on_handshake_ack(&mut self, frame: &Frame) -> Result<()> {
        match self.state {
            State::SynReceived => {
                let expected = seq::next(self.iss, self.seq_space);
                if frame.ack != expected {
                    return Err(TautError::ProtocolViolation(format!(
                        "handshake ACK acknowledges {} but {} was expected",
                        frame.ack, expected
                    )));
                }
                self.send_next = expected;
                self.state = State::Established;
                Ok(())
            }
            other => Err(TautError::ProtocolViolation(format!(
                "handshake ACK while {other}"
            ))),
        }
    }

    /// `SYN_RECEIVED -> ESTABLISHED` without the final ACK: an in-window
    /// DATA frame from the bound peer proves the initiator completed.
    pub fn establish_implicit(&mut self) {
        if self.state == State::SynReceived {
            self.send_next = seq::next(self.iss, self.seq_space);
            self.state = State::Established;
        }
    }

    /// Local close: `ESTABLISHED -> FIN_WAIT`.
    pub fn begin_close(&mut self) {
        if self.state == State::Established {
            self.state = State::FinWait;
        }
    }

    /// Peer FIN. Returns the answer to transmit: a plain ACK from
    /// `ESTABLISHED` (entering `CLOSE_WAIT`), a FIN|ACK from `FIN_WAIT`
    /// (simultaneous close), and an idempotent re-answer for duplicates.
    /// `local_seq` stamps the answer's sequence field.
    pub fn on_fin(&mut self, frame: &Frame, local_seq: u32) -> Option<Frame> {
        let fin_ack_num = seq::next(frame.seq, self.seq_space);
        match self.state {
            State::Established => {
                self.peer_fin_seq = Some(frame.seq);
                self.state = State::CloseWait;
                Some(Frame::ack(local_seq, fin_ack_num))
            }
            State::FinWait => {
                self.peer_fin_seq = Some(frame.seq);
                Some(Frame::fin_ack(local_seq, fin_ack_num))
            }
            State::CloseWait | State::Closed => Some(Frame::ack(local_seq, fin_ack_num)),
            _ => None,
        }
    }

    /// Peer FIN observed piggybacked on a DATA segment.
    pub fn on_peer_fin_data(&mut self, fin_seq: u32) {
        if self.state == State::Established {
            self.peer_fin_seq = Some(fin_seq);
            self.state = State::CloseWait;
        }
    }

    /// Peer FIN|ACK answering our FIN: `FIN_WAIT -> CLOSED`. Returns the
    /// final ACK to transmit. A FIN|ACK in `ESTABLISHED` carries a FIN we
    /// have not seen yet and is treated as one.
    pub fn on_fin_ack(&mut self, frame: &Frame, local_seq: u32) -> Option<Frame> {
        let fin_ack_num = seq::next(frame.seq, self.seq_space);
        match self.state {
            State::FinWait | State::Closed => {
                self.state = State::Closed;
                Some(Frame::ack(local_seq, fin_ack_num))
            }
            State::Established => {
                self.peer_fin_seq = Some(frame.seq);
                self.state = State::CloseWait;
                Some(Frame::ack(local_seq, fin_ack_num))
            }
            _ => None,
        }
    }

    /// The final teardown ACK answering our FIN|ACK: `CLOSE_WAIT -> CLOSED`.
    pub fn on_final_ack(&mut self) {
        if self.state == State::CloseWait {
            self.state = State::Closed;
        }
    }

    /// Forced transition to `CLOSED`: retry exhaustion, protocol violation,
    /// linger expiry, or abandoning a handshake.
    pub fn force_closed(&mut self) {
        self.state = State::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn initiator_handshake() {
        let mut conn = Connection::new(1 << 32);
        let syn = conn.connect_start(100, addr(9000)).unwrap();
        assert_eq!(conn.state(), State::SynSent);
        assert_eq!(conn.role(), Role::Initiator);
        assert_eq!(syn.seq, 100);
        assert!(syn.is_syn());

        let syn_ack = Frame::syn_ack(500, 101);
        let ack = conn.on_syn_ack(&syn_ack).unwrap();
        assert_eq!(conn.state(), State::Established);
        assert_eq!(ack.seq, 101);
        assert_eq!(ack.ack, 501);
        assert_eq!(conn.send_next(), 101);
        assert_eq!(conn.recv_next(), 501);
    }

    #[test]
    fn responder_handshake() {
        let mut conn = Connection::new(1 << 32);
        conn.listen(500).unwrap();
        assert_eq!(conn.state(), State::Listen);
        assert_eq!(conn.role(), Role::Responder);

        let syn = Frame::syn(100);
        let syn_ack = conn.on_syn(&syn, addr(9001)).unwrap();
        assert_eq!(conn.state(), State::SynReceived);
        assert_eq!(syn_ack.seq, 500);
        assert_eq!(syn_ack.ack, 101);
        assert!(conn.is_peer(addr(9001)));

        conn.on_handshake_ack(&Frame::ack(101, 501)).unwrap();
        assert_eq!(conn.state(), State::Established);
        assert_eq!(conn.send_next(), 501);
        assert_eq!(conn.recv_next(), 101);
    }

    #[test]
    fn duplicate_syn_is_reanswered() {
        let mut conn = Connection::new(1 << 32);
        conn.listen(500).unwrap();
        let first = conn.on_syn(&Frame::syn(100), addr(9002)).unwrap();
        let second = conn.on_syn(&Frame::syn(100), addr(9002)).unwrap();
        assert_eq!(first, second);
        assert_eq!(conn.state(), State::SynReceived);
    }

    #[test]
    fn syn_ack_with_wrong_ack_is_refused() {
        let mut conn = Connection::new(1 << 32);
        conn.connect_start(100, addr(9003)).unwrap();
        let err = conn.on_syn_ack(&Frame::syn_ack(500, 777)).unwrap_err();
        assert!(matches!(err, TautError::ProtocolViolation(_)));
    }

    #[test]
    fn implicit_establishment_from_data() {
        let mut conn = Connection::new(1 << 32);
        conn.listen(500).unwrap();
        conn.on_syn(&Frame::syn(100), addr(9004)).unwrap();
        conn.establish_implicit();
        assert_eq!(conn.state(), State::Established);
        assert_eq!(conn.send_next(), 501);
    }

    #[test]
    fn local_close_then_fin_ack() {
        let mut conn = Connection::new(1 << 32);
        conn.connect_start(100, addr(9005)).unwrap();
        conn.on_syn_ack(&Frame::syn_ack(500, 101)).unwrap();

        conn.begin_close();
        assert_eq!(conn.state(), State::FinWait);

        let final_ack = conn.on_fin_ack(&Frame::fin_ack(501, 102), 101).unwrap();
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(final_ack.ack, 502);
    }

    #[test]
    fn peer_close_enters_close_wait() {
        let mut conn = Connection::new(1 << 32);
        conn.connect_start(100, addr(9006)).unwrap();
        conn.on_syn_ack(&Frame::syn_ack(500, 101)).unwrap();

        let answer = conn.on_fin(&Frame::fin(501), 101).unwrap();
        assert_eq!(conn.state(), State::CloseWait);
        assert!(answer.is_ack());
        assert!(!answer.is_fin());
        assert_eq!(answer.ack, 502);
        assert_eq!(conn.peer_fin_seq(), Some(501));

        conn.on_final_ack();
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn simultaneous_close_answers_fin_with_fin_ack() {
        let mut conn = Connection::new(1 << 32);
        conn.connect_start(100, addr(9007)).unwrap();
        conn.on_syn_ack(&Frame::syn_ack(500, 101)).unwrap();
        conn.begin_close();

        // A bare FIN crossing ours while in FIN_WAIT.
        let answer = conn.on_fin(&Frame::fin(501), 101).unwrap();
        assert!(answer.is_fin() && answer.is_ack());
        assert_eq!(conn.state(), State::FinWait);

        // The peer's FIN|ACK converges us to CLOSED.
        conn.on_fin_ack(&Frame::fin_ack(501, 102), 101).unwrap();
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn duplicate_fin_is_reacked_after_close_wait() {
        let mut conn = Connection::new(1 << 32);
        conn.connect_start(100, addr(9008)).unwrap();
        conn.on_syn_ack(&Frame::syn_ack(500, 101)).unwrap();

        conn.on_fin(&Frame::fin(501), 101).unwrap();
        let again = conn.on_fin(&Frame::fin(501), 101).unwrap();
        assert_eq!(conn.state(), State::CloseWait);
        assert_eq!(again.ack, 502);
    }
}
