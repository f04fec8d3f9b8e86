//! Reorder-buffer receive engine.
//!
//! Pure logic, no I/O. Out-of-order segments are buffered (bounded by the
//! window) and delivered in order; every observed DATA frame produces a
//! cumulative acknowledgement, including out-of-window duplicates, which
//! unblocks a peer whose earlier acknowledgement was lost.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

use crate::seq;

pub struct RecvWindow {
    window: u64,
    seq_space: u64,
    /// Next sequence number to deliver in order.
    expected: u32,
    reorder: BTreeMap<u32, Bytes>,
    /// In-order payloads ready for the application.
    ready: VecDeque<Bytes>,
    /// Sequence number of the frame that carried FIN, once buffered.
    fin_seq: Option<u32>,
    /// Set once delivery has advanced past the FIN.
    fin_reached: bool,
}

impl RecvWindow {
    pub fn new(initial_seq: u32, window: u64, seq_space: u64) -> Self {
        Self {
            window,
            seq_space,
            expected: initial_seq,
            reorder: BTreeMap::new(),
            ready: VecDeque::new(),
            fin_seq: None,
            fin_reached: false,
        }
    }

    /// Process an inbound DATA frame. Returns the acknowledgement number to
    /// emit -- always, whether the frame was inside the window or not.
    pub fn on_data(&mut self, s: u32, payload: Bytes, fin: bool) -> u32 {
        if seq::in_window(self.expected, s, self.window, self.seq_space) {
            self.reorder.entry(s).or_insert(payload);
            if fin {
                self.fin_seq = Some(s);
            }
            self.drain();
        } else {
            tracing::debug!(
                seq = s,
                expected = self.expected,
                "out-of-window segment re-acked"
            );
        }
        self.expected
    }

    fn drain(&mut self) {
        while let Some(payload) = self.reorder.remove(&self.expected) {
            let was_fin = self.fin_seq == Some(self.expected);
            self.ready.push_back(payload);
            self.expected = seq::next(self.expected, self.seq_space);
            if was_fin {
                self.fin_reached = true;
                break;
            }
        }
    }

    /// Pop the next in-order payload unit. Empty control payloads (a bare
    /// `DATA|FIN`) carry no application bytes and are skipped.
    pub fn pop(&mut self) -> Option<Bytes> {
        while let Some(payload) = self.ready.pop_front() {
            if !payload.is_empty() {
                return Some(payload);
            }
        }
        None
    }

    /// End of stream: the FIN was consumed and everything before it popped.
    pub fn eof(&self) -> bool {
        self.fin_reached && self.ready.iter().all(|p| p.is_empty())
    }

    /// Whether a FIN-bearing segment has been buffered.
    pub fn fin_seen(&self) -> bool {
        self.fin_seq.is_some()
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected
    }

    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }
}
