//! Sliding-window send engine.
//!
//! Pure logic, no I/O: the endpoint loop owns the socket and asks this
//! window which frames are due for (re)transmission on each tick.
//! Acknowledgements are cumulative under the modular half-window rule.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{Result, TautError};
use crate::frame::{Frame, PAYLOAD_MAX};
use crate::seq;

struct InFlight {
    frame: Frame,
    /// Unset until the first transmission.
    last_tx: Option<Instant>,
    /// Transmissions so far.
    retries: u32,
}

pub struct SendWindow {
    window: u64,
    seq_space: u64,
    retx_timeout: Duration,
    max_retries: u32,
    /// Earliest unacknowledged sequence number.
    base: u32,
    /// Next sequence number to allocate.
    next_seq: u32,
    /// Ordered by sequence number; allocation is window-gated, so entries
    /// always lie within `[base, base + window)`.
    unacked: BTreeMap<u32, InFlight>,
}

impl SendWindow {
    pub fn new(
        initial_seq: u32,
        window: u64,
        seq_space: u64,
        retx_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            window,
            seq_space,
            retx_timeout,
            max_retries,
            base: initial_seq,
            next_seq: initial_seq,
            unacked: BTreeMap::new(),
        }
    }

    /// Segment a prefix of `data` into DATA frames, allocating only while
    /// the window has room, and queue them. Returns the number of bytes
    /// consumed and whether the whole slice (plus the FIN marker, when
    /// `fin`) was queued; callers re-feed the remainder once
    /// acknowledgements free window space.
    ///
    /// Gating allocation at the window keeps every live sequence number
    /// inside `[base, base + window)`, so numbers cannot collide even when
    /// a long message laps the sequence space.
    ///
    /// The segment carrying the final byte is marked `DATA|FIN` when `fin`
    /// is set; an empty `data` with `fin` queues one empty `DATA|FIN`
    /// segment.
    pub fn enqueue(&mut self, data: &[u8], fin: bool) -> (usize, bool) {
        let mut offset = 0;
        loop {
            if self.unacked.len() as u64 >= self.window {
                return (offset, false);
            }
            let end = (offset + PAYLOAD_MAX).min(data.len());
            let payload = Bytes::copy_from_slice(&data[offset..end]);
            let last = end == data.len();
            let frame = if fin && last {
                Frame::data_fin(self.next_seq, payload)
            } else {
                Frame::data(self.next_seq, payload)
            };
            self.unacked.insert(
                self.next_seq,
                InFlight {
                    frame,
                    last_tx: None,
                    retries: 0,
                },
            );
            self.next_seq = seq::next(self.next_seq, self.seq_space);
            offset = end;
            if last {
                return (offset, true);
            }
        }
    }

    /// Frames due for (re)transmission at `now`: every in-window entry whose
    /// timer is unset or expired. Stamps timers and bumps retry counters.
    /// Fails once any entry would exceed `max_retries` transmissions.
    pub fn due(&mut self, now: Instant) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        for offset in 0..self.window {
            let s = seq::add(self.base, offset, self.seq_space);
            let Some(entry) = self.unacked.get_mut(&s) else {
                continue;
            };
            let expired = match entry.last_tx {
                None => true,
                Some(t) => now.duration_since(t) >= self.retx_timeout,
            };
            if !expired {
                continue;
            }
            if entry.retries >= self.max_retries {
                return Err(TautError::DeliveryFailed {
                    seq: s,
                    retries: entry.retries,
                });
            }
            entry.retries += 1;
            entry.last_tx = Some(now);
            if entry.retries > 1 {
                tracing::debug!(seq = s, attempt = entry.retries, "retransmitting segment");
            }
            frames.push(entry.frame.clone());
        }
        Ok(frames)
    }

    /// Apply a cumulative acknowledgement: every sequence number covered by
    /// `ack_num` under the half-window rule is released. Returns how many
    /// segments were newly acknowledged.
    pub fn on_ack(&mut self, ack_num: u32) -> usize {
        let before = self.unacked.len();
        let (window, space) = (self.window, self.seq_space);
        self.unacked
            .retain(|&s, _| !seq::acked(ack_num, s, window, space));
        let freed = before - self.unacked.len();
        if freed > 0 {
            // The base advances monotonically: a stale ack frees nothing.
            self.base = ack_num;
        }
        freed
    }

    pub fn is_empty(&self) -> bool {
        self.unacked.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.unacked.len()
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn base(&self) -> u32 {
        self.base
    }
}
