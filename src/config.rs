//! Per-connection configuration.
//!
//! Every tunable is carried by the connection that uses it; there are no
//! process-wide defaults and no ambient globals.

use std::time::Duration;

use crate::error::{Result, TautError};

/// Configuration for one endpoint / connection.
#[derive(Debug, Clone)]
pub struct Config {
    /// Retransmission timeout for DATA frames; also the receive-loop tick.
    pub timeout: Duration,
    /// Retransmission timeout for handshake and teardown frames.
    pub handshake_timeout: Duration,
    /// Maximum transmissions per frame before the connection is torn down.
    pub max_retries: u32,
    /// Sliding window size W, in frames.
    pub window_size: usize,
    /// Sequence space S. Modular comparisons require `window_size <= S / 2`.
    /// Production uses 2^32; small spaces (e.g. 256) are fine for tests.
    pub seq_space: u64,
    /// Probability that the channel shim silently drops an outgoing frame.
    pub loss_rate: f64,
    /// Probability that the shim emits an outgoing frame twice.
    pub dup_rate: f64,
    /// Probability that the shim emits an outgoing frame with a bad checksum.
    pub corrupt_rate: f64,
    /// Seed for the per-connection RNG. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(3),
            max_retries: 10,
            window_size: 5,
            seq_space: 1 << 32,
            loss_rate: 0.0,
            dup_rate: 0.0,
            corrupt_rate: 0.0,
            rng_seed: None,
        }
    }
}

impl Config {
    /// How long teardown waits for the peer before forcing CLOSED.
    pub fn linger(&self) -> Duration {
        self.timeout * 2
    }

    /// Validate the invariants the sequence arithmetic relies on.
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(TautError::InvalidConfig(
                "window_size must be at least 1".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(TautError::InvalidConfig(
                "max_retries must be at least 1".into(),
            ));
        }
        if self.seq_space < 2 || self.seq_space > 1 << 32 {
            return Err(TautError::InvalidConfig(format!(
                "seq_space {} outside supported range [2, 2^32]",
                self.seq_space
            )));
        }
        // The half-window rule is only unambiguous when W <= S/2.
        if self.window_size as u64 > self.seq_space / 2 {
            return Err(TautError::InvalidConfig(format!(
                "window_size {} exceeds half the sequence space {}",
                self.window_size, self.seq_space
            )));
        }
        for (name, rate) in [
            ("loss_rate", self.loss_rate),
            ("dup_rate", self.dup_rate),
            ("corrupt_rate", self.corrupt_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(TautError::InvalidConfig(format!(
                    "{name} {rate} outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}
