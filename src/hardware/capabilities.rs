//! Hardware Transport Capabilities
//!
//! Small async traits at the boundary between the acquisition core and the physical
//! connections. The core only depends on these contracts, so every instrument can be
//! substituted by a simulated one in tests (see [`crate::hardware::mock`]).
//!
//! - [`LineTransport`]: one ASCII request/response serial line (modulator, monochromator)
//! - [`LockinApi`]: the lock-in settings API plus its subscribe/poll demodulator stream
//! - [`ScopeStream`]: the lock-in oscilloscope module used by the safety monitor
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Takes `&mut self`: a session is owned by exactly one lock, so exchanges never interleave
//! - Uses anyhow::Result for errors; typed errors start one layer up, in the sessions
//! - Focuses on ONE thing

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

// =============================================================================
// Serial line
// =============================================================================

/// Capability: line-oriented request/response exchange
///
/// # Contract
/// - `query` writes `command` followed by the write terminator and returns one reply
///   line with the read terminator stripped
/// - A transport-level failure (timeout, I/O error) is an `Err`, never an empty reply
#[async_trait]
pub trait LineTransport: Send {
    /// Send a command and read one reply line
    async fn query(&mut self, command: &str) -> Result<String>;

    /// Human-readable resource name for logs (e.g. the port path)
    fn describe(&self) -> String;

    /// Release the connection
    async fn close(&mut self) -> Result<()>;
}

// =============================================================================
// Lock-in amplifier
// =============================================================================

/// Samples of one demodulator delivered by a single poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemodChunk {
    /// Device clock ticks, strictly increasing within a stream
    pub timestamps: Vec<u64>,
    /// In-phase components
    pub x: Vec<f64>,
    /// Quadrature components
    pub y: Vec<f64>,
}

impl DemodChunk {
    pub fn len(&self) -> usize {
        self.timestamps.len().min(self.x.len()).min(self.y.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capability: lock-in settings and demodulator stream
///
/// Node paths are device-relative (`/dev3902/demods/0/sample`).
///
/// # Contract
/// - Settings calls take effect on the device after `sync`
/// - `poll` blocks for about `duration` and returns the data of every subscribed path
///   that produced samples in that slice; a path absent from the map produced nothing
#[async_trait]
pub trait LockinApi: Send {
    async fn set_double(&mut self, path: &str, value: f64) -> Result<()>;

    async fn set_int(&mut self, path: &str, value: i64) -> Result<()>;

    async fn get_double(&mut self, path: &str) -> Result<f64>;

    /// Wait until all previous settings have been applied by the device
    async fn sync(&mut self) -> Result<()>;

    async fn subscribe(&mut self, path: &str) -> Result<()>;

    async fn unsubscribe_all(&mut self) -> Result<()>;

    /// Force every subscribed node to send data in the next poll, changed or not
    async fn get_as_event(&mut self, path: &str) -> Result<()>;

    /// Collect data for `duration`
    async fn poll(&mut self, duration: Duration) -> Result<HashMap<String, DemodChunk>>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// Capability: oscilloscope trace stream
#[async_trait]
pub trait ScopeStream: Send {
    /// Arm the scope and clear its history
    async fn start(&mut self) -> Result<()>;

    /// Most recent voltage trace, `None` if no complete trace arrived yet
    async fn read_trace(&mut self) -> Result<Option<Vec<f64>>>;

    async fn stop(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_length_is_shortest_column() {
        let chunk = DemodChunk {
            timestamps: vec![1, 2, 3],
            x: vec![0.1, 0.2, 0.3],
            y: vec![0.0, 0.0],
        };
        assert_eq!(chunk.len(), 2);
        assert!(!chunk.is_empty());
        assert!(DemodChunk::default().is_empty());
    }
}
