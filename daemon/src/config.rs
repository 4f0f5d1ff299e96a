//! Agent configuration
//!
//! Process-wide settings for one telemetry pipeline. Defaults match the
//! reference deployment: WebSocket on port 4000, 50 ms polling, probe on
//! `tcp_cleanup_rbuf`.

use crate::broadcast::OverflowPolicy;
use crate::loader::{ProbeObject, ProbeTarget, DEFAULT_PERF_PAGES};
use crate::registry::DEFAULT_QUEUE_CAPACITY;
use crate::types::ByteCountEncoding;
use anyhow::{bail, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tcprecv_common::constants::EVENTS_MAP;

/// Default listening port for subscribers
pub const DEFAULT_PORT: u16 = 4000;

/// Default interval between buffer polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default progress reporting interval
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Complete configuration of one pipeline
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Address the subscriber endpoint binds to
    pub listen: SocketAddr,
    /// Interval between polls of the kernel buffer
    pub poll_interval: Duration,
    /// Probe object, program and kernel symbol
    pub probe: ProbeTarget,
    /// Perf event map to read
    pub channel: String,
    /// Pages per CPU perf buffer
    pub perf_pages: usize,
    /// Queue capacity per subscriber
    pub subscriber_queue: usize,
    /// Full-queue behavior
    pub overflow: OverflowPolicy,
    /// JSON representation of the byte count
    pub byte_encoding: ByteCountEncoding,
    /// Progress log interval, `None` to disable
    pub progress_interval: Option<Duration>,
}

impl AgentConfig {
    /// Configuration with reference defaults for the given probe object
    pub fn new(object: ProbeObject) -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            poll_interval: DEFAULT_POLL_INTERVAL,
            probe: ProbeTarget::tcp_recv(object),
            channel: EVENTS_MAP.to_string(),
            perf_pages: DEFAULT_PERF_PAGES,
            subscriber_queue: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
            byte_encoding: ByteCountEncoding::default(),
            progress_interval: Some(DEFAULT_PROGRESS_INTERVAL),
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("Poll interval must be > 0");
        }
        if self.subscriber_queue == 0 {
            bail!("Subscriber buffer must be >= 1");
        }
        if !self.perf_pages.is_power_of_two() {
            bail!("Perf buffer pages must be a power of two, got {}", self.perf_pages);
        }
        if self.probe.kernel_symbol.is_empty() {
            bail!("Kernel symbol must not be empty");
        }
        if self.channel.is_empty() {
            bail!("Event channel name must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        AgentConfig::new(ProbeObject::Embedded(&[]))
    }

    #[test]
    fn test_reference_defaults() {
        let config = config();

        assert_eq!(config.listen.port(), 4000);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.probe.kernel_symbol, "tcp_cleanup_rbuf");
        assert_eq!(config.channel, "EVENTS");
        assert_eq!(config.overflow, OverflowPolicy::DropSubscriber);
        assert_eq!(config.byte_encoding, ByteCountEncoding::Number);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = config();
        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_queue_rejected() {
        let mut config = config();
        config.subscriber_queue = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_perf_pages_power_of_two() {
        let mut config = config();
        config.perf_pages = 48;
        assert!(config.validate().is_err());

        config.perf_pages = 128;
        assert!(config.validate().is_ok());
    }
}
