//! Runtime configuration for an instance and the listener feeding it.
//!
//! A `Config` is passed by value into [`Instance::new`](crate::Instance::new);
//! nothing in the core reads process-wide defaults.

use crate::error::{Error, Result};
use shared::{FrameFormat, MAX_PAYLOAD_SIZE};
use std::time::Duration;

/// What a session does when a peer sends a frame whose declared length
/// cannot be valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedFramePolicy {
    /// Close the session. The byte stream cannot be trusted after a bad length.
    #[default]
    Terminate,
    /// Discard the declared number of bytes and keep reading.
    Skip,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Time between two ticks of the update loop
    pub tick_interval: Duration,
    /// Longest a session may stay silent before it is dropped
    pub read_timeout: Duration,
    /// Longest a single outbound batch may take to write
    pub write_timeout: Duration,
    /// Longest the listener waits for the first frame of a new connection
    pub handshake_timeout: Duration,
    /// Ceiling on concurrently admitted sessions
    pub max_sessions: usize,
    /// Batches a session may have queued before it counts as a stalled receiver
    pub outbound_capacity: usize,
    /// Largest inbound payload accepted, in bytes
    pub max_frame_size: usize,
    pub frame_format: FrameFormat,
    pub malformed_frames: MalformedFramePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(5),
            max_sessions: 64,
            outbound_capacity: 32,
            max_frame_size: MAX_PAYLOAD_SIZE,
            frame_format: FrameFormat::Plain,
            malformed_frames: MalformedFramePolicy::Terminate,
        }
    }
}

impl Config {
    /// Sets the tick interval from a rate in ticks per second.
    pub fn with_tick_rate(mut self, ticks_per_second: u32) -> Self {
        self.tick_interval = Duration::from_secs_f64(1.0 / ticks_per_second.max(1) as f64);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_frame_format(mut self, format: FrameFormat) -> Self {
        self.frame_format = format;
        self
    }

    pub fn with_malformed_frames(mut self, policy: MalformedFramePolicy) -> Self {
        self.malformed_frames = policy;
        self
    }

    /// Rejects values the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("tick interval", self.tick_interval),
            ("read timeout", self.read_timeout),
            ("write timeout", self.write_timeout),
            ("handshake timeout", self.handshake_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        if self.max_sessions == 0 {
            return Err(Error::InvalidConfig(
                "max sessions must be at least 1".to_string(),
            ));
        }
        if self.outbound_capacity == 0 {
            return Err(Error::InvalidConfig(
                "outbound capacity must be at least 1".to_string(),
            ));
        }
        if self.max_frame_size == 0 || self.max_frame_size > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max frame size must be between 1 and {} bytes",
                MAX_PAYLOAD_SIZE
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval, Duration::from_millis(50));
        assert_eq!(config.malformed_frames, MalformedFramePolicy::Terminate);
        assert_eq!(config.frame_format, FrameFormat::Plain);
    }

    #[test]
    fn test_tick_rate_conversion() {
        let config = Config::default().with_tick_rate(60);
        let millis = config.tick_interval.as_secs_f64() * 1000.0;
        assert!((millis - 16.666).abs() < 0.01);

        let config = Config::default().with_tick_rate(0);
        assert_eq!(config.tick_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_builders_chain() {
        let config = Config::default()
            .with_read_timeout(Duration::from_secs(60))
            .with_write_timeout(Duration::from_secs(30))
            .with_max_sessions(2)
            .with_outbound_capacity(4)
            .with_max_frame_size(1024)
            .with_frame_format(FrameFormat::Timestamped)
            .with_malformed_frames(MalformedFramePolicy::Skip);

        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.write_timeout, Duration::from_secs(30));
        assert_eq!(config.max_sessions, 2);
        assert_eq!(config.outbound_capacity, 4);
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.frame_format, FrameFormat::Timestamped);
        assert_eq!(config.malformed_frames, MalformedFramePolicy::Skip);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        let invalid = vec![
            Config::default().with_tick_interval(Duration::ZERO),
            Config::default().with_read_timeout(Duration::ZERO),
            Config::default().with_write_timeout(Duration::ZERO),
            Config::default().with_handshake_timeout(Duration::ZERO),
            Config::default().with_max_sessions(0),
            Config::default().with_outbound_capacity(0),
            Config::default().with_max_frame_size(0),
        ];

        for config in invalid {
            assert!(
                matches!(config.validate(), Err(Error::InvalidConfig(_))),
                "should reject {:?}",
                config
            );
        }
    }

    #[test]
    fn test_frame_size_above_prefix_range_rejected() {
        let config = Config::default().with_max_frame_size(MAX_PAYLOAD_SIZE + 1);
        assert!(config.validate().is_err());
    }
}
