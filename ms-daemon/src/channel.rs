//! Acquisition channel state machine
//!
//! One channel per physical device. All methods here are blocking and are
//! driven from `spawn_blocking` by the acquisition runner.
//!
//! ```text
//! Connecting ──open ok──► Streaming ──threshold I/O errors──► Degraded
//!                            ▲                                    │
//!                            └──────────── reopen ok ─────────────┘
//! any state ──shutdown──► Closed
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use ms_core::{ChannelConfig, Reading, Rejection, SensorCatalog, SensorKind, SensorRegistry};
use ms_error::{MedisenseError, Result};

use crate::transport::{Connector, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Streaming,
    Degraded,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Streaming => "streaming",
            ChannelState::Degraded => "degraded",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Result of one poll pass
#[derive(Debug)]
pub enum PollOutcome {
    /// Nothing waiting on the device
    Idle,
    /// A frame was read but carried no value
    Blank,
    Accepted(SensorKind, Reading),
    Rejected(SensorKind, Rejection),
    /// A frame whose sensor kind could not be determined
    Undecodable(MedisenseError),
    /// I/O failure below the error threshold
    Failed(MedisenseError),
    /// I/O failure that reached the threshold; the transport is closed
    Degraded(MedisenseError),
}

impl PollOutcome {
    /// True when the pass read a frame from the device
    pub fn produced_frame(&self) -> bool {
        matches!(
            self,
            PollOutcome::Blank
                | PollOutcome::Accepted(..)
                | PollOutcome::Rejected(..)
                | PollOutcome::Undecodable(_)
        )
    }
}

pub struct AcquisitionChannel {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    read_timeout: Duration,
    error_threshold: u32,
    error_count: u32,
    last_success_at: Option<Instant>,
    state: ChannelState,
}

impl AcquisitionChannel {
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        read_timeout: Duration,
        error_threshold: u32,
    ) -> Self {
        Self {
            config,
            connector,
            transport: None,
            read_timeout,
            error_threshold: error_threshold.max(1),
            error_count: 0,
            last_success_at: None,
            state: ChannelState::Connecting,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn last_success_at(&self) -> Option<Instant> {
        self.last_success_at
    }

    /// Initial open. `Connecting` becomes `Streaming` on success; on failure
    /// the state is left for the supervisor to decide.
    pub fn connect(&mut self) -> Result<()> {
        let transport = self.open_transport()?;
        self.transport = Some(transport);
        self.error_count = 0;
        self.state = ChannelState::Streaming;
        info!(
            "ACQ: [{}] streaming from {} at {} baud",
            self.config.id, self.config.port, self.config.baud_rate
        );
        Ok(())
    }

    /// Put a channel that never connected into the retry cycle
    pub fn mark_degraded(&mut self) {
        self.transport = None;
        self.state = ChannelState::Degraded;
    }

    /// Reopen a degraded channel at the same address and speed
    pub fn recover(&mut self) -> Result<()> {
        if self.state != ChannelState::Degraded {
            return Ok(());
        }
        match self.open_transport() {
            Ok(transport) => {
                self.transport = Some(transport);
                self.error_count = 0;
                self.state = ChannelState::Streaming;
                info!("ACQ: [{}] recovered on {}", self.config.id, self.config.port);
                Ok(())
            }
            Err(e) => {
                debug!("ACQ: [{}] reconnect failed: {}", self.config.id, e);
                Err(e)
            }
        }
    }

    /// Read at most one frame and route it to the registry
    pub fn poll(&mut self, registry: &SensorRegistry) -> PollOutcome {
        if self.state != ChannelState::Streaming {
            return PollOutcome::Idle;
        }
        let Some(transport) = self.transport.as_mut() else {
            return PollOutcome::Idle;
        };

        match transport.poll_frame() {
            Ok(None) => PollOutcome::Idle,
            Ok(Some(frame)) => {
                self.error_count = 0;
                self.last_success_at = Some(Instant::now());
                self.route_frame(&frame, registry)
            }
            Err(e) => self.record_failure(e),
        }
    }

    /// Release the transport for good
    pub fn close(&mut self) {
        if self.state != ChannelState::Closed {
            self.transport = None;
            self.state = ChannelState::Closed;
            debug!("ACQ: [{}] closed", self.config.id);
        }
    }

    fn open_transport(&self) -> Result<Box<dyn Transport>> {
        self.connector
            .open(&self.config.port, self.config.baud_rate, self.read_timeout)
    }

    fn route_frame(&self, frame: &str, registry: &SensorRegistry) -> PollOutcome {
        let text = frame.trim();
        if text.is_empty() {
            return PollOutcome::Blank;
        }

        let (kind, raw) = match decode_frame(text, self.config.kind, registry.catalog()) {
            Ok(decoded) => decoded,
            Err(reason) => {
                let err = MedisenseError::DecodeFailure {
                    channel: self.config.id.clone(),
                    reason,
                };
                debug!("ACQ: {}", err);
                return PollOutcome::Undecodable(err);
            }
        };

        match registry.accept(kind, raw, Instant::now()) {
            Ok(reading) => {
                trace!("ACQ: [{}] {} = {}", self.config.id, kind, reading);
                PollOutcome::Accepted(kind, reading)
            }
            Err(rejection) => {
                debug!("ACQ: [{}] {}", self.config.id, rejection.clone().into_error(kind));
                PollOutcome::Rejected(kind, rejection)
            }
        }
    }

    fn record_failure(&mut self, source: io::Error) -> PollOutcome {
        self.error_count += 1;
        let err = MedisenseError::transport(self.config.port.clone(), source);

        if self.error_count >= self.error_threshold {
            warn!(
                "ACQ: [{}] degraded after {} consecutive errors: {}",
                self.config.id, self.error_count, err
            );
            self.transport = None;
            self.state = ChannelState::Degraded;
            return PollOutcome::Degraded(err);
        }

        warn!(
            "ACQ: [{}] read error ({}/{}): {}",
            self.config.id, self.error_count, self.error_threshold, err
        );
        PollOutcome::Failed(err)
    }
}

/// Work out which sensor a frame is for.
///
/// `<alias>:<value>` selects the kind by alias; any other frame belongs to the
/// channel's configured kind. Returns the kind and the raw value text.
pub fn decode_frame<'a>(
    frame: &'a str,
    configured: Option<SensorKind>,
    catalog: &SensorCatalog,
) -> std::result::Result<(SensorKind, &'a str), String> {
    if let Some((prefix, value)) = frame.split_once(':') {
        if let Some(kind) = catalog.resolve(prefix) {
            return Ok((kind, value.trim()));
        }
    }
    match configured {
        Some(kind) => Ok((kind, frame)),
        None => Err(format!("no sensor kind for frame {:?}", frame)),
    }
}
