//! Shared daemon state
//!
//! The registry plus the two counters the server reports: the number of
//! active sessions and the acquisition mode.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use ms_core::SensorRegistry;
use ms_protocol::{PortPresence, StatusReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcquisitionMode {
    Serial = 0,
    Simulation = 1,
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionMode::Serial => f.write_str("serial"),
            AcquisitionMode::Simulation => f.write_str("simulation"),
        }
    }
}

pub struct BridgeState {
    registry: Arc<SensorRegistry>,
    ports: Vec<String>,
    sessions: AtomicUsize,
    mode: AtomicU8,
}

impl BridgeState {
    /// `ports` are the device paths of the enabled channels, reported by `debug-ports`
    pub fn new(registry: Arc<SensorRegistry>, ports: Vec<String>) -> Self {
        Self {
            registry,
            ports,
            sessions: AtomicUsize::new(0),
            mode: AtomicU8::new(AcquisitionMode::Serial as u8),
        }
    }

    pub fn registry(&self) -> &Arc<SensorRegistry> {
        &self.registry
    }

    pub fn mode(&self) -> AcquisitionMode {
        match self.mode.load(Ordering::SeqCst) {
            1 => AcquisitionMode::Simulation,
            _ => AcquisitionMode::Serial,
        }
    }

    pub fn set_mode(&self, mode: AcquisitionMode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Count a session for as long as the returned guard lives
    pub fn open_session(self: &Arc<Self>) -> SessionGuard {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        SessionGuard { state: self.clone() }
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            clients: self.session_count(),
            mode: self.mode().to_string(),
            slots: self.registry.raw_snapshot(),
        }
    }

    pub fn port_presence(&self) -> Vec<PortPresence> {
        self.ports
            .iter()
            .map(|path| PortPresence {
                path: path.clone(),
                present: std::path::Path::new(path).exists(),
            })
            .collect()
    }
}

/// Decrements the session count on drop
pub struct SessionGuard {
    state: Arc<BridgeState>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state.sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
