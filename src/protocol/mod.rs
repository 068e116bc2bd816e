//! Controller protocol boundary
//!
//! The wire protocol spoken by a controller is not part of this crate. Pollers
//! talk to a controller through the [`ProtocolClient`] capability, obtained
//! fresh for every poll from a [`ProtocolConnector`].
//!
//! ## Implementations
//!
//! - [`http::HttpGatewayConnector`]: JSON over HTTP to a per-controller gateway
//! - test doubles in `tests/` and the unit tests of the poller

pub mod http;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::{PollFailureKind, StatusCode};

/// Part counter macro
pub const PART_COUNT_MACRO: u32 = 3901;
/// Total produced macro
pub const TOTAL_COUNT_MACRO: u32 = 12399;
/// Defect counter macro
pub const NG_COUNT_MACRO: u32 = 12400;
/// Cycle time accumulator, seconds
pub const CYCLE_SECONDS_PARAM: u32 = 6757;
/// Cycle time accumulator, minutes
pub const CYCLE_MINUTES_PARAM: u32 = 6758;
/// Upper bound on characters fetched from a program header
pub const PROGRAM_HEADER_MAX_LEN: usize = 3500;

/// Errors surfaced by a protocol client
///
/// The variants mirror how the supervisor weighs failures: timeouts, refused
/// connections, other OS-level errors, and everything else.
#[derive(Debug)]
pub enum ProtocolError {
    /// The controller did not answer in time
    Timeout(String),

    /// The controller actively refused the connection
    Refused(String),

    /// Any other OS-level socket error
    Os(std::io::Error),

    /// Protocol violations, malformed answers, and everything else
    Other(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Timeout(msg) => write!(f, "timed out: {msg}"),
            ProtocolError::Refused(msg) => write!(f, "connection refused: {msg}"),
            ProtocolError::Os(err) => write!(f, "OS error: {err}"),
            ProtocolError::Other(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Os(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ProtocolError::Timeout(err.to_string())
            }
            std::io::ErrorKind::ConnectionRefused => ProtocolError::Refused(err.to_string()),
            _ => ProtocolError::Os(err),
        }
    }
}

impl ProtocolError {
    pub fn failure_kind(&self) -> PollFailureKind {
        match self {
            ProtocolError::Timeout(_) => PollFailureKind::TimedOut,
            ProtocolError::Refused(_) => PollFailureKind::ConnectionRefused,
            ProtocolError::Os(_) => PollFailureKind::OtherOsError,
            ProtocolError::Other(_) => PollFailureKind::UnexpectedError,
        }
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Signal tower lamp bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LampBits(pub u8);

impl LampBits {
    pub const GREEN: u8 = 0b001;
    pub const YELLOW: u8 = 0b010;
    pub const RED: u8 = 0b100;

    pub fn green(self) -> bool {
        self.0 & Self::GREEN != 0
    }

    pub fn yellow(self) -> bool {
        self.0 & Self::YELLOW != 0
    }

    pub fn red(self) -> bool {
        self.0 & Self::RED != 0
    }

    /// Collapse the lamps into one ordinal. Green wins over yellow, yellow
    /// over red; no lamp at all is idle.
    pub fn status(self) -> StatusCode {
        if self.green() {
            StatusCode::RUNNING
        } else if self.yellow() {
            StatusCode::STARTING
        } else if self.red() {
            StatusCode::ALARM
        } else {
            StatusCode::IDLE
        }
    }
}

/// Program currently selected on the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveProgram {
    pub main: u32,
}

impl ActiveProgram {
    /// Program name as the controller addresses it, e.g. `O0011`.
    pub fn name(&self) -> String {
        format!("O{:04}", self.main)
    }
}

/// Session with a single controller
///
/// A client is owned by exactly one poll and dropped afterwards.
#[async_trait]
pub trait ProtocolClient: Send {
    /// Returns `false` when the controller could not be reached.
    async fn connect(&mut self) -> ProtocolResult<bool>;

    async fn disconnect(&mut self) -> ProtocolResult<()>;

    async fn read_status(&mut self) -> ProtocolResult<LampBits>;

    /// Raw run-state ordinal (0 reset, 1 stop, 2 hold, 3 start).
    async fn read_run_state(&mut self) -> ProtocolResult<i64>;

    async fn read_counter(&mut self, id: u32) -> ProtocolResult<Option<i64>>;

    async fn read_program_header(
        &mut self,
        program: &str,
        max_len: usize,
    ) -> ProtocolResult<Option<String>>;

    async fn read_active_program(&mut self) -> ProtocolResult<ActiveProgram>;

    async fn read_time_accumulators(
        &mut self,
        ids: &[u32],
    ) -> ProtocolResult<Option<HashMap<u32, i64>>>;
}

/// Factory for short-lived [`ProtocolClient`] sessions
pub trait ProtocolConnector: Send + Sync {
    fn open(&self, address: SocketAddr, timeout: Duration) -> Box<dyn ProtocolClient>;
}
