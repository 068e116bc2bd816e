//! Poller - one bounded probe of one controller
//!
//! ## Read sequence
//!
//! ```text
//! connect → status (lamps or run state) → part/total/NG counters
//!         → active program → program header → cycle-time accumulators
//!         → disconnect (always)
//! ```
//!
//! Every error is converted into a [`PollFailure`] here; nothing propagates
//! past the poller. A header that cannot be parsed only degrades the snapshot.

use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use futures::FutureExt;
use regex::Regex;
use tracing::{debug, instrument, trace, warn};

use crate::{
    MachineSnapshot, PollFailure, PollFailureKind, PollOutcome, StatusCode, ToolEntry,
    config::{FleetConfig, StatusSource},
    protocol::{
        CYCLE_MINUTES_PARAM, CYCLE_SECONDS_PARAM, NG_COUNT_MACRO, PART_COUNT_MACRO,
        PROGRAM_HEADER_MAX_LEN, ProtocolClient, ProtocolConnector, ProtocolError, ProtocolResult,
        TOTAL_COUNT_MACRO,
    },
    util::format_cycle_time,
};

/// Placeholder drawing number when the header cannot be parsed
pub const UNKNOWN_DRAWING: &str = "unknown";

/// Line (after skipping `%` tape marks) that carries the drawing number
const DRAWING_LINE: usize = 1;

static TOOL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\(\s*(T(\d+))\s*[:=]?\s*(.*?)\s*\)$").expect("valid tool line pattern")
});

static TOOL_CHANGE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(M0?6\b|TOOL\s*CHANGE\b)").expect("valid tool change pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramHeader {
    pub drawing_no: String,
    pub tools: Vec<ToolEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderParseError {
    MissingDrawingLine,
    EmptyDrawingNumber,
    /// No code line terminates the comment block
    MissingSentinel,
}

impl fmt::Display for HeaderParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderParseError::MissingDrawingLine => write!(f, "header has no drawing line"),
            HeaderParseError::EmptyDrawingNumber => write!(f, "drawing number is empty"),
            HeaderParseError::MissingSentinel => write!(f, "header comment block never ends"),
        }
    }
}

impl std::error::Error for HeaderParseError {}

fn is_comment(line: &str) -> bool {
    line.starts_with('(') && line.ends_with(')')
}

/// Parse the leading comment block of a part program.
///
/// ```text
/// O0011(BRACKET)          program line
/// (DWG:A-1234-01)         drawing number, label optional
/// (T1 CENTER DRILL)       tool table ...
/// (T12 EM6)
/// (T12 TOOL CHANGE)       tool-change markers are dropped
/// (ROUGHING PASS)         plain remarks are dropped
/// G91 G28 Z0.             first code line ends the block
/// ```
///
/// Tools are ordered by the numeric part of their number.
pub fn parse_program_header(text: &str) -> Result<ProgramHeader, HeaderParseError> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "%")
        .collect();

    let drawing_line = lines
        .get(DRAWING_LINE)
        .filter(|line| is_comment(line))
        .ok_or(HeaderParseError::MissingDrawingLine)?;
    let inner = &drawing_line[1..drawing_line.len() - 1];
    let drawing_no = inner
        .split_once(':')
        .map_or(inner, |(_, value)| value)
        .trim();
    if drawing_no.is_empty() {
        return Err(HeaderParseError::EmptyDrawingNumber);
    }

    let block = &lines[DRAWING_LINE + 1..];
    let sentinel = block
        .iter()
        .position(|line| !is_comment(line))
        .ok_or(HeaderParseError::MissingSentinel)?;

    let mut tools: Vec<(u32, ToolEntry)> = block[..sentinel]
        .iter()
        .filter_map(|line| TOOL_LINE.captures(line))
        .filter_map(|caps| {
            let name = caps.get(3)?.as_str();
            if name.is_empty() || TOOL_CHANGE_MARKER.is_match(name) {
                return None;
            }
            let order = caps.get(2)?.as_str().parse::<u32>().ok()?;
            Some((
                order,
                ToolEntry {
                    tool_number: caps.get(1)?.as_str().to_string(),
                    tool_name: name.to_string(),
                },
            ))
        })
        .collect();
    // a tool number listed twice keeps its last name
    let mut seen = HashSet::new();
    tools.reverse();
    tools.retain(|(_, tool)| seen.insert(tool.tool_number.clone()));
    tools.sort_by_key(|(order, _)| *order);

    Ok(ProgramHeader {
        drawing_no: drawing_no.to_string(),
        tools: tools.into_iter().map(|(_, tool)| tool).collect(),
    })
}

/// Polls single controllers through a [`ProtocolConnector`]
#[derive(Clone)]
pub struct Poller {
    connector: Arc<dyn ProtocolConnector>,
    port: u16,
    timeout: Duration,
    status_source: StatusSource,
}

impl Poller {
    pub fn new(
        connector: Arc<dyn ProtocolConnector>,
        port: u16,
        timeout: Duration,
        status_source: StatusSource,
    ) -> Self {
        Self {
            connector,
            port,
            timeout,
            status_source,
        }
    }

    pub fn from_config(connector: Arc<dyn ProtocolConnector>, config: &FleetConfig) -> Self {
        Self::new(
            connector,
            config.port,
            config.poll_timeout(),
            config.status_source,
        )
    }

    /// Probe one controller. Never fails: errors become a [`PollFailure`].
    #[instrument(skip(self), fields(machine = %machine_id))]
    pub async fn poll(&self, machine_id: &str, address: Ipv4Addr) -> PollOutcome {
        let started = Instant::now();
        let mut client = self
            .connector
            .open(SocketAddr::new(address.into(), self.port), self.timeout);

        let result = AssertUnwindSafe(self.read_snapshot(client.as_mut(), machine_id, address))
            .catch_unwind()
            .await;

        // Release the session on every path. A failing disconnect must not
        // replace the outcome of the reads.
        if let Err(e) = client.disconnect().await {
            debug!("disconnect from {address} failed: {e}");
        }

        let poll_duration_ms = started.elapsed().as_millis() as u64;

        let (kind, message) = match result {
            Ok(Ok(mut snapshot)) => {
                snapshot.poll_duration_ms = poll_duration_ms;
                trace!(
                    "{machine_id} ({address}): {} in {poll_duration_ms}ms",
                    snapshot.status_code
                );
                return PollOutcome::Snapshot(snapshot);
            }
            Ok(Err(e)) => (e.failure_kind(), e.to_string()),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| String::from("poll panicked"));
                (PollFailureKind::UnexpectedError, message)
            }
        };

        warn!("{machine_id} ({address}): {kind}: {message}");

        PollOutcome::Failed(PollFailure {
            machine_id: machine_id.to_string(),
            address,
            kind,
            message,
            poll_duration_ms,
        })
    }

    async fn read_snapshot(
        &self,
        client: &mut dyn ProtocolClient,
        machine_id: &str,
        address: Ipv4Addr,
    ) -> ProtocolResult<MachineSnapshot> {
        if !client.connect().await? {
            return Err(ProtocolError::Timeout(String::from(
                "controller did not accept the session",
            )));
        }

        let status_code = match self.status_source {
            StatusSource::Lamp => client.read_status().await?.status(),
            StatusSource::RunState => StatusCode(client.read_run_state().await?),
        };

        let mut snapshot = MachineSnapshot::empty(machine_id, address, status_code);
        snapshot.part_count = client.read_counter(PART_COUNT_MACRO).await?;
        snapshot.total_count = client.read_counter(TOTAL_COUNT_MACRO).await?;
        snapshot.ng_count = client.read_counter(NG_COUNT_MACRO).await?;

        let program = client.read_active_program().await?.name();
        let header = client
            .read_program_header(&program, PROGRAM_HEADER_MAX_LEN)
            .await?;
        snapshot.program_id = Some(program);

        match header.as_deref().map(parse_program_header) {
            Some(Ok(header)) => {
                snapshot.drawing_no = Some(header.drawing_no);
                snapshot.tool_list = header.tools;
            }
            Some(Err(e)) => {
                debug!("{machine_id}: header degraded: {e}");
                snapshot.drawing_no = Some(UNKNOWN_DRAWING.to_string());
                snapshot.poll_error = Some(format!("header degraded: {e}"));
            }
            None => {
                snapshot.drawing_no = Some(UNKNOWN_DRAWING.to_string());
                snapshot.poll_error = Some(String::from("header degraded: program not found"));
            }
        }

        snapshot.cycle_time = client
            .read_time_accumulators(&[CYCLE_SECONDS_PARAM, CYCLE_MINUTES_PARAM])
            .await?
            .and_then(|values| {
                let seconds = values.get(&CYCLE_SECONDS_PARAM)?;
                let minutes = values.get(&CYCLE_MINUTES_PARAM)?;
                Some(format_cycle_time(*seconds, *minutes))
            });

        Ok(snapshot)
    }
}
