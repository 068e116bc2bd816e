//! Scripted controllers and cycle wiring for integration tests

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_recorder::{
    StatusCode,
    aggregator::{Aggregator, CyclePlan},
    config::{Config, parse_config},
    cycle::FleetCycle,
    errlog::ErrorLog,
    notifier::{AlertClass, AlertSink, Notifier, NotifyError, NotifyPolicy},
    persister::Persister,
    poller::Poller,
    protocol::{
        ActiveProgram, LampBits, ProtocolClient, ProtocolConnector, ProtocolError, ProtocolResult,
    },
    reconciler::Reconciler,
    storage::StorageBackend,
};

pub const BRACKET_HEADER: &str = "%\n\
    O0011(BRACKET)\n\
    (DWG:A-1234-01)\n\
    (T1 CENTER DRILL)\n\
    (T3 EM6)\n\
    G91 G28 Z0.\n";

/// What a scripted controller does when polled
#[derive(Debug, Clone)]
pub enum Behaviour {
    Responds(Machine),
    TimesOut,
    Refuses,
}

#[derive(Debug, Clone)]
pub struct Machine {
    pub lamps: u8,
    pub run_state: i64,
    pub counters: HashMap<u32, i64>,
    pub program: u32,
    pub header: Option<String>,
    pub cycle_seconds: i64,
    pub cycle_minutes: i64,
}

impl Machine {
    pub fn running() -> Self {
        Self {
            lamps: LampBits::GREEN,
            run_state: 3,
            counters: HashMap::from([(3901, 120), (12399, 5000), (12400, 3)]),
            program: 11,
            header: Some(BRACKET_HEADER.to_string()),
            cycle_seconds: 30,
            cycle_minutes: 1,
        }
    }

    pub fn with_lamps(mut self, lamps: u8) -> Self {
        self.lamps = lamps;
        self
    }

    pub fn with_header(mut self, header: &str) -> Self {
        self.header = Some(header.to_string());
        self
    }
}

/// Connector serving scripted controllers, keyed by address
#[derive(Clone, Default)]
pub struct FakeFleet {
    machines: Arc<Mutex<HashMap<Ipv4Addr, Behaviour>>>,
    opened: Arc<Mutex<Vec<Ipv4Addr>>>,
}

impl FakeFleet {
    pub fn set(&self, address: Ipv4Addr, behaviour: Behaviour) {
        self.machines.lock().unwrap().insert(address, behaviour);
    }

    pub fn update(&self, address: Ipv4Addr, change: impl FnOnce(&mut Machine)) {
        if let Some(Behaviour::Responds(machine)) = self.machines.lock().unwrap().get_mut(&address)
        {
            change(machine);
        }
    }

    /// Every address a session was opened for, in order
    pub fn opened(&self) -> Vec<Ipv4Addr> {
        self.opened.lock().unwrap().clone()
    }
}

impl ProtocolConnector for FakeFleet {
    fn open(&self, address: SocketAddr, _timeout: Duration) -> Box<dyn ProtocolClient> {
        let ip = match address.ip() {
            std::net::IpAddr::V4(ip) => ip,
            std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        self.opened.lock().unwrap().push(ip);
        let behaviour = self
            .machines
            .lock()
            .unwrap()
            .get(&ip)
            .cloned()
            .unwrap_or(Behaviour::Refuses);
        Box::new(FakeClient { behaviour })
    }
}

struct FakeClient {
    behaviour: Behaviour,
}

impl FakeClient {
    fn machine(&self) -> ProtocolResult<&Machine> {
        match &self.behaviour {
            Behaviour::Responds(machine) => Ok(machine),
            _ => Err(ProtocolError::Other("not connected".to_string())),
        }
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn connect(&mut self) -> ProtocolResult<bool> {
        match &self.behaviour {
            Behaviour::Responds(_) => Ok(true),
            Behaviour::TimesOut => Err(ProtocolError::Timeout("no answer".to_string())),
            Behaviour::Refuses => Err(ProtocolError::Refused("connection refused".to_string())),
        }
    }

    async fn disconnect(&mut self) -> ProtocolResult<()> {
        Ok(())
    }

    async fn read_status(&mut self) -> ProtocolResult<LampBits> {
        Ok(LampBits(self.machine()?.lamps))
    }

    async fn read_run_state(&mut self) -> ProtocolResult<i64> {
        Ok(self.machine()?.run_state)
    }

    async fn read_counter(&mut self, id: u32) -> ProtocolResult<Option<i64>> {
        Ok(self.machine()?.counters.get(&id).copied())
    }

    async fn read_program_header(
        &mut self,
        _program: &str,
        _max_len: usize,
    ) -> ProtocolResult<Option<String>> {
        Ok(self.machine()?.header.clone())
    }

    async fn read_active_program(&mut self) -> ProtocolResult<ActiveProgram> {
        Ok(ActiveProgram {
            main: self.machine()?.program,
        })
    }

    async fn read_time_accumulators(
        &mut self,
        ids: &[u32],
    ) -> ProtocolResult<Option<HashMap<u32, i64>>> {
        let machine = self.machine()?;
        let values = HashMap::from([(6757, machine.cycle_seconds), (6758, machine.cycle_minutes)]);
        Ok(Some(
            ids.iter()
                .filter_map(|id| values.get(id).map(|v| (*id, *v)))
                .collect(),
        ))
    }
}

/// Sink remembering every alert
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub calls: Arc<Mutex<Vec<(String, AlertClass)>>>,
}

impl RecordingSink {
    pub fn machines(&self) -> HashSet<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn alert(
        &self,
        machine_id: &str,
        class: AlertClass,
        _status: StatusCode,
    ) -> Result<(), NotifyError> {
        self.calls
            .lock()
            .unwrap()
            .push((machine_id.to_string(), class));
        Ok(())
    }
}

pub fn addr(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 1, last)
}

/// `.168` to `.170`, offset 2 (`.170`) excluded, in-memory storage
pub fn scenario_config(error_log: &std::path::Path) -> Config {
    parse_config(&format!(
        r#"{{
            "fleet": {{
                "first": "192.168.1.168",
                "last": "192.168.1.170",
                "excluded": [2],
                "concurrency": 4
            }},
            "storage": {{ "backend": "none" }},
            "notifier": {{ "inter_alert_delay_secs": 0 }},
            "error_log": {:?}
        }}"#,
        error_log.display().to_string()
    ))
    .unwrap()
}

/// Cycle wired to the fake fleet, a recording sink and the given backend
pub fn build_cycle(
    config: &Config,
    fleet: &FakeFleet,
    sink: &RecordingSink,
    backend: Arc<dyn StorageBackend>,
) -> FleetCycle {
    let poller = Poller::from_config(Arc::new(fleet.clone()), &config.fleet);
    FleetCycle::new(
        CyclePlan::from_config(&config.fleet),
        Aggregator::from_config(poller, &config.fleet),
        Reconciler::new(config.reconcile.max_backfill_cycles),
        Persister::new(backend),
        Notifier::new(
            NotifyPolicy::from_config(&config.notifier),
            Arc::new(sink.clone()),
            Duration::ZERO,
        ),
        ErrorLog::new(config.error_log.clone()),
    )
}
