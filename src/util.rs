use std::net::Ipv4Addr;
use std::path::PathBuf;

const FLEET_CONFIG: &str = "FLEET_CONFIG";

const DEFAULT_CONFIG: &str = "./fleet.json";

pub fn get_config_path() -> String {
    std::env::var(FLEET_CONFIG).unwrap_or_else(|_| String::from(DEFAULT_CONFIG))
}

const FLEET_DB: &str = "FLEET_DB";

/// SQLite path override, if set.
pub fn get_db_path() -> Option<PathBuf> {
    std::env::var(FLEET_DB).ok().map(PathBuf::from)
}

/// Every address from `first` to `last`, inclusive.
pub fn address_range(first: Ipv4Addr, last: Ipv4Addr) -> Vec<Ipv4Addr> {
    let (first, last) = (u32::from(first), u32::from(last));
    if first > last {
        return Vec::new();
    }
    (first..=last).map(Ipv4Addr::from).collect()
}

/// Logical machine name for the address at `offset` in the range
/// (`offset` 0 becomes `CNC01`).
pub fn machine_id(prefix: &str, offset: usize) -> String {
    format!("{prefix}{:02}", offset + 1)
}

/// `HH:MM:SS` from the controller's seconds and minutes accumulators.
pub fn format_cycle_time(seconds: i64, minutes: i64) -> String {
    let total = minutes
        .max(0)
        .saturating_mul(60)
        .saturating_add(seconds.max(0)) as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}
