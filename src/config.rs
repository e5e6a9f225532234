use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::Semaphore;

/// Server settings, read from `TUTORSLOT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Compact a log once this many appends accumulated since the last compaction.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub reconcile_interval: Duration,
    /// How long a window may sit held without a booking before the reconciler
    /// releases it. Must exceed the storage write timeout.
    pub reconcile_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "tutorslot".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            reconcile_interval: Duration::from_secs(30),
            reconcile_grace: Duration::from_secs(300),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            bind: lookup("TUTORSLOT_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "TUTORSLOT_PORT").unwrap_or(d.port),
            data_dir: lookup("TUTORSLOT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            password: lookup("TUTORSLOT_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "TUTORSLOT_MAX_CONNECTIONS")
                .map(connection_cap)
                .unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "TUTORSLOT_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
            metrics_port: parsed(&lookup, "TUTORSLOT_METRICS_PORT"),
            reconcile_interval: parsed(&lookup, "TUTORSLOT_RECONCILE_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.reconcile_interval),
            reconcile_grace: parsed(&lookup, "TUTORSLOT_RECONCILE_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.reconcile_grace),
        }
    }

    pub fn windows_wal(&self) -> PathBuf {
        self.data_dir.join("windows.wal")
    }

    pub fn bookings_wal(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

/// The connection limit becomes semaphore permits, and shutdown drains them
/// all in one `acquire_many(u32)`.
fn connection_cap(requested: usize) -> usize {
    let ceiling = Semaphore::MAX_PERMITS.min(u32::MAX as usize);
    let capped = requested.clamp(1, ceiling);
    if capped != requested {
        tracing::warn!(requested, capped, "TUTORSLOT_MAX_CONNECTIONS out of range, clamping");
    }
    capped
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring malformed {key}={raw:?}, using default");
            None
        }
    }
}
