//! Scan preferences.
//!
//! All preference values arrive as strings (`db_address`, `ov_maindbid`,
//! `max_scan_hosts`, `max_alive_hosts`, `port_range`, `alive_test`); this
//! module turns them into a typed [`ScanPrefs`] with scanner-wide defaults.
//! The binary overlays CLI flags on top of the environment.

use thiserror::Error;

use crate::AliveTest;

/// TCP probe ports used when no valid override is configured. Chosen to
/// maximise the chance of a response from a typical host.
pub const DEFAULT_TCP_PROBE_PORTS: &str = "80,137,587,3128,8081";

/// Environment variable prefix used by [`ScanPrefs::from_env`].
const ENV_PREFIX: &str = "PETREL_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: expected a decimal integer")]
    InvalidNumber { key: &'static str, value: String },

    #[error("invalid port range '{0}': {1}")]
    InvalidPortRange(String, String),

    #[error("invalid alive_test selector: {0}")]
    InvalidAliveTest(String),
}

/// Typed scan preferences.
#[derive(Debug, Clone)]
pub struct ScanPrefs {
    /// Connection string of the downstream queue (`redis://…` or a unix
    /// socket path).
    pub db_address: String,
    /// Database id selected after connecting (`ov_maindbid`).
    pub db_id: u32,
    /// Upper bound on hosts published for downstream scanning.
    pub max_scan_hosts: Option<u64>,
    /// Upper bound on alive hosts to identify before probing stops.
    pub max_alive_hosts: Option<u64>,
    /// Scan-wide port range, used when the built-in TCP probe list is
    /// rejected by the validator.
    pub port_range: Option<String>,
    /// Selected liveness methods.
    pub alive_test: AliveTest,
}

impl Default for ScanPrefs {
    fn default() -> Self {
        ScanPrefs {
            db_address: "redis://127.0.0.1:6379".to_string(),
            db_id: 1,
            max_scan_hosts: None,
            max_alive_hosts: None,
            port_range: None,
            alive_test: AliveTest::default(),
        }
    }
}

impl ScanPrefs {
    /// Build preferences from `PETREL_*` environment variables, falling back
    /// to defaults for anything unset. Malformed numeric values are errors —
    /// a silently ignored cap would remove a safety limit.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut prefs = ScanPrefs::default();
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}DB_ADDRESS")) {
            prefs.db_address = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}DB_ID")) {
            prefs.db_id = parse_number("ov_maindbid", &v)? as u32;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}MAX_SCAN_HOSTS")) {
            prefs.max_scan_hosts = Some(parse_number("max_scan_hosts", &v)?);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}MAX_ALIVE_HOSTS")) {
            prefs.max_alive_hosts = Some(parse_number("max_alive_hosts", &v)?);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}PORT_RANGE")) {
            prefs.port_range = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}ALIVE_TEST")) {
            prefs.alive_test = AliveTest::parse(&v).map_err(ConfigError::InvalidAliveTest)?;
        }
        Ok(prefs)
    }

    /// Resolve the TCP destination port list for this scan.
    ///
    /// The built-in list is run through the same validating parser as user
    /// input; only if it were rejected does the scan-wide `port_range`
    /// preference substitute. A malformed fallback range is a setup error
    /// rather than an empty probe list.
    pub fn tcp_probe_ports(&self) -> Result<Vec<u16>, ConfigError> {
        match parse_port_ranges(DEFAULT_TCP_PROBE_PORTS) {
            Ok(ports) => Ok(ports),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "built-in TCP probe port list rejected, using scan-wide port range"
                );
                let range = self.port_range.as_deref().unwrap_or("");
                parse_port_ranges(range)
            }
        }
    }
}

fn parse_number(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber {
            key,
            value: value.to_string(),
        })
}

/// Parse a port list like "80", "1-1024" or "80,137,8000-8010" into the
/// expanded port vector. Duplicates are kept, matching the probe semantics
/// of one packet per configured (target, port) pair.
pub fn parse_port_ranges(spec: &str) -> Result<Vec<u16>, ConfigError> {
    let bad = |why: &str| ConfigError::InvalidPortRange(spec.to_string(), why.to_string());

    let spec_trimmed = spec.trim();
    if spec_trimmed.is_empty() {
        return Err(bad("empty port list"));
    }

    let mut ports = Vec::new();
    for entry in spec_trimmed.split(',') {
        let entry = entry.trim();
        if let Some((start, end)) = entry.split_once('-') {
            let start: u16 = start
                .trim()
                .parse()
                .map_err(|_| bad("range start is not a port number"))?;
            let end: u16 = end
                .trim()
                .parse()
                .map_err(|_| bad("range end is not a port number"))?;
            if start == 0 {
                return Err(bad("port 0 is not probeable"));
            }
            if end < start {
                return Err(bad("range end precedes range start"));
            }
            ports.extend(start..=end);
        } else {
            let port: u16 = entry.parse().map_err(|_| bad("not a port number"))?;
            if port == 0 {
                return Err(bad("port 0 is not probeable"));
            }
            ports.push(port);
        }
    }
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_probe_ports_parse() {
        let ports = parse_port_ranges(DEFAULT_TCP_PROBE_PORTS).unwrap();
        assert_eq!(ports, vec![80, 137, 587, 3128, 8081]);
    }

    #[test]
    fn test_parse_single_port() {
        assert_eq!(parse_port_ranges("443").unwrap(), vec![443]);
    }

    #[test]
    fn test_parse_range_expands_inclusive() {
        assert_eq!(parse_port_ranges("20-23").unwrap(), vec![20, 21, 22, 23]);
    }

    #[test]
    fn test_parse_mixed_list_and_range() {
        assert_eq!(
            parse_port_ranges("80, 8000-8002, 443").unwrap(),
            vec![80, 8000, 8001, 8002, 443]
        );
    }

    #[test]
    fn test_parse_rejects_reversed_range() {
        assert!(parse_port_ranges("1024-1").is_err());
    }

    #[test]
    fn test_parse_rejects_port_zero_and_garbage() {
        assert!(parse_port_ranges("0").is_err());
        assert!(parse_port_ranges("http").is_err());
        assert!(parse_port_ranges("").is_err());
        assert!(parse_port_ranges("70000").is_err());
    }

    #[test]
    fn test_prefs_default_values() {
        let prefs = ScanPrefs::default();
        assert_eq!(prefs.db_id, 1);
        assert!(prefs.max_scan_hosts.is_none());
        assert!(prefs.max_alive_hosts.is_none());
        assert_eq!(prefs.alive_test, AliveTest::ICMP);
    }

    #[test]
    fn test_prefs_resolve_builtin_ports() {
        let prefs = ScanPrefs::default();
        assert_eq!(
            prefs.tcp_probe_ports().unwrap(),
            vec![80, 137, 587, 3128, 8081]
        );
    }
}
