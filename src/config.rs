use std::path::{Path, PathBuf};

use chrono::NaiveTime;

use crate::engine::WorkingHours;
use crate::store::StoreOptions;
use crate::time;

/// Server settings, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub working_hours: WorkingHours,
    pub range_exclusion: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("working hours start {start} must be before end {end}")]
    EmptyWorkingDay { start: NaiveTime, end: NaiveTime },
    #[error("both SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set, or neither")]
    PartialTls,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            working_hours: WorkingHours::default(),
            range_exclusion: true,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid { var, value: v }),
    }
}

fn parse_time_or(
    var: &'static str,
    value: Option<String>,
    default: NaiveTime,
) -> Result<NaiveTime, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => time::parse_time_of_day(&v).ok_or(ConfigError::Invalid { var, value: v }),
    }
}

fn parse_switch(var: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(v) = value else { return Ok(default) };
    match v.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid { var, value: v }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; `lookup` returns `None` for unset variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let metrics_port = match lookup("SLOTBOOK_METRICS_PORT") {
            None => None,
            Some(v) => Some(parse_or("SLOTBOOK_METRICS_PORT", Some(v), 0u16)?),
        };

        let tls_cert = lookup("SLOTBOOK_TLS_CERT");
        let tls_key = lookup("SLOTBOOK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        let working_hours = WorkingHours {
            start: parse_time_or(
                "SLOTBOOK_WORKING_HOURS_START",
                lookup("SLOTBOOK_WORKING_HOURS_START"),
                defaults.working_hours.start,
            )?,
            end: parse_time_or(
                "SLOTBOOK_WORKING_HOURS_END",
                lookup("SLOTBOOK_WORKING_HOURS_END"),
                defaults.working_hours.end,
            )?,
        };
        if working_hours.start >= working_hours.end {
            return Err(ConfigError::EmptyWorkingDay {
                start: working_hours.start,
                end: working_hours.end,
            });
        }

        Ok(Self {
            bind: lookup("SLOTBOOK_BIND").unwrap_or(defaults.bind),
            port: parse_or("SLOTBOOK_PORT", lookup("SLOTBOOK_PORT"), defaults.port)?,
            data_dir: lookup("SLOTBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parse_or(
                "SLOTBOOK_MAX_CONNECTIONS",
                lookup("SLOTBOOK_MAX_CONNECTIONS"),
                defaults.max_connections,
            )?,
            compact_threshold: parse_or(
                "SLOTBOOK_COMPACT_THRESHOLD",
                lookup("SLOTBOOK_COMPACT_THRESHOLD"),
                defaults.compact_threshold,
            )?,
            metrics_port,
            tls_cert,
            tls_key,
            working_hours,
            range_exclusion: parse_switch(
                "SLOTBOOK_RANGE_EXCLUSION",
                lookup("SLOTBOOK_RANGE_EXCLUSION"),
                defaults.range_exclusion,
            )?,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Cert and key paths when TLS is configured.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((Path::new(cert), Path::new(key))),
            _ => None,
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            range_exclusion: self.range_exclusion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]).unwrap();
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.wal_path(), PathBuf::from("./data/slotbook.wal"));
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.working_hours, WorkingHours::default());
        assert!(c.range_exclusion);
    }

    #[test]
    fn reads_overrides() {
        let c = config(&[
            ("SLOTBOOK_PORT", "6000"),
            ("SLOTBOOK_DATA_DIR", "/var/lib/slotbook"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
            ("SLOTBOOK_WORKING_HOURS_START", "08:30"),
            ("SLOTBOOK_WORKING_HOURS_END", "18:00"),
            ("SLOTBOOK_RANGE_EXCLUSION", "off"),
        ])
        .unwrap();
        assert_eq!(c.port, 6000);
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/slotbook/slotbook.wal"));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.working_hours.start, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
        assert_eq!(c.working_hours.end, NaiveTime::from_hms_opt(18, 0, 0).unwrap());
        assert!(!c.store_options().range_exclusion);
    }

    #[test]
    fn rejects_inverted_hours() {
        let err = config(&[
            ("SLOTBOOK_WORKING_HOURS_START", "17:00"),
            ("SLOTBOOK_WORKING_HOURS_END", "09:00"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyWorkingDay { .. }));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            config(&[("SLOTBOOK_PORT", "many")]),
            Err(ConfigError::Invalid { var: "SLOTBOOK_PORT", .. })
        ));
        assert!(config(&[("SLOTBOOK_WORKING_HOURS_END", "5pm")]).is_err());
        assert!(config(&[("SLOTBOOK_RANGE_EXCLUSION", "maybe")]).is_err());
    }

    #[test]
    fn tls_needs_both_files() {
        assert!(matches!(
            config(&[("SLOTBOOK_TLS_CERT", "cert.pem")]),
            Err(ConfigError::PartialTls)
        ));
        let c = config(&[("SLOTBOOK_TLS_CERT", "c.pem"), ("SLOTBOOK_TLS_KEY", "k.pem")]).unwrap();
        assert_eq!(c.tls_key.as_deref(), Some("k.pem"));
        assert_eq!(c.tls_files(), Some((Path::new("c.pem"), Path::new("k.pem"))));
        assert_eq!(config(&[]).unwrap().tls_files(), None);
    }
}
