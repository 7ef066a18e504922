//! Runtime configuration, read from the process environment.

use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::api::normalize_base_url;
use crate::error::ConfigError;
use crate::offline::DEFAULT_MAX_BATCH;

const APP_DIR_NAME: &str = "com.thesmall.pos";

const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 15;
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

pub struct SyncConfig {
    /// Holds `offline.db` and the `logs/` directory.
    pub data_dir: PathBuf,
    pub backend_url: Option<String>,
    pub api_key: Zeroizing<String>,
    /// Change-stream base; falls back to the backend URL.
    pub realtime_url: Option<String>,
    pub health_interval: Duration,
    pub max_batch: usize,
    pub cache_ttl: Duration,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("data_dir", &self.data_dir)
            .field("backend_url", &self.backend_url)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<set>" })
            .field("realtime_url", &self.realtime_url)
            .field("health_interval", &self.health_interval)
            .field("max_batch", &self.max_batch)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let data_dir = get("POS_SYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_dir(&lookup));
        let backend_url = get("POS_BACKEND_URL")
            .map(|v| parse_url("POS_BACKEND_URL", &v))
            .transpose()?;
        let realtime_url = match get("POS_REALTIME_URL") {
            Some(v) => Some(parse_url("POS_REALTIME_URL", &v)?),
            None => backend_url.clone(),
        };

        Ok(Self {
            data_dir,
            backend_url,
            api_key: Zeroizing::new(get("POS_API_KEY").unwrap_or_default()),
            realtime_url,
            health_interval: Duration::from_secs(parse_number(
                "POS_HEALTH_INTERVAL_SECS",
                get("POS_HEALTH_INTERVAL_SECS"),
                DEFAULT_HEALTH_INTERVAL_SECS,
            )?),
            max_batch: usize::try_from(parse_number(
                "POS_SYNC_MAX_BATCH",
                get("POS_SYNC_MAX_BATCH"),
                DEFAULT_MAX_BATCH as u64,
            )?)
            .unwrap_or(usize::MAX),
            cache_ttl: Duration::from_secs(parse_number(
                "POS_CACHE_TTL_SECS",
                get("POS_CACHE_TTL_SECS"),
                DEFAULT_CACHE_TTL_SECS,
            )?),
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn cache_ttl_millis(&self) -> i64 {
        i64::try_from(self.cache_ttl.as_millis()).unwrap_or(i64::MAX)
    }
}

fn parse_number(var: &'static str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    let Some(value) = raw else {
        return Ok(default);
    };
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber { var, value }),
    }
}

fn parse_url(var: &'static str, raw: &str) -> Result<String, ConfigError> {
    let url = normalize_base_url(raw);
    let host = url.split("://").nth(1).unwrap_or_default();
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(ConfigError::InvalidUrl {
            var,
            value: raw.to_string(),
        });
    }
    Ok(url)
}

fn default_data_dir<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    let base = lookup("LOCALAPPDATA")
        .or_else(|| lookup("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(lookup("USERPROFILE").unwrap_or_else(|| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(lookup("HOME").unwrap_or_else(|| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    #[cfg(not(target_os = "windows"))]
    fn test_defaults() {
        let cfg = SyncConfig::from_lookup(lookup_from(&[("HOME", "/home/pos")])).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/home/pos/.local/share/com.thesmall.pos"));
        assert_eq!(cfg.backend_url, None);
        assert_eq!(cfg.realtime_url, None);
        assert_eq!(cfg.health_interval, Duration::from_secs(15));
        assert_eq!(cfg.max_batch, 500);
        assert_eq!(cfg.cache_ttl_millis(), 3_600_000);
        assert!(cfg.api_key.is_empty());
    }

    #[test]
    fn test_realtime_url_falls_back_to_backend() {
        let cfg = SyncConfig::from_lookup(lookup_from(&[
            ("POS_SYNC_DATA_DIR", "/var/lib/pos"),
            ("POS_BACKEND_URL", "pos.example.com/api/"),
        ]))
        .unwrap();
        assert_eq!(cfg.backend_url.as_deref(), Some("https://pos.example.com"));
        assert_eq!(cfg.realtime_url.as_deref(), Some("https://pos.example.com"));
        assert_eq!(cfg.log_dir(), PathBuf::from("/var/lib/pos/logs"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = SyncConfig::from_lookup(lookup_from(&[("POS_SYNC_MAX_BATCH", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { var: "POS_SYNC_MAX_BATCH", .. }));

        let err = SyncConfig::from_lookup(lookup_from(&[("POS_HEALTH_INTERVAL_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));

        let err = SyncConfig::from_lookup(lookup_from(&[("POS_REALTIME_URL", "http://")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { var: "POS_REALTIME_URL", .. }));
    }

    #[test]
    fn test_debug_hides_api_key() {
        let cfg = SyncConfig::from_lookup(lookup_from(&[("POS_API_KEY", "sk_live_123")])).unwrap();
        let printed = format!("{cfg:?}");
        assert!(!printed.contains("sk_live_123"));
        assert!(printed.contains("<set>"));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var("POS_SYNC_DATA_DIR", "/tmp/pos-sync-env-test");
        std::env::set_var("POS_CACHE_TTL_SECS", "60");
        let cfg = SyncConfig::from_env();
        std::env::remove_var("POS_SYNC_DATA_DIR");
        std::env::remove_var("POS_CACHE_TTL_SECS");

        let cfg = cfg.unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/pos-sync-env-test"));
        assert_eq!(cfg.cache_ttl, Duration::from_secs(60));
    }
}
