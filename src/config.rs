use crate::error::ConfigError;
use crate::outcome::Thresholds;

use rust_decimal::Decimal;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_VAPI_BASE_URL: &str = "https://api.vapi.ai";

/// Deployment settings, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub vapi_base_url: String,
    /// Shared secret the platform echoes in `x-vapi-secret`.  `None` disables verification.
    pub server_url_secret: Option<String>,
    pub http_timeout: Duration,
    pub dispatch_interval: Duration,
    /// `None` disables the periodic poll sweep.
    pub refresh_interval: Option<Duration>,
    pub refresh_window: Duration,
    pub recordings_dir: PathBuf,
    pub webhook_log_dir: Option<PathBuf>,
    pub thresholds: Thresholds,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build from any variable source; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());
        let defaults = Thresholds::default();

        let refresh_secs: u64 = parse_or(&get, "REFRESH_INTERVAL_SECS", 300)?;
        let thresholds = Thresholds {
            brief_call_secs: parse_or(&get, "OUTCOME_BRIEF_CALL_SECS", defaults.brief_call_secs)?,
            voicemail_max_secs: parse_or(
                &get,
                "OUTCOME_VOICEMAIL_MAX_SECS",
                defaults.voicemail_max_secs,
            )?,
            immediate_hangup_secs: parse_or(
                &get,
                "OUTCOME_IMMEDIATE_HANGUP_SECS",
                defaults.immediate_hangup_secs,
            )?,
            quick_decline_secs: parse_or(
                &get,
                "OUTCOME_QUICK_DECLINE_SECS",
                defaults.quick_decline_secs,
            )?,
            short_call_secs: parse_or(&get, "OUTCOME_SHORT_CALL_SECS", defaults.short_call_secs)?,
            min_connected_cost: parse_or::<Decimal>(
                &get,
                "OUTCOME_MIN_CONNECTED_COST",
                defaults.min_connected_cost,
            )?,
        };

        Ok(Self {
            bind_addr: parse_or(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            database_url: get("DATABASE_URL"),
            vapi_base_url: get("VAPI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_VAPI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            server_url_secret: get("VAPI_SERVER_URL_SECRET"),
            http_timeout: Duration::from_secs(positive(
                "HTTP_TIMEOUT_SECS",
                parse_or(&get, "HTTP_TIMEOUT_SECS", 30)?,
            )?),
            dispatch_interval: Duration::from_secs(positive(
                "DISPATCH_INTERVAL_SECS",
                parse_or(&get, "DISPATCH_INTERVAL_SECS", 60)?,
            )?),
            refresh_interval: (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs)),
            refresh_window: Duration::from_secs(
                parse_or::<u64>(&get, "REFRESH_WINDOW_HOURS", 24)? * 3_600,
            ),
            recordings_dir: get("RECORDINGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("recordings")),
            webhook_log_dir: get("WEBHOOK_LOG_DIR").map(PathBuf::from),
            thresholds,
        })
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value,
            reason: e.to_string(),
        }),
    }
}

fn positive(var: &'static str, secs: u64) -> Result<u64, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: secs.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:3000");
        assert_eq!(config.vapi_base_url, DEFAULT_VAPI_BASE_URL);
        assert!(config.server_url_secret.is_none());
        assert!(config.database_url.is_none());
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.refresh_interval, Some(Duration::from_secs(300)));
        assert_eq!(config.refresh_window, Duration::from_secs(24 * 3_600));
        assert_eq!(config.thresholds, Thresholds::default());
    }

    #[test]
    fn blank_secret_disables_verification() {
        let config = config_from(&[("VAPI_SERVER_URL_SECRET", "  ")]).unwrap();
        assert!(config.server_url_secret.is_none());
    }

    #[test]
    fn threshold_overrides_are_parsed() {
        let config = config_from(&[
            ("OUTCOME_SHORT_CALL_SECS", "50"),
            ("OUTCOME_MIN_CONNECTED_COST", "0.02"),
            ("VAPI_BASE_URL", "http://localhost:9000/"),
        ])
        .unwrap();
        assert_eq!(config.thresholds.short_call_secs, 50);
        assert_eq!(config.thresholds.min_connected_cost, Decimal::new(2, 2));
        assert_eq!(config.vapi_base_url, "http://localhost:9000");
    }

    #[test]
    fn zero_refresh_interval_disables_sweep() {
        let config = config_from(&[("REFRESH_INTERVAL_SECS", "0")]).unwrap();
        assert!(config.refresh_interval.is_none());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = config_from(&[("HTTP_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("HTTP_TIMEOUT_SECS"));
        assert!(config_from(&[("DISPATCH_INTERVAL_SECS", "0")]).is_err());
    }
}
