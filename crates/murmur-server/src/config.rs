use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, bail};
use chrono::Duration;

use murmur_api::token::TokenConfig;
use murmur_gateway::HubConfig;

/// JWT secrets that ship in examples and must not reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

const DEFAULT_SECRET: &str = "dev-secret-change-me";

/// Process configuration, read once from `MURMUR_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: SocketAddr,
    pub socket_addr: SocketAddr,
    pub db_path: PathBuf,
    pub archive_path: PathBuf,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_hours: i64,
    pub ws_require_auth: bool,
    pub broadcast_capacity: usize,
    pub outbound_capacity: usize,
    pub rate_limit_per_minute: u32,
    /// Directory for `murmur.log`; `None` (empty `MURMUR_LOG_DIR`) logs to stdout only.
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());

        let http_addr = listen_addr(&var("MURMUR_HOST", "0.0.0.0"), &var("MURMUR_PORT", "4000"))?;
        let socket_addr = listen_addr(
            &var("MURMUR_SOCKET_HOST", "0.0.0.0"),
            &var("MURMUR_SOCKET_PORT", "8080"),
        )?;

        let access_ttl_minutes: i64 = parse("MURMUR_ACCESS_TTL_MINUTES", &var("MURMUR_ACCESS_TTL_MINUTES", "15"))?;
        let refresh_ttl_hours: i64 = parse("MURMUR_REFRESH_TTL_HOURS", &var("MURMUR_REFRESH_TTL_HOURS", "24"))?;
        if access_ttl_minutes <= 0 || refresh_ttl_hours <= 0 {
            bail!("token lifetimes must be positive");
        }

        let broadcast_capacity: usize =
            parse("MURMUR_BROADCAST_CAPACITY", &var("MURMUR_BROADCAST_CAPACITY", "1024"))?;
        let outbound_capacity: usize =
            parse("MURMUR_OUTBOUND_CAPACITY", &var("MURMUR_OUTBOUND_CAPACITY", "256"))?;
        if broadcast_capacity == 0 || outbound_capacity == 0 {
            bail!("queue capacities must be at least 1");
        }

        let rate_limit_per_minute: u32 =
            parse("MURMUR_RATE_LIMIT_PER_MINUTE", &var("MURMUR_RATE_LIMIT_PER_MINUTE", "50"))?;
        if rate_limit_per_minute == 0 {
            bail!("MURMUR_RATE_LIMIT_PER_MINUTE must be at least 1");
        }

        Ok(Self {
            http_addr,
            socket_addr,
            db_path: var("MURMUR_DB_PATH", "murmur.db").into(),
            archive_path: var("MURMUR_ARCHIVE_PATH", "murmur-archive.db").into(),
            jwt_secret: var("MURMUR_JWT_SECRET", DEFAULT_SECRET),
            jwt_issuer: var("MURMUR_JWT_ISSUER", "murmur"),
            access_ttl_minutes,
            refresh_ttl_hours,
            ws_require_auth: parse_flag("MURMUR_WS_REQUIRE_AUTH", &var("MURMUR_WS_REQUIRE_AUTH", "false"))?,
            broadcast_capacity,
            outbound_capacity,
            rate_limit_per_minute,
            log_dir: Some(var("MURMUR_LOG_DIR", "logs"))
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    pub fn uses_placeholder_secret(&self) -> bool {
        self.jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&self.jwt_secret.as_str())
    }

    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            access_ttl: Duration::minutes(self.access_ttl_minutes),
            refresh_ttl: Duration::hours(self.refresh_ttl_hours),
            ..TokenConfig::new(self.jwt_secret.clone(), self.jwt_issuer.clone())
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            inbound_capacity: self.broadcast_capacity,
            outbound_capacity: self.outbound_capacity,
        }
    }
}

fn listen_addr(host: &str, port: &str) -> anyhow::Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))
}

fn parse<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("invalid {key}: {raw:?}"))
}

fn parse_flag(key: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => bail!("invalid {key}: {raw:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:4000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.socket_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.db_path, PathBuf::from("murmur.db"));
        assert_eq!(config.archive_path, PathBuf::from("murmur-archive.db"));
        assert_eq!(config.jwt_issuer, "murmur");
        assert!(!config.ws_require_auth);
        assert_eq!(config.rate_limit_per_minute, 50);
        assert_eq!(config.log_dir, Some(PathBuf::from("logs")));
        assert!(config.uses_placeholder_secret());

        let tokens = config.token_config();
        assert_eq!(tokens.access_ttl, Duration::minutes(15));
        assert_eq!(tokens.refresh_ttl, Duration::hours(24));

        let hub = config.hub_config();
        assert_eq!(hub.inbound_capacity, 1024);
        assert_eq!(hub.outbound_capacity, 256);
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("MURMUR_PORT", "9000"),
            ("MURMUR_SOCKET_HOST", "127.0.0.1"),
            ("MURMUR_JWT_SECRET", "a-real-secret"),
            ("MURMUR_ACCESS_TTL_MINUTES", "5"),
            ("MURMUR_WS_REQUIRE_AUTH", "TRUE"),
        ])
        .unwrap();
        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.socket_addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert!(!config.uses_placeholder_secret());
        assert!(config.ws_require_auth);
        assert_eq!(config.token_config().access_ttl, Duration::minutes(5));
        assert_eq!(config.token_config().secret, "a-real-secret");
    }

    #[test]
    fn log_dir_can_move_or_be_disabled() {
        let config = load(&[("MURMUR_LOG_DIR", "/var/log/murmur")]).unwrap();
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/murmur")));

        let config = load(&[("MURMUR_LOG_DIR", "")]).unwrap();
        assert_eq!(config.log_dir, None);
    }

    #[test]
    fn bad_values_are_errors() {
        assert!(load(&[("MURMUR_PORT", "http")]).is_err());
        assert!(load(&[("MURMUR_WS_REQUIRE_AUTH", "maybe")]).is_err());
        assert!(load(&[("MURMUR_REFRESH_TTL_HOURS", "0")]).is_err());
        assert!(load(&[("MURMUR_OUTBOUND_CAPACITY", "0")]).is_err());
        assert!(load(&[("MURMUR_RATE_LIMIT_PER_MINUTE", "-1")]).is_err());
    }
}
