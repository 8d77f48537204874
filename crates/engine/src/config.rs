//! Configuration
//!
//! Connection settings per deployment environment, pool sizing from
//! `PG_*` variables, and the file locations the loader reads from.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Local,
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Environment::Local),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(ConfigError::InvalidValue {
                field: "environment".to_string(),
                value: s.to_string(),
                expected: "local, development, or production".to_string(),
            }),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_str = match self {
            Environment::Local => "local",
            Environment::Development => "development",
            Environment::Production => "production",
        };
        write!(f, "{}", env_str)
    }
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Database connection and pool settings
#[derive(Clone, PartialEq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    /// Applied as `search_path` when set
    pub schema: Option<String>,
    pub ssl_mode: String,
    /// Authenticate through the proxy's IAM identity; no password is sent
    pub use_iam_auth: bool,
    /// Cloud SQL instance the proxy connects to
    pub instance_name: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_idle_time: Duration,
    pub max_lifetime: Duration,
}

impl DatabaseConfig {
    /// Build the configuration for `service` in `environment` from process
    /// environment variables
    pub fn from_env(environment: Environment, service: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(environment, service, |key| env::var(key).ok())
    }

    /// Build the configuration reading variables through `lookup`
    pub fn from_lookup<F>(environment: Environment, service: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if service.trim().is_empty() {
            return Err(ConfigError::Missing {
                field: "service".to_string(),
            });
        }

        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let max_connections = parse_var(&var, "PG_MAX_CONNS", 50u32, "a positive integer")?;
        let min_connections = parse_var(&var, "PG_MIN_CONNS", 5u32, "a non-negative integer")?;
        let max_idle_time = duration_var(&var, "PG_MAX_IDLE_TIME", Duration::from_secs(5 * 60))?;
        let max_lifetime = duration_var(&var, "PG_MAX_LIFETIME", Duration::from_secs(60 * 60))?;

        if max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "PG_MAX_CONNS".to_string(),
                value: "0".to_string(),
                expected: "a positive integer".to_string(),
            });
        }

        let mut config = match environment {
            Environment::Local => Self {
                host: "localhost".to_string(),
                port: 5432,
                user: "postgres".to_string(),
                password: Some("postgres".to_string()),
                database: "tidemark".to_string(),
                schema: Some(service.to_string()),
                ssl_mode: "disable".to_string(),
                use_iam_auth: false,
                instance_name: None,
                max_connections,
                min_connections,
                max_idle_time,
                max_lifetime,
            },
            Environment::Development | Environment::Production => {
                // `<service>_DB_USER` as given, then the shell-friendly `BILLING_DB_USER` form.
                let prefix = service.to_uppercase().replace('-', "_");
                let service_var = |suffix: &str| {
                    var(format!("{}_{}", service, suffix).as_str())
                        .or_else(|| var(format!("{}_{}", prefix, suffix).as_str()))
                };
                Self {
                    // The Cloud SQL proxy always listens locally.
                    host: "localhost".to_string(),
                    port: 5432,
                    user: service_var("DB_USER").unwrap_or_else(|| "postgres".to_string()),
                    password: service_var("DB_PASSWORD"),
                    database: format!("tidemark_{}", service),
                    schema: (environment == Environment::Development).then(|| service.to_string()),
                    ssl_mode: "disable".to_string(),
                    use_iam_auth: environment.is_production(),
                    instance_name: var("INSTANCE_CONNECTION_NAME"),
                    max_connections,
                    min_connections,
                    max_idle_time,
                    max_lifetime,
                }
            }
        };

        if let Some(database_url) = var("DATABASE_URL") {
            config.apply_url(&database_url)?;
        }

        Ok(config)
    }

    /// Override connection fields from a `postgres://` URL
    fn apply_url(&mut self, database_url: &str) -> Result<(), ConfigError> {
        let invalid = |expected: &str| ConfigError::InvalidValue {
            field: "DATABASE_URL".to_string(),
            value: redact_url(database_url),
            expected: expected.to_string(),
        };

        let url = url::Url::parse(database_url).map_err(|_| invalid("a valid URL"))?;
        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return Err(invalid("a postgres:// or postgresql:// URL"));
        }

        if let Some(host) = url.host_str() {
            self.host = host.to_string();
        }
        if let Some(port) = url.port() {
            self.port = port;
        }
        if !url.username().is_empty() {
            self.user = url.username().to_string();
        }
        if let Some(password) = url.password() {
            self.password = Some(password.to_string());
        }

        let database = url.path().trim_start_matches('/');
        if !database.is_empty() {
            self.database = database.to_string();
        }

        if let Some((_, ssl_mode)) = url.query_pairs().find(|(key, _)| key == "sslmode") {
            self.ssl_mode = ssl_mode.into_owned();
        }

        Ok(())
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("use_iam_auth", &self.use_iam_auth)
            .field("instance_name", &self.instance_name)
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("max_idle_time", &self.max_idle_time)
            .field("max_lifetime", &self.max_lifetime)
            .finish()
    }
}

/// Whether migrations must ship a down script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownPolicy {
    /// An up file alone loads with no down script
    #[default]
    Optional,
    /// An up file without a matching down file is a load error
    Required,
}

/// Where the loader finds migration and seed files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub migrations_dir: PathBuf,
    pub seeds_dir: PathBuf,
    pub down_policy: DownPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("config/db/migrations"),
            seeds_dir: PathBuf::from("config/db/seeds"),
            down_policy: DownPolicy::Optional,
        }
    }
}

/// Parse a duration such as `30s`, `1h30m`, `500ms` or `1.5h`
///
/// Units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A bare integer is
/// taken as seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if value.is_empty() {
        return None;
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut rest = value;
    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let (number, tail) = rest.split_at(rest.find(|c: char| !is_number(c)).unwrap_or(rest.len()));
        let (unit, tail) = tail.split_at(tail.find(is_number).unwrap_or(tail.len()));
        let nanos_per_unit: u64 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 60 * 60 * 1_000_000_000,
            _ => return None,
        };
        total = total.checked_add(scaled_nanos(number, nanos_per_unit)?)?;
        rest = tail;
    }
    Some(total)
}

/// `number` (digits with an optional fraction) times `nanos_per_unit`
fn scaled_nanos(number: &str, nanos_per_unit: u64) -> Option<Duration> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }

    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut nanos = whole.checked_mul(nanos_per_unit)?;

    if !fraction.is_empty() {
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // Digits past nanosecond precision of the largest unit change nothing.
        let digits = &fraction[..fraction.len().min(18)];
        let numerator: u128 = digits.parse().ok()?;
        let scale = 10u128.pow(digits.len() as u32);
        let extra = u64::try_from(numerator * u128::from(nanos_per_unit) / scale).ok()?;
        nanos = nanos.checked_add(extra)?;
    }
    Some(Duration::from_nanos(nanos))
}

fn parse_var<T, V>(var: &V, key: &str, default: T, expected: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            field: key.to_string(),
            value,
            expected: expected.to_string(),
        }),
        None => Ok(default),
    }
}

fn duration_var<V>(var: &V, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(value) => parse_duration(&value).ok_or_else(|| ConfigError::InvalidValue {
            field: key.to_string(),
            value,
            expected: "a duration such as 30s, 1h30m, 500ms or plain seconds".to_string(),
        }),
        None => Ok(default),
    }
}

fn redact_url(database_url: &str) -> String {
    match url::Url::parse(database_url) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        Ok(url) => url.to_string(),
        Err(_) => "<unparseable>".to_string(),
    }
}
