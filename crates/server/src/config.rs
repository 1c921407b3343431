use serde::Deserialize;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SchedulerConfig {
    /// How often each active emergency is evaluated for escalation and resends.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Upper bound between dispatch rounds; enqueues wake the loop earlier.
    #[serde(default = "default_dispatch_interval_secs")]
    pub dispatch_interval_secs: u64,
    /// Concurrent channel sends per dispatch round.
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            dispatch_interval_secs: default_dispatch_interval_secs(),
            dispatch_concurrency: default_dispatch_concurrency(),
        }
    }
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn default_dispatch_interval_secs() -> u64 {
    1
}

fn default_dispatch_concurrency() -> usize {
    32
}

#[derive(Clone, Debug, Deserialize)]
pub struct RetentionConfig {
    /// Days archived emergencies are kept. 0 disables purging.
    #[serde(default = "default_archive_retention_days")]
    pub archive_retention_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            archive_retention_days: default_archive_retention_days(),
        }
    }
}

fn default_archive_retention_days() -> u32 {
    90
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Email transport. When absent, email sends go to the logging channel.
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Validation("database_url must be set".into()));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "scheduler.tick_interval_secs must be > 0".into(),
            ));
        }
        if self.scheduler.dispatch_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "scheduler.dispatch_interval_secs must be > 0".into(),
            ));
        }
        if self.scheduler.dispatch_concurrency == 0 {
            return Err(ConfigError::Validation(
                "scheduler.dispatch_concurrency must be > 0".into(),
            ));
        }
        if let Some(smtp) = &self.smtp {
            if smtp.port == 0 {
                return Err(ConfigError::Validation("smtp.port must be > 0".into()));
            }
            if smtp.from.parse::<lettre::message::Mailbox>().is_err() {
                return Err(ConfigError::Validation(format!(
                    "smtp.from '{}' is not a valid mailbox",
                    smtp.from
                )));
            }
        }
        Ok(())
    }
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any environment variable matching the key path separated by double
/// underscores (e.g. `SCHEDULER__TICK_INTERVAL_SECS`) overrides the file value.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from("config.yaml")
}

/// Same as [`load_config`] with an explicit file path. The file is optional so
/// a deployment can be configured from the environment alone.
pub fn load_config_from(path: &str) -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

/// Convenience helper for binaries wanting panic-on-error behaviour.
pub fn load_config_or_panic() -> AppConfig {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}
