use std::fs;
use std::path::{Path, PathBuf};

use crate::dispatch::DispatchPolicy;
use crate::error::Error;

pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Connection settings for the SMTP relay
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Upgrade with STARTTLS when the relay offers it
    pub use_tls: bool,
    /// Refuse to continue in plaintext if STARTTLS is not offered
    pub require_tls: bool,
    pub helo_name: String,
}

impl Default for SmtpConfig {
    fn default() -> SmtpConfig {
        SmtpConfig {
            host: "localhost".to_string(),
            port: 587,
            username: String::new(),
            password: String::new(),
            use_tls: true,
            require_tls: false,
            helo_name: "localhost".to_string(),
        }
    }
}

impl SmtpConfig {
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Retry, timeout and pacing settings for a dispatch run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub retry_attempts: u32,
    pub retry_delay: u64,
    /// Deadline in seconds for one delivery attempt, connecting included
    pub send_timeout: u64,
    pub batch_size: usize,
    pub batch_delay: u64,
    pub max_retry_window_minutes: u64,
}

impl Default for DispatchConfig {
    fn default() -> DispatchConfig {
        DispatchConfig {
            retry_attempts: 3,
            retry_delay: 5,
            send_timeout: 30,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: 60,
            max_retry_window_minutes: 10,
        }
    }
}

/// Where the unsubscribed and bounced address lists live
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SuppressionConfig {
    pub unsubscribed: Option<PathBuf>,
    pub bounced: Option<PathBuf>,
}

/// batchmail configuration settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `"Display Name <addr>"` or a bare address
    pub sender: String,
    pub subject: String,
    pub template: Option<PathBuf>,
    pub smtp: SmtpConfig,
    pub dispatch: DispatchConfig,
    pub suppression: SuppressionConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            sender: String::new(),
            subject: String::new(),
            template: None,
            smtp: SmtpConfig::default(),
            dispatch: DispatchConfig::default(),
            suppression: SuppressionConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Config::from_toml(&contents)?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Config, Error> {
        let mut config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings and correct the ones that have a safe fallback
    pub fn validate(&mut self) -> Result<(), Error> {
        if self.smtp.host.trim().is_empty() {
            return Err(Error::Config("smtp.host is empty".to_owned()));
        }
        if self.sender.trim().is_empty() {
            return Err(Error::Config("sender is empty".to_owned()));
        }
        if self.dispatch.retry_attempts == 0 {
            warn!("dispatch.retry_attempts is 0, using 1");
            self.dispatch.retry_attempts = 1;
        }
        if self.dispatch.batch_size == 0 {
            warn!("dispatch.batch_size is 0, using {}", DEFAULT_BATCH_SIZE);
            self.dispatch.batch_size = DEFAULT_BATCH_SIZE;
        }
        Ok(())
    }

    pub fn policy(&self) -> DispatchPolicy {
        DispatchPolicy::from(&self.dispatch)
    }
}
