//! Configuration types, built once at startup from environment variables.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default chat API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Mailbox connection settings.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub folder: String,
    pub username: String,
    pub password: SecretString,
    /// Send an RFC 2971 `ID` command after login. Some providers (163.com)
    /// refuse `SELECT` from clients that never identified themselves.
    pub send_id: bool,
    /// Read/write timeout applied to every socket call.
    pub timeout: Duration,
}

/// Chat delivery settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub api_base: String,
    pub bot_token: SecretString,
    pub destinations: Vec<String>,
    pub timeout: Duration,
}

/// Poll loop and backoff settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Only the most recent N unseen messages are processed per cycle.
    pub max_messages_per_cycle: usize,
    /// Decoded bodies are cut to this many characters.
    pub body_prefix_chars: usize,
    pub max_errors: u32,
    pub cooldown: Duration,
    /// Error counter value after a cooldown. Non-zero so that a still-broken
    /// mailbox reaches the next cooldown sooner.
    pub error_reset_to: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_messages_per_cycle: 3,
            body_prefix_chars: 1000,
            max_errors: 5,
            cooldown: Duration::from_secs(60),
            error_reset_to: 2,
        }
    }
}

/// Keyword lists for the filter policy. `None` keeps the built-in list.
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    pub keywords: Option<Vec<String>>,
    pub exclude_terms: Option<Vec<String>>,
}

/// Optional self-ping.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    pub url: String,
    pub interval: Duration,
}

/// Full relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mailbox: MailboxConfig,
    pub dispatch: DispatchConfig,
    pub scheduler: SchedulerConfig,
    pub filter: FilterConfig,
    /// Health endpoint port. `None` disables the endpoint.
    pub health_port: Option<u16>,
    pub keepalive: Option<KeepaliveConfig>,
}

impl Config {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let username = vars.required(&["EMAIL_ADDRESS", "EMAIL_163"])?;
        let password = vars.required(&["EMAIL_PASSWORD", "PASSWORD_163"])?;
        let bot_token = vars.required(&["BOT_TOKEN"])?;
        let destinations = split_list(&vars.required(&["CHAT_ID"])?);
        if destinations.is_empty() {
            return Err(ConfigError::MissingEnvVar("CHAT_ID".into()));
        }

        let mailbox = MailboxConfig {
            host: vars
                .get("IMAP_HOST")
                .unwrap_or_else(|| "imap.163.com".to_string()),
            port: vars.parsed("IMAP_PORT", 993)?,
            folder: vars.get("IMAP_FOLDER").unwrap_or_else(|| "INBOX".to_string()),
            username,
            password: SecretString::from(password),
            send_id: vars.flag("IMAP_SEND_ID", true)?,
            timeout: vars.secs("IMAP_TIMEOUT_SECS", 10)?,
        };

        let dispatch = DispatchConfig {
            api_base: vars
                .get("TELEGRAM_API_BASE")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            bot_token: SecretString::from(bot_token),
            destinations,
            timeout: vars.secs("DISPATCH_TIMEOUT_SECS", 5)?,
        };

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            poll_interval: vars.secs("POLL_INTERVAL_SECS", defaults.poll_interval.as_secs())?,
            max_messages_per_cycle: vars
                .parsed("MAX_MESSAGES_PER_CYCLE", defaults.max_messages_per_cycle)?,
            body_prefix_chars: vars.parsed("BODY_PREFIX_CHARS", defaults.body_prefix_chars)?,
            max_errors: vars.parsed("MAX_ERRORS", defaults.max_errors)?,
            cooldown: Duration::from_secs(
                vars.parsed("COOLDOWN_SECS", defaults.cooldown.as_secs())?,
            ),
            error_reset_to: vars.parsed("ERROR_RESET_TO", defaults.error_reset_to)?,
        };
        validate_scheduler(&scheduler)?;

        let filter = FilterConfig {
            keywords: vars.get("KEYWORDS").map(|s| split_list(&s)),
            exclude_terms: vars.get("EXCLUDE_TERMS").map(|s| split_list(&s)),
        };

        let health_port = match vars.get("PORT") {
            Some(raw) => Some(parse_value("PORT", &raw)?),
            None => None,
        };

        let keepalive = match vars.get("KEEPALIVE_URL") {
            Some(url) => Some(KeepaliveConfig {
                url,
                interval: vars.secs("KEEPALIVE_INTERVAL_SECS", 600)?,
            }),
            None => None,
        };

        Ok(Self {
            mailbox,
            dispatch,
            scheduler,
            filter,
            health_port,
            keepalive,
        })
    }
}

fn validate_scheduler(cfg: &SchedulerConfig) -> Result<(), ConfigError> {
    if cfg.max_errors < 2 {
        return Err(ConfigError::InvalidValue {
            key: "MAX_ERRORS".into(),
            message: "must be at least 2".into(),
        });
    }
    if cfg.error_reset_to == 0 || cfg.error_reset_to >= cfg.max_errors {
        return Err(ConfigError::InvalidValue {
            key: "ERROR_RESET_TO".into(),
            message: format!("must be between 1 and {}", cfg.max_errors - 1),
        });
    }
    if cfg.max_messages_per_cycle == 0 {
        return Err(ConfigError::InvalidValue {
            key: "MAX_MESSAGES_PER_CYCLE".into(),
            message: "must be at least 1".into(),
        });
    }
    Ok(())
}

/// Split a comma-delimited list, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse {raw:?}"),
    })
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-blank value of `key`.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// First non-blank value among `keys`; errors with the first name.
    fn required(&self, keys: &[&str]) -> Result<String, ConfigError> {
        keys.iter()
            .find_map(|k| self.get(k))
            .ok_or_else(|| ConfigError::MissingEnvVar(keys[0].to_string()))
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }

    /// Whole seconds, at least one.
    fn secs(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        match self.parsed(key, default)? {
            0 => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "must be at least 1".into(),
            }),
            secs => Ok(Duration::from_secs(secs)),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got {v:?}"),
            }),
        }
    }
}
