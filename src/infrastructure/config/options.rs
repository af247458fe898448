//! Recognized transport options and their coercion rules.
//!
//! Options arrive as a map of JSON values: from the DSN query string (always
//! strings), from settings files or environment variables, or built in code.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde_json::Value;

use crate::error::{QueueError, Result};

/// Raw option map as accepted by [`resolve`](super::resolve).
pub type TransportOptions = BTreeMap<String, Value>;

/// Every option name the transport understands.
pub const KNOWN_OPTIONS: &[&str] = &[
    "stream",
    "group",
    "consumer",
    "auto_setup",
    "serializer",
    "stream_max_entries",
    "delete_after_ack",
    "delete_after_reject",
    "redeliver_timeout",
    "claim_interval",
    "lazy",
    "dbindex",
    "auth",
    "sentinel_master",
    "redis_sentinel",
    "timeout",
    "read_timeout",
    "block_timeout",
];

const DEFAULT_STREAM: &str = "messages";
const DEFAULT_GROUP: &str = "symfony";
const DEFAULT_CONSUMER: &str = "consumer";
const DEFAULT_REDELIVER_TIMEOUT_MS: u64 = 3_600_000; // 1 hour
const DEFAULT_CLAIM_INTERVAL_MS: u64 = 60_000; // 1 minute

/// Credentials sent with `AUTH`.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// `AUTH <password>`
    Password(String),
    /// `AUTH <user> <password>`
    UserPassword { user: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(***)"),
            Credentials::UserPassword { user, .. } => {
                write!(f, "UserPassword {{ user: {:?}, password: *** }}", user)
            }
        }
    }
}

/// Encoding of the envelope stored in a stream entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// UTF-8 JSON text.
    #[default]
    Json,
    /// Compact binary (bincode).
    Bincode,
}

impl WireFormat {
    /// Parse a `serializer` option value.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "0" | "none" | "json" | "plain" => Some(WireFormat::Json),
            "1" | "binary" | "bincode" => Some(WireFormat::Bincode),
            _ => None,
        }
    }
}

/// Typed transport options with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub auto_setup: bool,
    pub serializer: WireFormat,
    /// Approximate stream length cap; 0 disables trimming.
    pub stream_max_entries: usize,
    pub delete_after_ack: bool,
    pub delete_after_reject: bool,
    /// Idle time after which another consumer may claim a pending entry.
    pub redeliver_timeout: Duration,
    /// Minimum spacing between claim attempts.
    pub claim_interval: Duration,
    pub lazy: bool,
    pub dbindex: i64,
    pub auth: Option<Credentials>,
    pub sentinel_master: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    /// Blocking time for reads of new entries; `None` reads without blocking.
    pub block_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            stream: DEFAULT_STREAM.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: DEFAULT_CONSUMER.to_string(),
            auto_setup: true,
            serializer: WireFormat::Json,
            stream_max_entries: 0,
            delete_after_ack: true,
            delete_after_reject: true,
            redeliver_timeout: Duration::from_millis(DEFAULT_REDELIVER_TIMEOUT_MS),
            claim_interval: Duration::from_millis(DEFAULT_CLAIM_INTERVAL_MS),
            lazy: false,
            dbindex: 0,
            auth: None,
            sentinel_master: None,
            connect_timeout: None,
            read_timeout: None,
            block_timeout: None,
        }
    }
}

impl ConnectionOptions {
    /// Build typed options from a raw map, rejecting unknown names.
    pub fn from_map(map: &TransportOptions) -> Result<Self> {
        let unknown: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|k| !KNOWN_OPTIONS.contains(k))
            .collect();
        if !unknown.is_empty() {
            return Err(QueueError::config(format!(
                "Invalid option(s) \"{}\" passed to the Redis transport.",
                unknown.join("\", \"")
            )));
        }

        if has_value(map, "sentinel_master") && has_value(map, "redis_sentinel") {
            return Err(QueueError::config(
                "Cannot use both \"redis_sentinel\" and \"sentinel_master\" at the same time.",
            ));
        }

        let mut options = ConnectionOptions::default();

        for (name, value) in map {
            match name.as_str() {
                "stream" => options.stream = as_string(name, value)?,
                "group" => options.group = as_string(name, value)?,
                "consumer" => options.consumer = as_string(name, value)?,
                "auto_setup" => options.auto_setup = as_bool(name, value)?,
                "serializer" => {
                    let tag = as_string(name, value)?;
                    options.serializer = WireFormat::from_tag(&tag).ok_or_else(|| {
                        QueueError::config(format!("Unsupported serializer \"{}\".", tag))
                    })?;
                }
                "stream_max_entries" => {
                    options.stream_max_entries = as_u64(name, value)? as usize
                }
                "delete_after_ack" => options.delete_after_ack = as_bool(name, value)?,
                "delete_after_reject" => options.delete_after_reject = as_bool(name, value)?,
                "redeliver_timeout" => {
                    options.redeliver_timeout = Duration::from_millis(as_u64(name, value)?)
                }
                "claim_interval" => {
                    options.claim_interval = Duration::from_millis(as_u64(name, value)?)
                }
                "lazy" => options.lazy = as_bool(name, value)?,
                "dbindex" => options.dbindex = as_i64(name, value)?,
                "auth" => options.auth = as_credentials(value)?,
                "sentinel_master" | "redis_sentinel" => {
                    if !value.is_null() {
                        options.sentinel_master = Some(as_string(name, value)?);
                    }
                }
                "timeout" => options.connect_timeout = as_seconds(name, value)?,
                "read_timeout" => options.read_timeout = as_seconds(name, value)?,
                "block_timeout" => {
                    let ms = as_u64(name, value)?;
                    options.block_timeout = (ms > 0).then(|| Duration::from_millis(ms));
                }
                _ => unreachable!("option names are checked above"),
            }
        }

        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("stream", &self.stream),
            ("group", &self.group),
            ("consumer", &self.consumer),
        ] {
            if value.is_empty() {
                return Err(QueueError::config(format!(
                    "\"{}\" should be configured, got an empty string.",
                    key
                )));
            }
        }
        if self.dbindex < 0 {
            return Err(QueueError::config("\"dbindex\" must not be negative."));
        }
        Ok(())
    }
}

fn has_value(map: &TransportOptions, key: &str) -> bool {
    map.get(key).is_some_and(|v| !v.is_null())
}

fn invalid(name: &str, value: &Value, expected: &str) -> QueueError {
    QueueError::config(format!(
        "Option \"{}\" expects {}, got {}.",
        name, expected, value
    ))
}

fn as_string(name: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(invalid(name, other, "a string")),
    }
}

fn as_bool(name: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_u64() {
            Some(1) => Ok(true),
            Some(0) => Ok(false),
            _ => Err(invalid(name, value, "a boolean")),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Ok(true),
            "0" | "false" | "off" | "no" | "" => Ok(false),
            _ => Err(invalid(name, value, "a boolean")),
        },
        other => Err(invalid(name, other, "a boolean")),
    }
}

fn as_u64(name: &str, value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n.as_u64().ok_or_else(|| invalid(name, value, "a non-negative integer")),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid(name, value, "a non-negative integer")),
        other => Err(invalid(name, other, "a non-negative integer")),
    }
}

fn as_i64(name: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| invalid(name, value, "an integer")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(name, value, "an integer")),
        other => Err(invalid(name, other, "an integer")),
    }
}

/// Seconds as a float; zero means unlimited.
fn as_seconds(name: &str, value: &Value) -> Result<Option<Duration>> {
    let secs = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|s| s.is_finite() && *s >= 0.0)
    .ok_or_else(|| invalid(name, value, "a number of seconds"))?;

    Ok((secs > 0.0).then(|| Duration::from_secs_f64(secs)))
}

fn as_credentials(value: &Value) -> Result<Option<Credentials>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(Credentials::Password(s.clone()))),
        Value::Number(n) => Ok(Some(Credentials::Password(n.to_string()))),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|v| as_string("auth", v))
                .collect::<Result<_>>()?;
            match parts.as_slice() {
                [password] => Ok(Some(Credentials::Password(password.clone()))),
                [user, password] => Ok(Some(Credentials::UserPassword {
                    user: user.clone(),
                    password: password.clone(),
                })),
                _ => Err(invalid("auth", value, "a password or a [user, password] pair")),
            }
        }
        other => Err(invalid("auth", other, "a password or a [user, password] pair")),
    }
}
