//! Connection string resolution.
//!
//! `scheme://[user[:password]@]host[:port][/stream[/group[/consumer]]][?options]`,
//! `scheme:///path/to/socket`, a comma-separated list of DSNs (cluster), or
//! `scheme:?host[h1:p1]&host[h2:p2]` (cluster, or sentinels when a sentinel master
//! is configured).

use std::fmt;

use serde_json::Value;

use crate::error::{QueueError, Result};

use super::options::{ConnectionOptions, Credentials, TransportOptions};

const DEFAULT_PORT: u16 = 6379;
const SCHEMES: &[&str] = &["redis", "rediss", "valkey", "valkeys"];

/// A TCP address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Where the backend lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// One server over TCP.
    Single { host: String, port: u16, tls: bool },
    /// One server over a unix socket.
    Unix { path: String },
    /// A Redis Cluster, reached through any of its nodes.
    Cluster { nodes: Vec<HostPort>, tls: bool },
    /// A master discovered through sentinels.
    Sentinel {
        sentinels: Vec<HostPort>,
        master: String,
        tls: bool,
    },
}

/// Immutable configuration of a [`Connection`](crate::queue::Connection).
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub endpoint: Endpoint,
    pub options: ConnectionOptions,
}

impl ConnectionConfig {
    /// Config for a single TCP server with default options.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            options: ConnectionOptions::default(),
        }
    }

    /// Key of the sorted set holding delayed messages.
    ///
    /// On a cluster the key must hash to the stream's slot, so an untagged
    /// stream name becomes the hash tag of the delay key.
    pub fn delay_queue_key(&self) -> String {
        let stream = &self.options.stream;
        match self.endpoint {
            Endpoint::Cluster { .. } if hash_tag(stream).is_none() => format!("{{{}}}__queue", stream),
            _ => format!("{}__queue", stream),
        }
    }
}

/// The part of `key` Redis Cluster hashes on, when `key` carries a hash tag.
fn hash_tag(key: &str) -> Option<&str> {
    let open = key.find('{')?;
    let len = key[open + 1..].find('}')?;
    (len > 0).then(|| &key[open + 1..open + 1 + len])
}

/// Whether `dsn` names a scheme this transport handles.
pub fn supports(dsn: &str) -> bool {
    dsn.split_once(':')
        .is_some_and(|(scheme, _)| SCHEMES.contains(&scheme))
}

/// One DSN, split into its parts.
#[derive(Debug, Default, Clone)]
struct ParsedDsn {
    tls: bool,
    user: Option<String>,
    password: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: String,
    query: Vec<(String, String)>,
}

/// Resolve a DSN plus explicit options into a [`ConnectionConfig`].
///
/// Explicit `options` override DSN query parameters; DSN path segments fill
/// `stream`, `group` and `consumer` when present; an explicit `auth` option
/// overrides credentials embedded in the DSN.
pub fn resolve(dsn: &str, options: &TransportOptions) -> Result<ConnectionConfig> {
    let parts: Vec<ParsedDsn> = dsn
        .split(',')
        .map(parse_one)
        .collect::<Result<_>>()?;

    let clustered = parts.len() > 1;
    let cluster_nodes = if clustered {
        parts
            .iter()
            .map(|p| {
                let host = p.host.clone().ok_or_else(|| {
                    QueueError::config(
                        "Missing host in DSN, it must be defined when using Redis Cluster.",
                    )
                })?;
                Ok(HostPort::new(host, p.port.unwrap_or(DEFAULT_PORT)))
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        Vec::new()
    };

    // The last DSN wins for everything except the host list.
    let mut merged_query: Vec<(String, String)> = Vec::new();
    for p in &parts {
        merged_query.extend(p.query.iter().cloned());
    }
    let last = parts
        .last()
        .cloned()
        .ok_or_else(|| QueueError::config("The given Redis DSN is invalid."))?;
    let tls = last.tls;

    let mut query_hosts: Vec<String> = Vec::new();
    let mut merged: TransportOptions = TransportOptions::new();
    for (key, value) in merged_query {
        if let Some(host) = key.strip_prefix("host[").and_then(|k| k.strip_suffix(']')) {
            if !query_hosts.contains(&host.to_string()) {
                query_hosts.push(host.to_string());
            }
        } else {
            merged.insert(key, Value::String(value));
        }
    }
    for (key, value) in options {
        merged.insert(key.clone(), value.clone());
    }

    let mut opts = ConnectionOptions::from_map(&merged)?;

    if last.host.is_some() || !query_hosts.is_empty() {
        let segments: Vec<&str> = last
            .path
            .trim_end_matches('/')
            .split('/')
            .skip(1)
            .collect();
        if let Some(stream) = segments.first() {
            opts.stream = stream.to_string();
        }
        if let Some(group) = segments.get(1) {
            opts.group = group.to_string();
        }
        if let Some(consumer) = segments.get(2) {
            opts.consumer = consumer.to_string();
        }
    }

    if opts.auth.is_none() {
        let user = last.user.clone().filter(|u| !u.is_empty());
        let password = last.password.clone().filter(|p| !p.is_empty());
        opts.auth = match (user, password) {
            (Some(user), Some(password)) => Some(Credentials::UserPassword { user, password }),
            (None, Some(password)) => Some(Credentials::Password(password)),
            (Some(user), None) => Some(Credentials::Password(user)),
            (None, None) => None,
        };
    }

    let endpoint = if !query_hosts.is_empty() {
        let mut nodes = Vec::with_capacity(query_hosts.len());
        for entry in &query_hosts {
            match parse_host_entry(entry) {
                HostEntry::Tcp(hp) => nodes.push(hp),
                HostEntry::Unix(path) => {
                    if query_hosts.len() == 1 && opts.sentinel_master.is_none() {
                        return finish(Endpoint::Unix { path }, opts);
                    }
                    return Err(QueueError::config(format!(
                        "Unix socket \"{}\" cannot be used as a cluster node or sentinel.",
                        path
                    )));
                }
            }
        }
        match opts.sentinel_master.clone() {
            Some(master) => Endpoint::Sentinel {
                sentinels: nodes,
                master,
                tls,
            },
            None => Endpoint::Cluster { nodes, tls },
        }
    } else if clustered {
        match opts.sentinel_master.clone() {
            Some(master) => Endpoint::Sentinel {
                sentinels: cluster_nodes,
                master,
                tls,
            },
            None => Endpoint::Cluster {
                nodes: cluster_nodes,
                tls,
            },
        }
    } else if let Some(host) = last.host.clone() {
        let port = last.port.unwrap_or(DEFAULT_PORT);
        match opts.sentinel_master.clone() {
            Some(master) => Endpoint::Sentinel {
                sentinels: vec![HostPort::new(host, port)],
                master,
                tls,
            },
            None => Endpoint::Single { host, port, tls },
        }
    } else {
        if last.path.is_empty() || last.path == "/" {
            return Err(QueueError::config(format!("Invalid Redis DSN: \"{}\".", redact(dsn))));
        }
        if opts.sentinel_master.is_some() {
            return Err(QueueError::config(
                "Redis Sentinel cannot be reached through a unix socket.",
            ));
        }
        Endpoint::Unix {
            path: last.path.clone(),
        }
    };

    finish(endpoint, opts)
}

fn finish(endpoint: Endpoint, options: ConnectionOptions) -> Result<ConnectionConfig> {
    if matches!(endpoint, Endpoint::Cluster { .. }) && options.dbindex != 0 {
        return Err(QueueError::config(
            "Redis Cluster does not support selecting a database, \"dbindex\" must be 0.",
        ));
    }
    for (key, value) in [
        ("stream", &options.stream),
        ("group", &options.group),
        ("consumer", &options.consumer),
    ] {
        if value.is_empty() {
            return Err(QueueError::config(format!(
                "\"{}\" should be configured, got an empty string.",
                key
            )));
        }
    }
    Ok(ConnectionConfig { endpoint, options })
}

enum HostEntry {
    Tcp(HostPort),
    Unix(String),
}

/// `host`, `host:port`, or a socket path (anything without a numeric port).
fn parse_host_entry(entry: &str) -> HostEntry {
    match entry.rfind(':') {
        None if entry.starts_with('/') => HostEntry::Unix(entry.to_string()),
        None => HostEntry::Tcp(HostPort::new(entry, DEFAULT_PORT)),
        Some(i) => match entry[i + 1..].parse::<u16>() {
            Ok(port) if port > 0 => {
                let host = entry[..i].trim_start_matches('[').trim_end_matches(']');
                HostEntry::Tcp(HostPort::new(host, port))
            }
            _ => HostEntry::Unix(entry[..i].to_string()),
        },
    }
}

fn parse_one(dsn: &str) -> Result<ParsedDsn> {
    let dsn = dsn.trim();
    let invalid = || QueueError::config(format!("Invalid Redis DSN: \"{}\".", redact(dsn)));

    let (scheme, rest) = dsn.split_once(':').ok_or_else(invalid)?;
    if !SCHEMES.contains(&scheme) {
        return Err(invalid());
    }
    let mut parsed = ParsedDsn {
        tls: matches!(scheme, "rediss" | "valkeys"),
        ..Default::default()
    };

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (main, query) = match rest.split_once('?') {
        Some((main, query)) => (main, Some(query)),
        None => (rest, None),
    };

    let main = match main.find('@') {
        Some(at) => {
            let userinfo = &main[..at];
            match userinfo.split_once(':') {
                Some((user, password)) => {
                    if !user.is_empty() && user != "default" {
                        parsed.user = Some(decode(user)?);
                    }
                    parsed.password = Some(decode(password)?);
                }
                None => parsed.password = Some(decode(userinfo)?),
            }
            &main[at + 1..]
        }
        None => main,
    };

    if main.starts_with('/') {
        parsed.path = main.to_string();
    } else if !main.is_empty() {
        let (authority, path) = match main.find('/') {
            Some(slash) => (&main[..slash], &main[slash..]),
            None => (main, ""),
        };
        let (host, port) = split_authority(authority).ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        parsed.host = Some(host);
        parsed.port = port;
        parsed.path = path.to_string();
    }

    if let Some(query) = query {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            parsed.query.push((decode_query(key)?, decode_query(value)?));
        }
    }

    Ok(parsed)
}

/// `host`, `host:port`, `[v6]`, `[v6]:port`.
fn split_authority(authority: &str) -> Option<(String, Option<u16>)> {
    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, after) = stripped.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if after.is_empty() => None,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), Some(port.parse().ok()?))),
        None => Some((authority.to_string(), None)),
    }
}

fn decode(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|_| QueueError::config("The given Redis DSN is invalid."))
}

fn decode_query(raw: &str) -> Result<String> {
    decode(&raw.replace('+', " "))
}

/// DSN with the userinfo part masked, safe for error messages.
fn redact(dsn: &str) -> String {
    match (dsn.find("//"), dsn.find('@')) {
        (Some(start), Some(at)) if at > start => format!("{}***{}", &dsn[..start + 2], &dsn[at..]),
        _ => dsn.to_string(),
    }
}
