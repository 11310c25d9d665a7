//! ORB transport configuration
//!
//! [`OrbConfig`] holds every tunable of the transport. It can be built in
//! code or loaded from `key=value` properties:
//!
//! ```text
//! orb.host=0.0.0.0
//! orb.giop.version=1.2
//! orb.acceptors=tcp:2809@default,tcp:0
//! orb.threadpool.min=2
//! orb.threadpool.max=64
//! orb.transport.reader_mode=dedicated
//! ```

use crate::connection::{ConnectionConfig, ReaderMode};
use crate::giop_version::GiopVersion;
use crate::orb_version::{LegacyPeerPolicy, OrbVersion};
use crate::service_context::{code_set, CodeSetServiceContext};
use crate::socket_factory::TCP;
use orb_threadpool::ThreadPoolConfig;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Default GIOP message size limit (16 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A property with an unusable value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

impl ConfigError {
    fn new(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// One listen endpoint, written `type:port[@name]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptorConfig {
    pub transport_type: String,
    /// 0 binds an ephemeral port
    pub port: u16,
    pub name: Option<String>,
}

impl AcceptorConfig {
    pub fn tcp(port: u16) -> Self {
        Self {
            transport_type: TCP.to_string(),
            port,
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl FromStr for AcceptorConfig {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let (endpoint, name) = match s.split_once('@') {
            Some((endpoint, name)) if !name.is_empty() => (endpoint, Some(name.to_string())),
            Some(_) => return Err("empty acceptor name".to_string()),
            None => (s, None),
        };
        let (transport_type, port) = endpoint
            .split_once(':')
            .ok_or_else(|| "expected type:port".to_string())?;
        if transport_type.is_empty() {
            return Err("empty transport type".to_string());
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("bad port {:?}: {}", port, e))?;
        Ok(Self {
            transport_type: transport_type.to_string(),
            port,
            name,
        })
    }
}

impl fmt::Display for AcceptorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport_type, self.port)?;
        if let Some(name) = &self.name {
            write!(f, "@{}", name)?;
        }
        Ok(())
    }
}

/// Configuration for a transport manager and the connections it creates
#[derive(Debug, Clone)]
pub struct OrbConfig {
    /// Host acceptors bind to and advertise
    pub host: String,
    /// Highest GIOP version this ORB speaks
    pub giop_version: GiopVersion,
    pub orb_version: OrbVersion,
    pub acceptors: Vec<AcceptorConfig>,
    pub thread_pool: ThreadPoolConfig,
    /// Bound on reading the rest of a message once its header arrived
    pub read_timeout: Duration,
    /// `None` connects without a timeout
    pub connect_timeout: Option<Duration>,
    pub max_message_size: u32,
    pub reader_mode: ReaderMode,
    /// Connection count above which idle connections are reclaimed
    pub cache_high_water_mark: usize,
    /// How many idle connections one reclaim pass closes
    pub cache_reclaim_count: usize,
    pub char_codeset: u32,
    pub wchar_codeset: u32,
    /// Stringified code base reference advertised to peers
    pub codebase: Option<String>,
    /// Peers of our ORB family older than this are legacy
    pub legacy_newer_than: OrbVersion,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            giop_version: GiopVersion::DEFAULT,
            orb_version: OrbVersion::PEORB,
            acceptors: Vec::new(),
            thread_pool: ThreadPoolConfig::new("orb-transport"),
            read_timeout: DEFAULT_READ_TIMEOUT,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            reader_mode: ReaderMode::Auto,
            cache_high_water_mark: 240,
            cache_reclaim_count: 5,
            char_codeset: code_set::ISO_8859_1,
            wchar_codeset: code_set::UTF_16,
            codebase: None,
            legacy_newer_than: OrbVersion::NEWER,
        }
    }
}

impl OrbConfig {
    /// Parse `key=value` lines. Blank lines and lines starting with `#` or
    /// `!` are skipped.
    pub fn from_properties(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                ConfigError::new(line, "", format!("line {} is not key=value", line_no + 1))
            })?;
            config.set(key.trim(), value.trim())?;
        }
        Ok(config)
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.set(key.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Apply one property. Unknown keys are logged and ignored.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "orb.host" => self.host = value.to_string(),
            "orb.giop.version" => {
                self.giop_version = GiopVersion::parse(value)
                    .map_err(|e| ConfigError::new(key, value, e.to_string()))?
            }
            "orb.version" => self.orb_version = OrbVersion::new(parse_num(key, value)?),
            "orb.acceptors" => {
                self.acceptors = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<AcceptorConfig>()
                            .map_err(|e| ConfigError::new(key, s, e))
                    })
                    .collect::<Result<_, _>>()?
            }
            "orb.threadpool.name" => self.thread_pool.name = value.to_string(),
            "orb.threadpool.min" => self.thread_pool.min_threads = parse_num(key, value)?,
            "orb.threadpool.max" => self.thread_pool.max_threads = parse_num(key, value)?,
            "orb.threadpool.idle_timeout_ms" => {
                self.thread_pool.idle_timeout = Duration::from_millis(parse_num(key, value)?)
            }
            "orb.threadpool.queues" => self.thread_pool.queues = parse_num(key, value)?,
            "orb.transport.read_timeout_ms" => {
                self.read_timeout = Duration::from_millis(parse_num(key, value)?)
            }
            "orb.transport.connect_timeout_ms" => {
                let ms: u64 = parse_num(key, value)?;
                self.connect_timeout = (ms > 0).then(|| Duration::from_millis(ms));
            }
            "orb.transport.max_message_size" => self.max_message_size = parse_num(key, value)?,
            "orb.transport.reader_mode" => {
                self.reader_mode = value
                    .parse::<ReaderMode>()
                    .map_err(|e| ConfigError::new(key, value, e))?
            }
            "orb.connection_cache.high_water_mark" => {
                self.cache_high_water_mark = parse_num(key, value)?
            }
            "orb.connection_cache.reclaim_count" => {
                self.cache_reclaim_count = parse_num(key, value)?
            }
            "orb.codeset.char" => self.char_codeset = parse_code_set(key, value)?,
            "orb.codeset.wchar" => self.wchar_codeset = parse_code_set(key, value)?,
            "orb.codebase" => {
                self.codebase = (!value.is_empty()).then(|| value.to_string());
            }
            "orb.legacy.newer_than" => {
                self.legacy_newer_than = OrbVersion::new(parse_num(key, value)?)
            }
            _ => warn!(key, "Ignoring unknown ORB property"),
        }
        Ok(())
    }

    pub fn with_acceptor(mut self, acceptor: AcceptorConfig) -> Self {
        self.acceptors.push(acceptor);
        self
    }

    pub fn legacy_policy(&self) -> LegacyPeerPolicy {
        LegacyPeerPolicy::new(self.legacy_newer_than)
    }

    pub fn code_sets(&self) -> CodeSetServiceContext {
        CodeSetServiceContext::new(self.char_codeset, self.wchar_codeset)
    }

    /// Settings handed to every connection.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            giop_version: self.giop_version,
            orb_version: self.orb_version,
            read_timeout: self.read_timeout,
            max_message_size: self.max_message_size,
            reader_mode: self.reader_mode,
            code_sets: self.code_sets(),
            codebase: self.codebase.clone(),
            legacy_policy: self.legacy_policy(),
        }
    }
}

fn parse_num<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| ConfigError::new(key, value, e.to_string()))
}

fn parse_code_set(key: &str, value: &str) -> Result<u32, ConfigError> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| ConfigError::new(key, value, e.to_string()))
}
