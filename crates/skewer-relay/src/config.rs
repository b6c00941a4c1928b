//! Configuration consumed from the environment.
//!
//! The relay reads a flat set of `SKEWER_*` variables: listeners,
//! enabled destinations, store tuning and per-destination connection
//! parameters. Anything fancier (files, hot reload, service discovery)
//! is the supervisor's job, not ours; this module only turns strings
//! into typed values with sensible defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use skewer_model::{ConfigId, Encoding, Format};

use crate::framing::FramingMode;

/// Default TTL of a Failed entry before it is retried.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Default shutdown grace period.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Default back-off before dropping a failed RELP session.
pub const DEFAULT_RELP_FAILURE_BACKOFF: Duration = Duration::from_secs(30);
/// Default per-connection read deadline.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);
/// Default bound of the raw-record ring.
pub const DEFAULT_INPUT_QUEUE_SIZE: usize = 8192;
/// Default maximum size of one record, in bytes.
pub const DEFAULT_MAX_RECORD_SIZE: usize = 65536;
/// Default batch size for store retrieval.
pub const DEFAULT_RETRIEVE_BATCH: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown destination: {0}")]
    UnknownDestination(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("secret must be 64 hex characters (32 bytes)")]
    BadSecret,
    #[error(transparent)]
    Format(#[from] skewer_model::ParseError),
}

/// A terminal sink for events.
///
/// Every kind owns a stable one-byte tag used in store keys, so the
/// on-disk layout survives enum reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestinationKind {
    Kafka,
    Elasticsearch,
    Http,
    Relp,
    Tcp,
    Udp,
    File,
    Stderr,
    Graylog,
}

impl DestinationKind {
    pub const ALL: [DestinationKind; 9] = [
        DestinationKind::Kafka,
        DestinationKind::Elasticsearch,
        DestinationKind::Http,
        DestinationKind::Relp,
        DestinationKind::Tcp,
        DestinationKind::Udp,
        DestinationKind::File,
        DestinationKind::Stderr,
        DestinationKind::Graylog,
    ];

    /// Partition tag byte for store keys.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            DestinationKind::Kafka => b'k',
            DestinationKind::Elasticsearch => b'e',
            DestinationKind::Http => b'h',
            DestinationKind::Relp => b'r',
            DestinationKind::Tcp => b't',
            DestinationKind::Udp => b'u',
            DestinationKind::File => b'f',
            DestinationKind::Stderr => b's',
            DestinationKind::Graylog => b'g',
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            DestinationKind::Kafka => "kafka",
            DestinationKind::Elasticsearch => "elasticsearch",
            DestinationKind::Http => "http",
            DestinationKind::Relp => "relp",
            DestinationKind::Tcp => "tcp",
            DestinationKind::Udp => "udp",
            DestinationKind::File => "file",
            DestinationKind::Stderr => "stderr",
            DestinationKind::Graylog => "graylog",
        }
    }

    fn bit(self) -> u64 {
        match self {
            DestinationKind::Kafka => 1,
            DestinationKind::Elasticsearch => 2,
            DestinationKind::Http => 4,
            DestinationKind::Relp => 8,
            DestinationKind::Tcp => 16,
            DestinationKind::Udp => 32,
            DestinationKind::File => 64,
            DestinationKind::Stderr => 128,
            DestinationKind::Graylog => 256,
        }
    }
}

impl FromStr for DestinationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DestinationKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| ConfigError::UnknownDestination(s.to_string()))
    }
}

/// Bitmask of enabled destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DestinationMask(u64);

impl DestinationMask {
    #[must_use]
    pub fn of(kinds: &[DestinationKind]) -> Self {
        DestinationMask(kinds.iter().fold(0, |acc, kind| acc | kind.bit()))
    }

    /// Enabled kinds; an empty mask means stderr only, so the relay
    /// never silently drops everything.
    #[must_use]
    pub fn kinds(self) -> Vec<DestinationKind> {
        if self.0 == 0 {
            return vec![DestinationKind::Stderr];
        }
        DestinationKind::ALL
            .into_iter()
            .filter(|kind| self.0 & kind.bit() != 0)
            .collect()
    }

    #[must_use]
    pub fn contains(self, kind: DestinationKind) -> bool {
        self.kinds().contains(&kind)
    }
}

impl FromStr for DestinationMask {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = 0;
        for part in s.split(',').filter(|p| !p.trim().is_empty()) {
            mask |= part.parse::<DestinationKind>()?.bit();
        }
        Ok(DestinationMask(mask))
    }
}

/// Transport protocol of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerProtocol {
    Tcp,
    Udp,
    Relp,
}

/// One listening endpoint.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub protocol: ListenerProtocol,
    /// `host:port`, ignored when a unix socket path is set.
    pub bind: String,
    pub unix_socket_path: Option<PathBuf>,
    pub format: Format,
    pub encoding: Encoding,
    pub framing: FramingMode,
    pub read_timeout: Duration,
    pub dont_parse_sd: bool,
    pub max_record_size: usize,
    pub config_id: ConfigId,
}

impl ListenerConfig {
    #[must_use]
    pub fn new(protocol: ListenerProtocol, bind: impl Into<String>) -> Self {
        ListenerConfig {
            protocol,
            bind: bind.into(),
            unix_socket_path: None,
            format: Format::Auto,
            encoding: Encoding::Utf8,
            framing: FramingMode::Auto,
            read_timeout: DEFAULT_READ_TIMEOUT,
            dont_parse_sd: false,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            config_id: ConfigId::new_v4(),
        }
    }
}

/// Connection parameters of the simple built-in destinations.
#[derive(Debug, Clone, Default)]
pub struct DestConfig {
    pub file_path: Option<PathBuf>,
    pub tcp_addr: Option<String>,
    pub udp_addr: Option<String>,
    pub http_url: Option<String>,
    pub http_timeout: Duration,
    /// When set, adapters raise their fatal signal after this period to
    /// force a reconnect.
    pub rebind_period: Option<Duration>,
}

/// Full relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listeners: Vec<ListenerConfig>,
    pub destinations: DestinationMask,
    pub dest: DestConfig,
    pub store_dir: PathBuf,
    pub fsync: bool,
    /// 32-byte secret enabling AEAD of stored message bodies.
    pub secret: Option<[u8; 32]>,
    pub retry_delay: Duration,
    pub input_queue_size: usize,
    pub max_record_size: usize,
    pub retrieve_batch: usize,
    pub grace_period: Duration,
    pub relp_failure_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listeners: Vec::new(),
            destinations: DestinationMask::default(),
            dest: DestConfig {
                http_timeout: Duration::from_secs(10),
                ..DestConfig::default()
            },
            store_dir: PathBuf::from("/var/lib/skewer/store"),
            fsync: false,
            secret: None,
            retry_delay: DEFAULT_RETRY_DELAY,
            input_queue_size: DEFAULT_INPUT_QUEUE_SIZE,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            retrieve_batch: DEFAULT_RETRIEVE_BATCH,
            grace_period: DEFAULT_GRACE_PERIOD,
            relp_failure_backoff: DEFAULT_RELP_FAILURE_BACKOFF,
        }
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env(key) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
            key,
            value,
        }),
    }
}

fn parse_secret(hex: &str) -> Result<[u8; 32], ConfigError> {
    if hex.len() != 64 {
        return Err(ConfigError::BadSecret);
    }
    let mut secret = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).map_err(|_| ConfigError::BadSecret)?;
        secret[i] = u8::from_str_radix(s, 16).map_err(|_| ConfigError::BadSecret)?;
    }
    Ok(secret)
}

impl Config {
    /// Builds the configuration from `SKEWER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(dir) = env("SKEWER_STORE_DIR") {
            config.store_dir = PathBuf::from(dir);
        }
        if let Some(mask) = env("SKEWER_DESTINATIONS") {
            config.destinations = mask.parse()?;
        }
        if let Some(secs) = env_parse::<u64>("SKEWER_RETRY_DELAY_SECS")? {
            config.retry_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SKEWER_GRACE_SECS")? {
            config.grace_period = Duration::from_secs(secs);
        }
        if let Some(size) = env_parse::<usize>("SKEWER_INPUT_QUEUE_SIZE")? {
            config.input_queue_size = size.max(1);
        }
        if let Some(size) = env_parse::<usize>("SKEWER_MAX_RECORD_SIZE")? {
            config.max_record_size = size;
        }
        if let Some(fsync) = env_parse::<bool>("SKEWER_FSYNC")? {
            config.fsync = fsync;
        }
        if let Some(hex) = env("SKEWER_SECRET") {
            config.secret = Some(parse_secret(&hex)?);
        }

        let format: Format = env("SKEWER_FORMAT").as_deref().unwrap_or("auto").parse()?;
        let encoding: Encoding =
            env("SKEWER_ENCODING").as_deref().unwrap_or("utf8").parse()?;
        let read_timeout = env_parse::<u64>("SKEWER_READ_TIMEOUT_SECS")?
            .map_or(DEFAULT_READ_TIMEOUT, Duration::from_secs);

        for (key, protocol) in [
            ("SKEWER_TCP_LISTEN", ListenerProtocol::Tcp),
            ("SKEWER_UDP_LISTEN", ListenerProtocol::Udp),
            ("SKEWER_RELP_LISTEN", ListenerProtocol::Relp),
        ] {
            if let Some(addrs) = env(key) {
                for addr in addrs.split(',').filter(|a| !a.trim().is_empty()) {
                    let mut listener = ListenerConfig::new(protocol, addr.trim());
                    listener.format = format;
                    listener.encoding = encoding;
                    listener.read_timeout = read_timeout;
                    listener.max_record_size = config.max_record_size;
                    config.listeners.push(listener);
                }
            }
        }

        for (key, protocol) in [
            ("SKEWER_UNIX_STREAM_LISTEN", ListenerProtocol::Tcp),
            ("SKEWER_UNIX_DGRAM_LISTEN", ListenerProtocol::Udp),
        ] {
            if let Some(paths) = env(key) {
                for path in paths.split(',').filter(|p| !p.trim().is_empty()) {
                    let mut listener = ListenerConfig::new(protocol, "");
                    listener.unix_socket_path = Some(PathBuf::from(path.trim()));
                    listener.format = format;
                    listener.encoding = encoding;
                    listener.read_timeout = read_timeout;
                    listener.max_record_size = config.max_record_size;
                    config.listeners.push(listener);
                }
            }
        }

        config.dest.file_path = env("SKEWER_FILE_PATH").map(PathBuf::from);
        config.dest.tcp_addr = env("SKEWER_TCP_DEST");
        config.dest.udp_addr = env("SKEWER_UDP_DEST");
        config.dest.http_url = env("SKEWER_HTTP_URL");
        if let Some(secs) = env_parse::<u64>("SKEWER_REBIND_SECS")? {
            config.dest.rebind_period = Some(Duration::from_secs(secs));
        }

        Ok(config)
    }
}
