//! Configuration module for sockstun
//!
//! The tunnel is configured with a line-oriented `key=value` text:
//!
//! ```text
//! # proxy endpoint
//! listen=127.0.0.1:1080
//! server=1.2.3.4:443
//! type=socks5
//! ```
//!
//! Blank lines and `#` comments are ignored, unknown keys are ignored.
//! `listen`, `server` and `type` are required and must be non-empty.
//!
//! Validation runs in two tiers. The syntactic pass only checks size and
//! required keys. The semantic pass parses every value and is skipped when
//! the content checksum matches a fresh entry in the [`ConfigValidator`]
//! cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::common::Address;
use crate::error::{Error, Result};
use crate::protocol::Socks5Config;

/// Maximum accepted configuration payload (64 KiB)
pub const MAX_CONFIG_SIZE: usize = 64 * 1024;

/// Default lifetime of a validation cache entry
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Keys that must be present with a non-empty value
pub const REQUIRED_KEYS: [&str; 3] = ["listen", "server", "type"];

const DEFAULT_BUFFER_SIZE: usize = 4096;
const DEFAULT_POOL_SIZE: usize = 64;
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_FLOWS: usize = 1024;
const DEFAULT_RETRY_LIMIT: u32 = 5;

const MIN_BUFFER_SIZE: usize = 576;
const MAX_BUFFER_SIZE: usize = 65535;

// ============================================================================
// Source
// ============================================================================

/// Where a configuration comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A `.conf` file on disk
    File(PathBuf),
    /// An in-memory text payload
    Text(String),
}

impl ConfigSource {
    pub fn file(path: impl AsRef<Path>) -> Self {
        ConfigSource::File(path.as_ref().to_path_buf())
    }

    pub fn text(text: impl Into<String>) -> Self {
        ConfigSource::Text(text.into())
    }

    /// Load the raw text.
    ///
    /// File read or decoding failures are reported as `ConfigurationCorrupted`.
    pub fn read(&self) -> Result<String> {
        match self {
            ConfigSource::Text(text) => Ok(text.clone()),
            ConfigSource::File(path) => {
                let bytes = std::fs::read(path).map_err(|e| {
                    Error::ConfigurationCorrupted(format!("{}: {}", path.display(), e))
                })?;
                String::from_utf8(bytes).map_err(|_| {
                    Error::ConfigurationCorrupted(format!("{}: not valid UTF-8", path.display()))
                })
            }
        }
    }

    /// Cheap syntactic check, no cache involved.
    pub fn is_valid(&self) -> bool {
        if let ConfigSource::File(path) = self {
            let is_conf = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("conf"))
                .unwrap_or(false);
            if !is_conf || !path.is_file() {
                return false;
            }
        }

        match self.read() {
            Ok(text) => validate_syntax(&text).is_ok(),
            Err(_) => false,
        }
    }

    /// Payload size in bytes (0 if the file cannot be inspected)
    pub fn size(&self) -> usize {
        match self {
            ConfigSource::Text(text) => text.len(),
            ConfigSource::File(path) => std::fs::metadata(path)
                .map(|m| m.len() as usize)
                .unwrap_or(0),
        }
    }

    /// Content checksum of the source
    pub fn checksum(&self) -> Result<String> {
        self.read().map(|text| checksum(&text))
    }
}

// ============================================================================
// Syntax
// ============================================================================

/// SHA-256 of the normalized text as lowercase hex.
///
/// Normalization folds CRLF line endings to LF so the same file checked out
/// on different platforms hashes identically.
pub fn checksum(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Split the text into trimmed `(key, value)` pairs.
///
/// Lines without `=` are skipped, later duplicates win.
fn parse_entries(text: &str) -> HashMap<String, String> {
    let mut entries = HashMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            entries.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    entries
}

/// Fast syntactic pass: size limit and required keys.
pub fn validate_syntax(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(Error::InvalidConfiguration("configuration is empty".into()));
    }

    if text.len() > MAX_CONFIG_SIZE {
        return Err(Error::InvalidConfiguration(format!(
            "configuration is {} bytes, limit is {}",
            text.len(),
            MAX_CONFIG_SIZE
        )));
    }

    let entries = parse_entries(text);
    for key in REQUIRED_KEYS {
        match entries.get(key) {
            Some(value) if !value.is_empty() => {}
            Some(_) => {
                return Err(Error::InvalidConfiguration(format!("key '{}' is empty", key)));
            }
            None => {
                return Err(Error::InvalidConfiguration(format!("missing key '{}'", key)));
            }
        }
    }

    Ok(())
}

// ============================================================================
// Config
// ============================================================================

/// Supported upstream proxy protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Socks5,
}

/// Fully parsed tunnel configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address of the tunnel endpoint itself
    pub listen: Address,
    /// SOCKS5 server
    pub server: Address,
    pub proxy_type: ProxyType,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Frame buffer size for interface reads
    pub buffer_size: usize,
    /// Maximum live proxy connections
    pub pool_size: usize,
    /// Idle proxy connections kept ready
    pub pool_prewarm: usize,
    pub pool_idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub tcp_idle_timeout: Duration,
    pub udp_idle_timeout: Duration,
    /// Maximum concurrent flows
    pub max_flows: usize,
    /// Connection attempts per flow before giving up
    pub retry_limit: u32,
    /// Interface frames carry a 4-byte address family prefix
    pub packet_info: bool,
    pub log_level: String,
}

impl Config {
    /// Run both validation tiers on raw text, without caching.
    pub fn from_text(text: &str) -> Result<Self> {
        validate_syntax(text)?;
        Self::from_entries(&parse_entries(text))
    }

    fn from_entries(entries: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| entries.get(key).map(String::as_str).filter(|v| !v.is_empty());

        let listen = Address::parse(get("listen").unwrap_or_default())?;
        let server = Address::parse(get("server").unwrap_or_default())?;

        let proxy_type = match get("type").map(str::to_ascii_lowercase).as_deref() {
            Some("socks5") => ProxyType::Socks5,
            other => {
                return Err(Error::InvalidConfiguration(format!(
                    "unsupported proxy type: {}",
                    other.unwrap_or("")
                )));
            }
        };

        let username = get("username").map(str::to_string);
        let password = get("password").map(str::to_string);
        if username.is_some() != password.is_some() {
            return Err(Error::InvalidConfiguration(
                "username and password must be set together".into(),
            ));
        }
        for credential in [&username, &password].into_iter().flatten() {
            if credential.len() > 255 {
                return Err(Error::InvalidConfiguration("credential longer than 255 bytes".into()));
            }
        }

        let buffer_size = parse_number(get("buffer-size"), "buffer-size", DEFAULT_BUFFER_SIZE)?;
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&buffer_size) {
            return Err(Error::InvalidConfiguration(format!(
                "buffer-size must be between {} and {}",
                MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
            )));
        }

        let pool_size = parse_number(get("pool-size"), "pool-size", DEFAULT_POOL_SIZE)?;
        let pool_prewarm = parse_number(get("pool-prewarm"), "pool-prewarm", 0)?;
        if pool_size == 0 || pool_prewarm > pool_size {
            return Err(Error::InvalidConfiguration(
                "pool-size must be positive and not below pool-prewarm".into(),
            ));
        }

        let max_flows = parse_number(get("max-flows"), "max-flows", DEFAULT_MAX_FLOWS)?;
        if max_flows == 0 {
            return Err(Error::InvalidConfiguration("max-flows must be positive".into()));
        }

        let packet_info = match get("packet-info") {
            Some(v) => parse_bool(v, "packet-info")?,
            None => cfg!(any(target_os = "macos", target_os = "ios")),
        };

        Ok(Config {
            listen,
            server,
            proxy_type,
            username,
            password,
            buffer_size,
            pool_size,
            pool_prewarm,
            pool_idle_timeout: parse_duration(
                get("pool-idle-timeout"),
                "pool-idle-timeout",
                DEFAULT_POOL_IDLE_TIMEOUT,
            )?,
            handshake_timeout: parse_duration(
                get("handshake-timeout"),
                "handshake-timeout",
                DEFAULT_HANDSHAKE_TIMEOUT,
            )?,
            tcp_idle_timeout: parse_duration(
                get("tcp-idle-timeout"),
                "tcp-idle-timeout",
                DEFAULT_TCP_IDLE_TIMEOUT,
            )?,
            udp_idle_timeout: parse_duration(
                get("udp-idle-timeout"),
                "udp-idle-timeout",
                DEFAULT_UDP_IDLE_TIMEOUT,
            )?,
            max_flows,
            retry_limit: parse_number(get("retry-limit"), "retry-limit", DEFAULT_RETRY_LIMIT)?,
            packet_info,
            log_level: get("log-level").unwrap_or("info").to_ascii_lowercase(),
        })
    }

    /// SOCKS5 client settings derived from the credentials
    pub fn socks5_config(&self) -> Socks5Config {
        Socks5Config {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(value: Option<&str>, key: &str, default: T) -> Result<T> {
    match value {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| {
                Error::InvalidConfiguration(format!("invalid value for '{}': {}", key, v))
            }),
    }
}

/// Accepts `30`, `30s` or `500ms`.
fn parse_duration(value: Option<&str>, key: &str, default: Duration) -> Result<Duration> {
    let Some(v) = value else {
        return Ok(default);
    };

    let invalid = || Error::InvalidConfiguration(format!("invalid duration for '{}': {}", key, v));
    if let Some(ms) = v.strip_suffix("ms") {
        ms.trim().parse().map(Duration::from_millis).map_err(|_| invalid())
    } else {
        v.trim_end_matches('s')
            .trim()
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| invalid())
    }
}

fn parse_bool(value: &str, key: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(Error::InvalidConfiguration(format!(
            "invalid boolean for '{}': {}",
            key, value
        ))),
    }
}

// ============================================================================
// Validation cache
// ============================================================================

struct CacheEntry {
    validated_at: Instant,
    /// Parsed config, or the rejection message
    outcome: std::result::Result<Arc<Config>, String>,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.validated_at.elapsed() > ttl
    }
}

/// Validates configurations and remembers recent outcomes by checksum
pub struct ConfigValidator {
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
    semantic_scans: AtomicU64,
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
            semantic_scans: AtomicU64::new(0),
        }
    }

    /// Validate a source, reusing a fresh cached outcome when the checksum
    /// matches.
    pub fn validate(&self, source: &ConfigSource) -> Result<Arc<Config>> {
        let text = source.read()?;
        validate_syntax(&text)?;

        let sum = checksum(&text);
        if let Some(outcome) = self.lookup(&sum) {
            trace!("Config cache hit for {}", &sum[..12]);
            return outcome.map_err(Error::InvalidConfiguration);
        }

        self.semantic_scans.fetch_add(1, Ordering::Relaxed);
        let outcome = Config::from_entries(&parse_entries(&text))
            .map(Arc::new)
            .map_err(|e| match e {
                Error::InvalidConfiguration(msg) => msg,
                other => other.to_string(),
            });

        debug!(
            "Config {} validated: {}",
            &sum[..12],
            if outcome.is_ok() { "ok" } else { "rejected" }
        );

        self.cache.lock().insert(
            sum,
            CacheEntry {
                validated_at: Instant::now(),
                outcome: outcome.clone(),
            },
        );

        outcome.map_err(Error::InvalidConfiguration)
    }

    fn lookup(&self, sum: &str) -> Option<std::result::Result<Arc<Config>, String>> {
        let cache = self.cache.lock();
        cache
            .get(sum)
            .filter(|entry| !entry.is_expired(self.ttl))
            .map(|entry| entry.outcome.clone())
    }

    /// Number of semantic passes performed so far
    pub fn semantic_scans(&self) -> u64 {
        self.semantic_scans.load(Ordering::Relaxed)
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, entry| !entry.is_expired(self.ttl));
        before - cache.len()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "listen=127.0.0.1:1080\nserver=1.2.3.4:443\ntype=socks5\n";

    #[test]
    fn test_valid_scenario() {
        assert!(ConfigSource::text(VALID).is_valid());
        let config = Config::from_text(VALID).unwrap();
        assert_eq!(config.server, Address::parse("1.2.3.4:443").unwrap());
        assert_eq!(config.proxy_type, ProxyType::Socks5);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.pool_size, 64);
        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_server_rejected() {
        let text = "listen=127.0.0.1:1080\ntype=socks5\n";
        assert!(!ConfigSource::text(text).is_valid());
        let err = ConfigValidator::new()
            .validate(&ConfigSource::text(text))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_each_required_key_is_required() {
        let lines = ["listen=127.0.0.1:1080", "server=1.2.3.4:443", "type=socks5"];
        for skip in 0..lines.len() {
            let text: Vec<&str> = lines
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, l)| *l)
                .collect();
            let err = validate_syntax(&text.join("\n")).unwrap_err();
            assert!(matches!(err, Error::InvalidConfiguration(_)), "skip {}", skip);
        }
    }

    #[test]
    fn test_comments_blank_lines_and_unknown_keys() {
        let text = "# tunnel\n\n  listen = 10.0.0.1:1080  \n# server=nope\nserver=proxy.local:1080\nfoo=bar\ntype=SOCKS5\n";
        let config = Config::from_text(text).unwrap();
        assert_eq!(config.listen, Address::parse("10.0.0.1:1080").unwrap());
        assert_eq!(config.server, Address::domain("proxy.local", 1080));
    }

    #[test]
    fn test_empty_value_and_empty_payload() {
        assert!(validate_syntax("").is_err());
        assert!(validate_syntax("   \n# only comment\n").is_err());
        assert!(validate_syntax("listen=\nserver=1.2.3.4:443\ntype=socks5").is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut text = String::from(VALID);
        text.push('#');
        text.push_str(&"x".repeat(MAX_CONFIG_SIZE));
        assert!(matches!(
            validate_syntax(&text),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_semantic_errors() {
        assert!(Config::from_text("listen=127.0.0.1:1080\nserver=1.2.3.4:443\ntype=http").is_err());
        assert!(Config::from_text(&format!("{}username=alice\n", VALID)).is_err());
        assert!(Config::from_text(&format!("{}buffer-size=12\n", VALID)).is_err());
        assert!(Config::from_text(&format!("{}handshake-timeout=soon\n", VALID)).is_err());
    }

    #[test]
    fn test_optional_keys() {
        let text = format!(
            "{}username=alice\npassword=secret\nhandshake-timeout=500ms\npool-size=2\npacket-info=yes\n",
            VALID
        );
        let config = Config::from_text(&text).unwrap();
        assert_eq!(config.handshake_timeout, Duration::from_millis(500));
        assert_eq!(config.pool_size, 2);
        assert!(config.packet_info);
        assert_eq!(config.socks5_config().username.as_deref(), Some("alice"));
    }

    #[test]
    fn test_checksum_determinism() {
        assert_eq!(checksum(VALID), checksum(VALID));
        assert_eq!(checksum(VALID).len(), 64);
        assert_ne!(checksum(VALID), checksum(&VALID.replace("443", "444")));
        assert_eq!(checksum(VALID), checksum(&VALID.replace('\n', "\r\n")));
    }

    #[test]
    fn test_cache_skips_semantic_pass() {
        let validator = ConfigValidator::new();
        let source = ConfigSource::text(VALID);

        let first = validator.validate(&source).unwrap();
        assert_eq!(validator.semantic_scans(), 1);

        let second = validator.validate(&source).unwrap();
        assert_eq!(validator.semantic_scans(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(validator.len(), 1);
    }

    #[test]
    fn test_cache_remembers_rejections() {
        let validator = ConfigValidator::new();
        let source = ConfigSource::text("listen=127.0.0.1:1080\nserver=1.2.3.4:443\ntype=http");

        assert!(validator.validate(&source).is_err());
        assert!(validator.validate(&source).is_err());
        assert_eq!(validator.semantic_scans(), 1);
    }

    #[test]
    fn test_cache_expiry() {
        let validator = ConfigValidator::with_ttl(Duration::ZERO);
        let source = ConfigSource::text(VALID);

        validator.validate(&source).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        validator.validate(&source).unwrap();
        assert_eq!(validator.semantic_scans(), 2);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(validator.purge_expired(), 1);
        assert!(validator.is_empty());
    }

    #[test]
    fn test_missing_file_is_corrupted() {
        let source = ConfigSource::file("/nonexistent/sockstun/tunnel.conf");
        assert!(!source.is_valid());
        assert_eq!(source.size(), 0);
        assert!(matches!(
            ConfigValidator::new().validate(&source),
            Err(Error::ConfigurationCorrupted(_))
        ));
    }

    #[test]
    fn test_file_source() {
        let path = std::env::temp_dir().join(format!("sockstun-{}.conf", uuid::Uuid::new_v4()));
        std::fs::write(&path, VALID).unwrap();

        let source = ConfigSource::file(&path);
        assert!(source.is_valid());
        assert_eq!(source.size(), VALID.len());
        assert_eq!(source.checksum().unwrap(), checksum(VALID));
        assert!(ConfigValidator::new().validate(&source).is_ok());

        std::fs::remove_file(&path).unwrap();
    }
}
