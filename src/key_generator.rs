//! Identifier resolution for rate limiting.
//!
//! Turns the per-request signals (peer address, forwarded chain, API key
//! header or query parameter) into the channel-prefixed identifier that quota
//! is tracked under, or into a bypass/block decision.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use ipnet::IpNet;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;

use crate::config::{Channel, IdentityConfig, IpOptions, KeyOptions};
use crate::error::{ThrottlerError, ThrottlerResult};

/// Longest key accepted after trimming.
pub const MAX_KEY_LENGTH: usize = 512;

/// Identifier reported to block hooks when the key was rejected by sanitization.
pub const INVALID_KEY_IDENTIFIER: &str = "key:invalid";

const IP_PREFIX: &str = "ip:";
const KEY_PREFIX: &str = "key:";

/// Why a request was refused. The rendering never includes the offending value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    IpBlocked,
    KeyBlocked,
    KeyTooLong,
    KeyInvalidCharacters,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::IpBlocked => write!(f, "address is on the block list"),
            BlockReason::KeyBlocked => write!(f, "key is on the block list"),
            BlockReason::KeyTooLong => write!(f, "key exceeds {} characters", MAX_KEY_LENGTH),
            BlockReason::KeyInvalidCharacters => write!(f, "key contains invalid characters"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierResult {
    /// Matched an allow list; skip rate limiting entirely.
    Bypass,
    /// Refused. `identifier` is for operator hooks and logs, never for responses.
    Block {
        identifier: String,
        reason: BlockReason,
    },
    Identifier(String),
    /// Nothing usable; the request proceeds unthrottled.
    Unidentified,
}

/// Raw per-request inputs to the resolver.
#[derive(Debug, Clone, Default)]
pub struct RequestSignals {
    pub peer: Option<IpAddr>,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
}

impl RequestSignals {
    pub fn new(peer: Option<IpAddr>) -> Self {
        Self {
            peer,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// A list of single addresses and CIDR ranges.
#[derive(Debug, Clone, Default)]
pub struct IpMatcher {
    networks: Vec<IpNet>,
}

impl IpMatcher {
    pub fn parse(entries: &[String], list_name: &str) -> ThrottlerResult<Self> {
        let networks = entries
            .iter()
            .map(|entry| parse_ip_entry(entry.trim(), list_name))
            .collect::<ThrottlerResult<Vec<_>>>()?;
        Ok(Self { networks })
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.networks.iter().any(|net| net.contains(&addr))
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

fn parse_ip_entry(entry: &str, list_name: &str) -> ThrottlerResult<IpNet> {
    if entry.contains('/') {
        entry.parse::<IpNet>().map_err(|e| {
            ThrottlerError::ConfigurationError(format!(
                "Invalid CIDR '{}' in {}: {}",
                entry, list_name, e
            ))
        })
    } else {
        entry
            .parse::<IpAddr>()
            .map(|ip| IpNet::from(ip.to_canonical()))
            .map_err(|e| {
                ThrottlerError::ConfigurationError(format!(
                    "Invalid address '{}' in {}: {}",
                    entry, list_name, e
                ))
            })
    }
}

#[derive(Debug, Clone)]
struct IpChannel {
    allow: IpMatcher,
    block: IpMatcher,
    trust_forwarded_chain: bool,
    trusted_proxies: IpMatcher,
    forwarded_header: String,
}

impl IpChannel {
    fn compile(options: &IpOptions) -> ThrottlerResult<Self> {
        Ok(Self {
            allow: IpMatcher::parse(&options.allow_list, "ip allow_list")?,
            block: IpMatcher::parse(&options.block_list, "ip block_list")?,
            trust_forwarded_chain: options.trust_forwarded_chain,
            trusted_proxies: IpMatcher::parse(&options.trusted_proxies, "trusted_proxies")?,
            forwarded_header: options.forwarded_header.to_ascii_lowercase(),
        })
    }

    fn resolve(&self, signals: &RequestSignals) -> IdentifierResult {
        let Some(addr) = self.effective_address(signals) else {
            return IdentifierResult::Unidentified;
        };

        if self.allow.contains(&addr) {
            IdentifierResult::Bypass
        } else if self.block.contains(&addr) {
            IdentifierResult::Block {
                identifier: format!("{}{}", IP_PREFIX, addr),
                reason: BlockReason::IpBlocked,
            }
        } else {
            IdentifierResult::Identifier(format!("{}{}", IP_PREFIX, addr))
        }
    }

    fn effective_address(&self, signals: &RequestSignals) -> Option<IpAddr> {
        let peer = signals.peer.map(|peer| peer.to_canonical())?;

        if !self.trust_forwarded_chain || !self.trusted_proxies.contains(&peer) {
            return Some(peer);
        }

        signals
            .header(&self.forwarded_header)
            .and_then(|chain| client_from_chain(chain, &self.trusted_proxies))
            .or(Some(peer))
    }
}

/// Walk a forwarded chain from the right and return the first hop that is
/// not a trusted proxy; the leftmost valid hop if all of them are trusted.
fn client_from_chain(chain: &str, trusted: &IpMatcher) -> Option<IpAddr> {
    let hops: Vec<IpAddr> = chain
        .split(',')
        .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
        .map(|hop| hop.to_canonical())
        .collect();

    hops.iter()
        .rev()
        .find(|hop| !trusted.contains(hop))
        .or_else(|| hops.first())
        .copied()
}

#[derive(Debug, Clone)]
struct KeyChannel {
    header: String,
    query_param: String,
    allow: HashSet<String>,
    block: HashSet<String>,
    fallback_to_ip: bool,
    allowed_chars: Regex,
}

impl KeyChannel {
    fn compile(options: &KeyOptions) -> ThrottlerResult<Self> {
        let allowed_chars = Regex::new(r"^[A-Za-z0-9._-]+$").map_err(|e| {
            ThrottlerError::ConfigurationError(format!("Failed to compile key pattern: {}", e))
        })?;

        Ok(Self {
            header: options.header.to_ascii_lowercase(),
            query_param: options.query_param.clone(),
            allow: options.allow_list.iter().map(|k| k.trim().to_string()).collect(),
            block: options.block_list.iter().map(|k| k.trim().to_string()).collect(),
            fallback_to_ip: options.fallback_to_ip,
            allowed_chars,
        })
    }

    fn resolve(&self, signals: &RequestSignals) -> IdentifierResult {
        // Header bytes that are not UTF-8 are a presented key, never an absent one.
        let header = match signals.headers.get(&self.header) {
            Some(value) => match std::str::from_utf8(value.as_bytes()) {
                Ok(text) => Some(text).filter(|text| !text.trim().is_empty()),
                Err(_) => return invalid_key(BlockReason::KeyInvalidCharacters),
            },
            None => None,
        };

        let raw = header.or_else(|| {
            signals
                .query
                .get(&self.query_param)
                .map(String::as_str)
                .filter(|value| !value.trim().is_empty())
        });

        let Some(raw) = raw else {
            return IdentifierResult::Unidentified;
        };

        let key = match self.sanitize(raw) {
            Ok(key) => key,
            Err(reason) => return invalid_key(reason),
        };

        if self.allow.contains(key) {
            IdentifierResult::Bypass
        } else if self.block.contains(key) {
            IdentifierResult::Block {
                identifier: format!("{}{}", KEY_PREFIX, key),
                reason: BlockReason::KeyBlocked,
            }
        } else {
            IdentifierResult::Identifier(format!("{}{}", KEY_PREFIX, key))
        }
    }

    fn sanitize<'a>(&self, raw: &'a str) -> Result<&'a str, BlockReason> {
        let key = raw.trim();
        if key.chars().count() > MAX_KEY_LENGTH {
            return Err(BlockReason::KeyTooLong);
        }
        if !self.allowed_chars.is_match(key) {
            return Err(BlockReason::KeyInvalidCharacters);
        }
        Ok(key)
    }
}

fn invalid_key(reason: BlockReason) -> IdentifierResult {
    IdentifierResult::Block {
        identifier: INVALID_KEY_IDENTIFIER.to_string(),
        reason,
    }
}

/// Resolves request signals to an [`IdentifierResult`] following the
/// configured channel priority.
#[derive(Debug, Clone)]
pub struct IdentifierResolver {
    ip: Option<IpChannel>,
    key: Option<KeyChannel>,
    /// IP channel used when the key channel yields nothing.
    fallback: Option<IpChannel>,
}

impl IdentifierResolver {
    pub fn new(config: &IdentityConfig) -> ThrottlerResult<Self> {
        let both_unset =
            matches!(config.ip, Channel::Unset) && matches!(config.key, Channel::Unset);

        let ip = match config.ip.options() {
            Some(options) => Some(IpChannel::compile(&options)?),
            None if both_unset => Some(IpChannel::compile(&IpOptions::default())?),
            None => None,
        };

        let key = config
            .key
            .options()
            .map(|options| KeyChannel::compile(&options))
            .transpose()?;

        let fallback_allowed = key.as_ref().map_or(true, |key| key.fallback_to_ip);
        let fallback = if config.ip.is_disabled() || !fallback_allowed {
            None
        } else {
            match &ip {
                Some(ip) => Some(ip.clone()),
                None => Some(IpChannel::compile(&IpOptions::default())?),
            }
        };

        Ok(Self { ip, key, fallback })
    }

    pub fn resolve(&self, signals: &RequestSignals) -> IdentifierResult {
        if let Some(ip) = &self.ip {
            let result = ip.resolve(signals);
            if result != IdentifierResult::Unidentified {
                return result;
            }
        }

        if let Some(key) = &self.key {
            let result = key.resolve(signals);
            if result != IdentifierResult::Unidentified {
                return result;
            }
        }

        match &self.fallback {
            Some(fallback) => fallback.resolve(signals),
            None => IdentifierResult::Unidentified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(addr: &str) -> Option<IpAddr> {
        Some(addr.parse().unwrap())
    }

    fn custom_ip(options: IpOptions) -> IdentityConfig {
        IdentityConfig {
            ip: Channel::Custom(options),
            key: Channel::Unset,
        }
    }

    fn key_only(options: KeyOptions) -> IdentityConfig {
        IdentityConfig {
            ip: Channel::Unset,
            key: Channel::Custom(options),
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_config_uses_peer_address() {
        let resolver = IdentifierResolver::new(&IdentityConfig::default()).unwrap();
        let result = resolver.resolve(&RequestSignals::new(ip("203.0.113.7")));
        assert_eq!(result, IdentifierResult::Identifier("ip:203.0.113.7".to_string()));
    }

    #[test]
    fn test_forwarded_chain_skips_trusted_hops() {
        let resolver = IdentifierResolver::new(&custom_ip(IpOptions {
            trust_forwarded_chain: true,
            trusted_proxies: strings(&["10.0.0.2", "10.0.0.3"]),
            ..IpOptions::default()
        }))
        .unwrap();

        let signals = RequestSignals::new(ip("10.0.0.3"))
            .with_header("x-forwarded-for", "192.168.1.50, 10.0.0.2, 10.0.0.3");

        assert_eq!(
            resolver.resolve(&signals),
            IdentifierResult::Identifier("ip:192.168.1.50".to_string())
        );
    }

    #[test]
    fn test_forwarded_chain_ignored_from_untrusted_peer() {
        let resolver = IdentifierResolver::new(&custom_ip(IpOptions {
            trust_forwarded_chain: true,
            trusted_proxies: strings(&["10.0.0.0/8"]),
            ..IpOptions::default()
        }))
        .unwrap();

        let signals =
            RequestSignals::new(ip("198.51.100.9")).with_header("x-forwarded-for", "1.1.1.1");

        assert_eq!(
            resolver.resolve(&signals),
            IdentifierResult::Identifier("ip:198.51.100.9".to_string())
        );
    }

    #[test]
    fn test_forwarded_chain_all_trusted_returns_leftmost() {
        let trusted = IpMatcher::parse(&strings(&["10.0.0.0/8"]), "trusted").unwrap();
        let client = client_from_chain("10.1.1.1, garbage, 10.2.2.2", &trusted);
        assert_eq!(client, "10.1.1.1".parse().ok());
    }

    #[test]
    fn test_forwarded_chain_discards_invalid_entries() {
        let trusted = IpMatcher::parse(&strings(&["10.0.0.3"]), "trusted").unwrap();
        let client = client_from_chain("8.8.8.8, not-an-ip, , 10.0.0.3", &trusted);
        assert_eq!(client, "8.8.8.8".parse().ok());
        assert_eq!(client_from_chain("nope, , ???", &trusted), None);
    }

    #[test]
    fn test_forwarding_disabled_uses_peer() {
        let resolver = IdentifierResolver::new(&custom_ip(IpOptions {
            trust_forwarded_chain: false,
            trusted_proxies: strings(&["10.0.0.3"]),
            ..IpOptions::default()
        }))
        .unwrap();

        let signals = RequestSignals::new(ip("10.0.0.3")).with_header("x-forwarded-for", "1.2.3.4");
        assert_eq!(
            resolver.resolve(&signals),
            IdentifierResult::Identifier("ip:10.0.0.3".to_string())
        );
    }

    #[test]
    fn test_ip_allow_and_block_lists() {
        let resolver = IdentifierResolver::new(&custom_ip(IpOptions {
            allow_list: strings(&["127.0.0.1"]),
            block_list: strings(&["203.0.113.0/24"]),
            ..IpOptions::default()
        }))
        .unwrap();

        assert_eq!(
            resolver.resolve(&RequestSignals::new(ip("127.0.0.1"))),
            IdentifierResult::Bypass
        );
        match resolver.resolve(&RequestSignals::new(ip("203.0.113.99"))) {
            IdentifierResult::Block { reason, .. } => assert_eq!(reason, BlockReason::IpBlocked),
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_ipv4_mapped_addresses_are_canonicalised() {
        let resolver = IdentifierResolver::new(&custom_ip(IpOptions {
            block_list: strings(&["192.0.2.1"]),
            ..IpOptions::default()
        }))
        .unwrap();

        let result = resolver.resolve(&RequestSignals::new(ip("::ffff:192.0.2.1")));
        assert!(matches!(result, IdentifierResult::Block { .. }));
    }

    #[test]
    fn test_key_from_header_then_query() {
        let resolver = IdentifierResolver::new(&key_only(KeyOptions::default())).unwrap();

        let from_header = RequestSignals::new(None).with_header("X-API-Key", "  abc-123 ");
        assert_eq!(
            resolver.resolve(&from_header),
            IdentifierResult::Identifier("key:abc-123".to_string())
        );

        let from_query = RequestSignals::new(None).with_query("api_key", "q.key_1");
        assert_eq!(
            resolver.resolve(&from_query),
            IdentifierResult::Identifier("key:q.key_1".to_string())
        );
    }

    #[test]
    fn test_key_sanitization_blocks() {
        let resolver = IdentifierResolver::new(&key_only(KeyOptions::default())).unwrap();

        let with_space = RequestSignals::new(None).with_header("x-api-key", "has space");
        assert_eq!(
            resolver.resolve(&with_space),
            IdentifierResult::Block {
                identifier: INVALID_KEY_IDENTIFIER.to_string(),
                reason: BlockReason::KeyInvalidCharacters,
            }
        );

        let too_long = "a".repeat(MAX_KEY_LENGTH + 1);
        let long = RequestSignals::new(None).with_header("x-api-key", &too_long);
        assert!(matches!(
            resolver.resolve(&long),
            IdentifierResult::Block { reason: BlockReason::KeyTooLong, .. }
        ));

        let exact = "a".repeat(MAX_KEY_LENGTH);
        let at_limit = RequestSignals::new(None).with_header("x-api-key", &exact);
        assert!(matches!(resolver.resolve(&at_limit), IdentifierResult::Identifier(_)));
    }

    #[test]
    fn test_non_ascii_key_header_blocks() {
        let resolver = IdentifierResolver::new(&IdentityConfig {
            ip: Channel::Disabled,
            key: Channel::Custom(KeyOptions::default()),
        })
        .unwrap();
        let expected = IdentifierResult::Block {
            identifier: INVALID_KEY_IDENTIFIER.to_string(),
            reason: BlockReason::KeyInvalidCharacters,
        };

        for bytes in ["ключ".as_bytes(), &[0xffu8, 0xfe][..]] {
            let mut signals = RequestSignals::new(ip("192.0.2.10"));
            signals
                .headers
                .insert("x-api-key", HeaderValue::from_bytes(bytes).unwrap());
            assert_eq!(resolver.resolve(&signals), expected);
        }

        // An undecodable header is not skipped in favour of the query parameter.
        let mut signals = RequestSignals::new(None).with_query("api_key", "valid");
        signals
            .headers
            .insert("x-api-key", HeaderValue::from_bytes(&[0xff]).unwrap());
        assert_eq!(resolver.resolve(&signals), expected);
    }

    #[test]
    fn test_block_reason_never_echoes_value() {
        let message = BlockReason::KeyInvalidCharacters.to_string();
        assert!(!message.contains("has space"));
        assert_eq!(BlockReason::IpBlocked.to_string(), "address is on the block list");
    }

    #[test]
    fn test_empty_key_falls_back_to_ip() {
        let resolver = IdentifierResolver::new(&key_only(KeyOptions::default())).unwrap();

        let blank = RequestSignals::new(ip("192.0.2.10")).with_header("x-api-key", "   ");
        assert_eq!(
            resolver.resolve(&blank),
            IdentifierResult::Identifier("ip:192.0.2.10".to_string())
        );
    }

    #[test]
    fn test_empty_key_without_fallback_is_unidentified() {
        let resolver = IdentifierResolver::new(&key_only(KeyOptions {
            fallback_to_ip: false,
            ..KeyOptions::default()
        }))
        .unwrap();

        let blank = RequestSignals::new(ip("192.0.2.10")).with_query("api_key", "");
        assert_eq!(resolver.resolve(&blank), IdentifierResult::Unidentified);
    }

    #[test]
    fn test_explicitly_disabled_ip_prevents_fallback() {
        let resolver = IdentifierResolver::new(&IdentityConfig {
            ip: Channel::Disabled,
            key: Channel::Defaults,
        })
        .unwrap();

        assert_eq!(
            resolver.resolve(&RequestSignals::new(ip("192.0.2.10"))),
            IdentifierResult::Unidentified
        );
    }

    #[test]
    fn test_ip_channel_takes_priority_over_key() {
        let resolver = IdentifierResolver::new(&IdentityConfig {
            ip: Channel::Defaults,
            key: Channel::Defaults,
        })
        .unwrap();

        let signals = RequestSignals::new(ip("192.0.2.10")).with_header("x-api-key", "abc");
        assert_eq!(
            resolver.resolve(&signals),
            IdentifierResult::Identifier("ip:192.0.2.10".to_string())
        );

        let no_peer = RequestSignals::new(None).with_header("x-api-key", "abc");
        assert_eq!(
            resolver.resolve(&no_peer),
            IdentifierResult::Identifier("key:abc".to_string())
        );
    }

    #[test]
    fn test_key_allow_and_block_lists() {
        let resolver = IdentifierResolver::new(&key_only(KeyOptions {
            allow_list: strings(&["internal"]),
            block_list: strings(&["revoked"]),
            ..KeyOptions::default()
        }))
        .unwrap();

        let allowed = RequestSignals::new(None).with_header("x-api-key", "internal");
        assert_eq!(resolver.resolve(&allowed), IdentifierResult::Bypass);

        let revoked = RequestSignals::new(None).with_header("x-api-key", "revoked");
        assert!(matches!(
            resolver.resolve(&revoked),
            IdentifierResult::Block { reason: BlockReason::KeyBlocked, .. }
        ));
    }

    #[test]
    fn test_invalid_list_entry_is_configuration_error() {
        let result = IdentifierResolver::new(&custom_ip(IpOptions {
            trusted_proxies: strings(&["10.0.0.300"]),
            ..IpOptions::default()
        }));
        assert!(matches!(result, Err(ThrottlerError::ConfigurationError(_))));
    }
}
