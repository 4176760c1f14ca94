//! Session and request configuration.
//!
//! # Design
//! `Options` is a fully populated, typed value. Overrides travel as an
//! `OptionsPatch` where every field is optional, so merging can tell "not
//! given" from "given the default". Map-like fields (headers, TLS settings,
//! HTTP/2 settings, timeouts) are unioned key by key with the patch winning;
//! scalars are replaced outright.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const WINDOW_SIZE: u32 = 1 << 14;
pub const MAX_BODY_THRESHOLD_SIZE: usize = (1 << 10) * 112;
pub const CONNECT_TIMEOUT_SECS: u64 = 60;
pub const OPERATION_TIMEOUT_SECS: u64 = 60;
pub const KEEP_ALIVE_TIMEOUT_SECS: u64 = 20;
pub const SETTINGS_TIMEOUT_SECS: u64 = 10;

/// Key under `ssl` listing ALPN protocols, comma-separated.
pub const ALPN_PROTOCOLS: &str = "alpn_protocols";

/// Which transport a channel is opened over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Tls,
}

/// Timeouts in whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub connect_timeout: u64,
    pub settings_timeout: u64,
    pub operation_timeout: u64,
    pub keep_alive_timeout: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT_SECS,
            settings_timeout: SETTINGS_TIMEOUT_SECS,
            operation_timeout: OPERATION_TIMEOUT_SECS,
            keep_alive_timeout: KEEP_ALIVE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsPatch {
    pub connect_timeout: Option<u64>,
    pub settings_timeout: Option<u64>,
    pub operation_timeout: Option<u64>,
    pub keep_alive_timeout: Option<u64>,
}

/// Session configuration.
///
/// The engine itself reads `headers`, `transport`, `persistent`, the ssl
/// identity and the operation timeout. The rest is carried to
/// [`Transport::open`](crate::channel::Transport::open) for channel
/// implementations: TLS settings, HTTP/2 settings and window, body buffering
/// threshold, the ALPN fallback, and the connect, settings and keep-alive
/// timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Headers added to every request.
    pub headers: BTreeMap<String, String>,
    pub ssl: BTreeMap<String, String>,
    pub http2_settings: BTreeMap<String, u32>,
    pub timeout: Timeouts,
    /// Protocol assumed when ALPN negotiates nothing.
    pub fallback_protocol: String,
    pub window_size: u32,
    /// Bodies larger than this are buffered outside memory.
    pub body_threshold_size: usize,
    /// Forces a transport instead of deriving it from the URI scheme.
    pub transport: Option<TransportKind>,
    /// Keep connections open after each batch.
    pub persistent: bool,
    pub max_concurrent_requests: Option<u32>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            headers: BTreeMap::new(),
            ssl: BTreeMap::new(),
            http2_settings: BTreeMap::from([("settings_enable_push".to_string(), 0)]),
            timeout: Timeouts::default(),
            fallback_protocol: "http/1.1".to_string(),
            window_size: WINDOW_SIZE,
            body_threshold_size: MAX_BODY_THRESHOLD_SIZE,
            transport: None,
            persistent: false,
            max_concurrent_requests: None,
        }
    }
}

/// Partial options layered over a base with [`Options::merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsPatch {
    pub headers: BTreeMap<String, String>,
    pub ssl: BTreeMap<String, String>,
    pub http2_settings: BTreeMap<String, u32>,
    pub timeout: TimeoutsPatch,
    pub fallback_protocol: Option<String>,
    pub window_size: Option<u32>,
    pub body_threshold_size: Option<usize>,
    pub transport: Option<TransportKind>,
    pub persistent: Option<bool>,
    pub max_concurrent_requests: Option<u32>,
}

impl OptionsPatch {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Options {
    /// Parse and validate options; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Options = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn merge(&self, patch: &OptionsPatch) -> Result<Options> {
        let mut merged = self.clone();
        merged.headers.extend(patch.headers.clone());
        merged.ssl.extend(patch.ssl.clone());
        merged.http2_settings.extend(patch.http2_settings.clone());

        let t = &patch.timeout;
        let timeout = &mut merged.timeout;
        timeout.connect_timeout = t.connect_timeout.unwrap_or(timeout.connect_timeout);
        timeout.settings_timeout = t.settings_timeout.unwrap_or(timeout.settings_timeout);
        timeout.operation_timeout = t.operation_timeout.unwrap_or(timeout.operation_timeout);
        timeout.keep_alive_timeout = t.keep_alive_timeout.unwrap_or(timeout.keep_alive_timeout);

        if let Some(fallback) = &patch.fallback_protocol {
            merged.fallback_protocol = fallback.clone();
        }
        merged.window_size = patch.window_size.unwrap_or(merged.window_size);
        merged.body_threshold_size = patch.body_threshold_size.unwrap_or(merged.body_threshold_size);
        merged.transport = patch.transport.or(merged.transport);
        merged.persistent = patch.persistent.unwrap_or(merged.persistent);
        merged.max_concurrent_requests = patch.max_concurrent_requests.or(merged.max_concurrent_requests);

        merged.validate()?;
        Ok(merged)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == Some(0) {
            return Err(Error::Usage("max_concurrent_requests must be positive".to_string()));
        }
        Ok(())
    }

    /// How long a transport may spend establishing a channel.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.connect_timeout)
    }

    /// How long one reactor tick may block.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.operation_timeout)
    }

    /// Whether two option sets would open interchangeable channels.
    pub fn same_transport(&self, other: &Options) -> bool {
        self.transport == other.transport && self.ssl == other.ssl
    }

    /// Copy with `protocol` as the only ALPN protocol offered.
    pub fn with_alpn(&self, protocol: &str) -> Options {
        let mut options = self.clone();
        options.ssl.insert(ALPN_PROTOCOLS.to_string(), protocol.to_string());
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::default();
        assert_eq!(options.window_size, 16 * 1024);
        assert_eq!(options.body_threshold_size, 112 * 1024);
        assert_eq!(options.operation_timeout(), Duration::from_secs(60));
        assert_eq!(options.connect_timeout(), Duration::from_secs(60));
        assert_eq!(options.timeout.keep_alive_timeout, 20);
        assert_eq!(options.http2_settings.get("settings_enable_push"), Some(&0));
        assert!(!options.persistent);
    }

    #[test]
    fn from_json_fills_missing_fields() {
        let options = Options::from_json(r#"{"timeout":{"operation_timeout":5},"transport":"tls"}"#).unwrap();
        assert_eq!(options.operation_timeout(), Duration::from_secs(5));
        assert_eq!(options.timeout.connect_timeout, CONNECT_TIMEOUT_SECS);
        assert_eq!(options.transport, Some(TransportKind::Tls));
        assert_eq!(options.fallback_protocol, "http/1.1");
    }

    #[test]
    fn from_json_rejects_bad_input() {
        assert!(matches!(Options::from_json("not json"), Err(Error::Config(_))));
        assert!(matches!(
            Options::from_json(r#"{"max_concurrent_requests":0}"#),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn merge_unions_maps_and_replaces_scalars() {
        let mut base = Options::default();
        base.headers.insert("accept".into(), "*/*".into());
        base.headers.insert("user-agent".into(), "base".into());
        base.ssl.insert("verify".into(), "peer".into());

        let patch = OptionsPatch::from_json(
            r#"{
                "headers": {"user-agent": "patched", "x-extra": "1"},
                "ssl": {"alpn_protocols": "h2"},
                "timeout": {"connect_timeout": 3},
                "window_size": 1024,
                "persistent": true
            }"#,
        )
        .unwrap();
        let merged = base.merge(&patch).unwrap();

        assert_eq!(merged.headers.len(), 3);
        assert_eq!(merged.headers["user-agent"], "patched");
        assert_eq!(merged.headers["accept"], "*/*");
        assert_eq!(merged.ssl.len(), 2);
        assert_eq!(merged.timeout.connect_timeout, 3);
        assert_eq!(merged.timeout.operation_timeout, OPERATION_TIMEOUT_SECS);
        assert_eq!(merged.window_size, 1024);
        assert!(merged.persistent);
        assert_eq!(merged.fallback_protocol, "http/1.1");
    }

    #[test]
    fn empty_patch_is_identity() {
        let base = Options::default();
        assert_eq!(base.merge(&OptionsPatch::default()).unwrap(), base);
    }

    #[test]
    fn merge_validates() {
        let patch = OptionsPatch {
            max_concurrent_requests: Some(0),
            ..Default::default()
        };
        assert!(Options::default().merge(&patch).is_err());
    }

    #[test]
    fn transport_identity_covers_tls_settings() {
        let plain = Options::default();
        let h2 = plain.with_alpn("h2");
        assert!(!plain.same_transport(&h2));
        assert!(h2.same_transport(&plain.with_alpn("h2")));

        let mut headers_only = plain.clone();
        headers_only.headers.insert("x".into(), "y".into());
        assert!(plain.same_transport(&headers_only));
    }
}
