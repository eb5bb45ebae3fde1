//! The `GOMA_*` flag set handed to compiler_proxy.
//!
//! Flags are captured from the process environment once and then carried as
//! an explicit value. Defaults only fill unset flags, and the daemon is
//! spawned with exactly this set.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CtlError, Result};

pub const FLAG_PREFIX: &str = "GOMA_";

/// Marker compiler_proxy appends to flags it picked by itself in `/flagz`.
const AUTO_CONFIGURED_SUFFIX: &str = "(auto configured)";

pub const USE_SSL: &str = "USE_SSL";
pub const PING_TIMEOUT_SEC: &str = "PING_TIMEOUT_SEC";
pub const COMPILER_PROXY_SOCKET_NAME: &str = "COMPILER_PROXY_SOCKET_NAME";
pub const COMPILER_PROXY_LOCK_FILENAME: &str = "COMPILER_PROXY_LOCK_FILENAME";
pub const COMPILER_PROXY_PORT: &str = "COMPILER_PROXY_PORT";
pub const COMPILER_PROXY_DAEMON_MODE: &str = "COMPILER_PROXY_DAEMON_MODE";
pub const COMPILER_PROXY_BINARY: &str = "COMPILER_PROXY_BINARY";
pub const PROXY_HOST: &str = "PROXY_HOST";
pub const PROXY_PORT: &str = "PROXY_PORT";
pub const TMP_DIR: &str = "TMP_DIR";
pub const CACHE_DIR: &str = "CACHE_DIR";

pub const COMMON_DEFAULTS: &[(&str, &str)] = &[
    (USE_SSL, "true"),
    (PING_TIMEOUT_SEC, "60"),
    ("LOG_CLEAN_INTERVAL", "86400"),
];

pub const NO_SSL_DEFAULTS: &[(&str, &str)] = &[("STUBBY_PROXY_PORT", "80")];

/// Same rule compiler_proxy uses: anything starting with t, y or 1 is true.
pub fn is_truthy(value: &str) -> bool {
    matches!(value.chars().next(), Some('t' | 'T' | 'y' | 'Y' | '1'))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GomaFlags {
    values: BTreeMap<String, String>,
    user_set: BTreeSet<String>,
}

impl GomaFlags {
    pub fn from_process_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Keeps only `GOMA_*` variables; they all count as set by the operator.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with(FLAG_PREFIX))
            .collect();
        let user_set = values.keys().cloned().collect();
        Self { values, user_set }
    }

    fn full_name(name: &str) -> String {
        format!("{}{}", FLAG_PREFIX, name)
    }

    /// `name` is given without the `GOMA_` prefix.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(&Self::full_name(name)).map(String::as_str)
    }

    pub fn is_true(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(v) if !v.is_empty() => is_truthy(v),
            _ => default,
        }
    }

    /// True only when the operator configured the flag, not a default.
    pub fn is_user_set(&self, name: &str) -> bool {
        self.user_set.contains(&Self::full_name(name))
    }

    pub fn set_default(&mut self, name: &str, value: &str) {
        self.values
            .entry(Self::full_name(name))
            .or_insert_with(|| value.to_string());
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.values.insert(Self::full_name(name), value.to_string());
    }

    pub fn apply_defaults(&mut self, defaults: &[(&str, &str)]) {
        for (name, value) in defaults {
            self.set_default(name, value);
        }
    }

    /// Layers common, platform and SSL dependent defaults.
    pub fn apply_platform_defaults(
        &mut self,
        platform_defaults: &[(&str, &str)],
        ssl_defaults: &[(&str, &str)],
    ) {
        self.apply_defaults(COMMON_DEFAULTS);
        self.apply_defaults(platform_defaults);
        if self.is_true(USE_SSL, false) {
            self.apply_defaults(ssl_defaults);
        } else {
            self.apply_defaults(NO_SSL_DEFAULTS);
        }
    }

    pub fn apply_proxy(&mut self, proxy: Option<&ProxySetting>) {
        if let Some(proxy) = proxy {
            self.set_default(PROXY_HOST, &proxy.host);
            self.set_default(PROXY_PORT, &proxy.port.to_string());
        }
    }

    /// `host:port` of the HTTP proxy used for downloads, if configured.
    pub fn proxy_address(&self) -> Option<String> {
        Some(format!("{}:{}", self.get(PROXY_HOST)?, self.get(PROXY_PORT)?))
    }

    /// Full `GOMA_*` names and values, for spawning the daemon.
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when the flags a running daemon reports differ from this set in
    /// either direction.
    pub fn differs_from(&self, reported: &BTreeMap<String, String>) -> bool {
        reported
            .iter()
            .any(|(key, value)| self.values.get(key) != Some(value))
            || self
                .values
                .iter()
                .any(|(key, value)| reported.get(key) != Some(value))
    }
}

/// Parses `/flagz`, dropping flags the daemon configured automatically.
pub fn parse_flagz(flagz: &str) -> BTreeMap<String, String> {
    flagz
        .lines()
        .map(str::trim)
        .filter(|line| !line.ends_with(AUTO_CONFIGURED_SUFFIX))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySetting {
    pub host: String,
    pub port: u16,
}

/// Detects an HTTP proxy from the usual `https_proxy`/`http_proxy` variables.
/// HTTPS proxies, credentials and missing ports are rejected.
pub fn detect_proxy<F>(lookup: F) -> Result<Option<ProxySetting>>
where
    F: Fn(&str) -> Option<String>,
{
    let candidates = ["https_proxy", "HTTPS_PROXY", "http_proxy", "HTTP_PROXY"];
    let Some(raw) = candidates
        .iter()
        .filter_map(|name| lookup(name))
        .find(|v| !v.is_empty())
    else {
        return Ok(None);
    };

    let with_scheme = if raw.contains("://") {
        raw.clone()
    } else {
        format!("http://{}", raw)
    };
    let url = reqwest::Url::parse(&with_scheme)
        .map_err(|e| CtlError::Config(format!("Invalid HTTP proxy {}: {}", raw, e)))?;

    if url.scheme() == "https" {
        return Err(CtlError::Config(
            "Sorry, GOMA do not support proxy with HTTPS.".into(),
        ));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(CtlError::Config(
            "Sorry, GOMA do not support proxy with user/password.".into(),
        ));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| CtlError::Config("You should set HTTP proxy host.".into()))?;
    let port = url.port().ok_or_else(|| {
        CtlError::Config("You cannot omit HTTP proxy port to use GOMA.".into())
    })?;

    Ok(Some(ProxySetting {
        host: host.to_string(),
        port,
    }))
}
