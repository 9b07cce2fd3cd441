use serde::de::DeserializeOwned;
use std::collections::BTreeMap as Map;
use std::str::FromStr;

use crate::{Error, Result};

macro_rules! key {
    ($name:ident, $suffix:literal) => {
        pub const $name: &str = concat!("ingress.appscode.com/", $suffix);
    };
}

// ingress; affinity and the session cookie keys also apply to services
key!(LB_TYPE, "type");
key!(KEEP_SOURCE_IP, "keep-source-ip");
key!(ACCEPT_PROXY, "accept-proxy");
key!(AFFINITY, "affinity");
key!(SESSION_COOKIE_NAME, "session-cookie-name");
key!(SESSION_COOKIE_HASH, "session-cookie-hash");
key!(STATS, "stats");
key!(STATS_PORT, "stats-port");
key!(STATS_SECRET, "stats-secret-name");
key!(DEFAULT_TIMEOUT, "default-timeout");
key!(DEFAULT_OPTION, "default-option");
key!(CORS_ENABLED, "enable-cors");
key!(CORS_ALLOWED_ORIGIN, "cors-allow-origin");
key!(CORS_ALLOWED_METHODS, "cors-allow-methods");
key!(CORS_ALLOWED_HEADERS, "cors-allow-headers");
key!(CORS_ALLOW_CREDENTIALS, "cors-allow-credentials");
key!(HSTS, "hsts");
key!(HSTS_MAX_AGE, "hsts-max-age");
key!(HSTS_PRELOAD, "hsts-preload");
key!(HSTS_INCLUDE_SUBDOMAINS, "hsts-include-subdomains");
key!(PROXY_BODY_SIZE, "proxy-body-size");
key!(WHITELIST_SOURCE_RANGE, "whitelist-source-range");
key!(MAX_CONNECTIONS, "max-connections");
key!(REWRITE_TARGET, "rewrite-target");
key!(SSL_REDIRECT, "ssl-redirect");
key!(FORCE_SSL_REDIRECT, "force-ssl-redirect");
key!(AUTH_TYPE, "auth-type");
key!(AUTH_REALM, "auth-realm");
key!(AUTH_SECRET, "auth-secret");

// pod
key!(BACKEND_WEIGHT, "backend-weight");

// service
key!(BACKEND_TLS, "backend-tls");
key!(CHECK_HEALTH, "check");
key!(CHECK_HEALTH_PORT, "check-port");
key!(SEND_PROXY, "send-proxy");
key!(USE_DNS_RESOLVER, "use-dns-resolver");
key!(DNS_RESOLVER_NAMESERVERS, "dns-resolver-nameservers");
key!(DNS_RESOLVER_CHECK_HEALTH, "dns-resolver-check-health");
key!(DNS_RESOLVER_RETRIES, "dns-resolver-retries");
key!(DNS_RESOLVER_TIMEOUT, "dns-resolver-timeout");
key!(DNS_RESOLVER_HOLD, "dns-resolver-hold");

pub const DEFAULT_STATS_PORT: u16 = 56789;
pub const DEFAULT_HSTS_MAX_AGE: i64 = 15768000;

pub const LB_TYPE_LOAD_BALANCER: &str = "LoadBalancer";

/// Typed reads over an annotation map. Absent keys are `Ok(None)`; present
/// but unparsable values are errors naming the key.
pub struct Annotations<'t>(pub Option<&'t Map<String, String>>);

impl<'t> Annotations<'t> {
    pub fn str(&self, key: &str) -> Option<&'t str> {
        self.0?.get(key).map(|v| v.as_str()).filter(|v| !v.is_empty())
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.str(key).unwrap_or(default).to_string()
    }

    pub fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.str(key)
            .map(|v| v.trim().parse::<T>().map_err(|e| Error::annotation(key, e)))
            .transpose()
    }

    /// missing or malformed booleans read as false
    pub fn flag(&self, key: &str) -> bool {
        self.parse::<bool>(key).ok().flatten().unwrap_or(false)
    }

    pub fn json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.str(key)
            .map(|v| serde_json::from_str(v).map_err(|e| Error::annotation(key, e)))
            .transpose()
    }
}

/// Fails when `values` holds a key outside `allowed`.
pub fn check_map_keys(key: &str, values: &Map<String, String>, allowed: &[&str]) -> Result<()> {
    match values.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(bad) => Err(Error::annotation(
            key,
            format!("invalid key {bad}, expected one of {}", allowed.join(", ")),
        )),
        None => Ok(()),
    }
}
