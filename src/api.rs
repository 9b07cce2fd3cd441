//! Voyager custom resources: `Ingress` (routing rules rendered into HAProxy
//! configuration) and `Certificate` (ACME-issued TLS material).

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap as Map;

use crate::{Error, Result};

pub mod annotations;

use annotations::Annotations;

pub const GROUP: &str = "voyager.appscode.com";
pub const API_VERSION: &str = "voyager.appscode.com/v1beta1";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "voyager.appscode.com",
    version = "v1beta1",
    kind = "Ingress",
    namespaced,
    shortname = "ing"
)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Serves requests matching no rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<HttpIngressBackend>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<IngressTls>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frontend_rules: Vec<FrontendRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<IngressRule>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressTls {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    /// Reference to a Secret or a Certificate holding the TLS material.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<LocalTypedReference>,
}

impl IngressTls {
    pub fn secret_name(&self) -> Option<String> {
        if let Some(name) = &self.secret_name {
            return Some(name.clone());
        }
        let r = self.reference.as_ref()?;
        match r.kind.as_deref() {
            Some("Certificate") => Some(format!("{CERT_SECRET_PREFIX}{}", r.name)),
            _ => Some(r.name.clone()),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalTypedReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrontendRule {
    pub port: IntOrString,
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpIngressRuleValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpIngressRuleValue>,
}

impl IngressRule {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("")
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpIngressRuleValue {
    /// Overrides the 80/443 default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<IntOrString>,
    #[serde(default, rename = "noTLS")]
    pub no_tls: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(default)]
    pub paths: Vec<HttpIngressPath>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TcpIngressRuleValue {
    pub port: IntOrString,
    #[serde(default, rename = "noTLS")]
    pub no_tls: bool,
    pub backend: IngressBackend,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpIngressPath {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub backend: HttpIngressBackend,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressBackend {
    /// Explicit HAProxy backend name; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Restrict endpoints to pods with these hostnames.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_names: Vec<String>,
    /// `name` or `name.namespace`
    pub service_name: String,
    pub service_port: IntOrString,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balance_on: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpIngressBackend {
    #[serde(flatten)]
    pub backend: IngressBackend,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rewrite_rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_rules: Vec<String>,
}

pub fn port_string(port: &IntOrString) -> String {
    match port {
        IntOrString::Int(n) => n.to_string(),
        IntOrString::String(s) => s.clone(),
    }
}

/// Numeric value of a port; named ports read as 0.
pub fn port_number(port: &IntOrString) -> i32 {
    match port {
        IntOrString::Int(n) => *n,
        IntOrString::String(s) => s.parse().unwrap_or(0),
    }
}

impl Ingress {
    pub fn annotations(&self) -> Annotations<'_> {
        Annotations(self.metadata.annotations.as_ref())
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    pub fn lb_type(&self) -> String {
        self.annotations()
            .string_or(annotations::LB_TYPE, annotations::LB_TYPE_LOAD_BALANCER)
    }

    pub fn keep_source_ip(&self) -> bool {
        self.annotations().flag(annotations::KEEP_SOURCE_IP)
    }

    pub fn accept_proxy(&self) -> bool {
        self.annotations().flag(annotations::ACCEPT_PROXY)
    }

    /// Cookie affinity for every backend.
    pub fn sticky(&self) -> bool {
        self.annotations().str(annotations::AFFINITY) == Some("cookie")
    }

    pub fn sticky_cookie_name(&self) -> String {
        self.annotations()
            .string_or(annotations::SESSION_COOKIE_NAME, DEFAULT_STICKY_COOKIE)
    }

    pub fn sticky_cookie_hash(&self) -> Option<String> {
        self.annotations()
            .str(annotations::SESSION_COOKIE_HASH)
            .map(String::from)
    }

    pub fn stats(&self) -> bool {
        self.annotations().flag(annotations::STATS)
    }

    pub fn stats_port(&self) -> Result<u16> {
        Ok(self
            .annotations()
            .parse(annotations::STATS_PORT)?
            .unwrap_or(annotations::DEFAULT_STATS_PORT))
    }

    pub fn stats_secret_name(&self) -> Option<String> {
        self.annotations()
            .str(annotations::STATS_SECRET)
            .map(String::from)
    }

    /// Timeouts from the annotation, completed with the defaults for any
    /// phase left unset.
    pub fn timeouts(&self) -> Result<Map<String, String>> {
        let mut timeouts: Map<String, String> = self
            .annotations()
            .json(annotations::DEFAULT_TIMEOUT)?
            .unwrap_or_default();
        for (phase, duration) in DEFAULT_TIMEOUTS {
            timeouts
                .entry(phase.to_string())
                .or_insert_with(|| duration.to_string());
        }
        Ok(timeouts)
    }

    pub fn haproxy_options(&self) -> Result<Map<String, bool>> {
        let raw: Map<String, String> = self
            .annotations()
            .json(annotations::DEFAULT_OPTION)?
            .unwrap_or_default();
        let options: Map<String, bool> = raw
            .into_iter()
            .filter_map(|(k, v)| Some((k, v.trim().parse().ok()?)))
            .collect();
        if options.is_empty() {
            return Ok(DEFAULT_OPTIONS
                .iter()
                .map(|o| (o.to_string(), true))
                .collect());
        }
        Ok(options)
    }

    pub fn max_connections(&self) -> Result<Option<i32>> {
        self.annotations().parse(annotations::MAX_CONNECTIONS)
    }

    pub fn cors(&self) -> crate::haproxy::CorsConfig {
        let a = self.annotations();
        crate::haproxy::CorsConfig {
            enabled: a.flag(annotations::CORS_ENABLED),
            allowed_origin: a.string_or(annotations::CORS_ALLOWED_ORIGIN, "*"),
            allowed_methods: a.string_or(
                annotations::CORS_ALLOWED_METHODS,
                "GET,PUT,POST,DELETE,PATCH,OPTIONS",
            ),
            allowed_headers: a.string_or(
                annotations::CORS_ALLOWED_HEADERS,
                "DNT,X-CustomHeader,Keep-Alive,User-Agent,X-Requested-With,If-Modified-Since,Cache-Control,Content-Type,Authorization",
            ),
            allow_credentials: a.flag(annotations::CORS_ALLOW_CREDENTIALS),
        }
    }

    pub fn hsts(&self) -> Result<Option<crate::haproxy::HstsConfig>> {
        let a = self.annotations();
        // enabled unless explicitly turned off
        if a.parse::<bool>(annotations::HSTS)? == Some(false) {
            return Ok(None);
        }
        Ok(Some(crate::haproxy::HstsConfig {
            max_age: a
                .parse(annotations::HSTS_MAX_AGE)?
                .unwrap_or(annotations::DEFAULT_HSTS_MAX_AGE),
            preload: a.flag(annotations::HSTS_PRELOAD),
            include_subdomains: a.flag(annotations::HSTS_INCLUDE_SUBDOMAINS),
        }))
    }

    pub fn proxy_body_size(&self) -> Option<String> {
        self.annotations()
            .str(annotations::PROXY_BODY_SIZE)
            .map(String::from)
    }

    pub fn whitelist_source_range(&self) -> Option<String> {
        self.annotations()
            .str(annotations::WHITELIST_SOURCE_RANGE)
            .map(String::from)
    }

    pub fn rewrite_target(&self) -> Option<String> {
        self.annotations()
            .str(annotations::REWRITE_TARGET)
            .map(String::from)
    }

    /// on unless explicitly disabled
    pub fn ssl_redirect(&self) -> bool {
        self.annotations()
            .parse::<bool>(annotations::SSL_REDIRECT)
            .ok()
            .flatten()
            .unwrap_or(true)
    }

    pub fn force_ssl_redirect(&self) -> bool {
        self.annotations().flag(annotations::FORCE_SSL_REDIRECT)
    }

    pub fn basic_auth_enabled(&self) -> bool {
        self.annotations().str(annotations::AUTH_TYPE) == Some("basic")
    }

    pub fn auth_realm(&self) -> String {
        self.annotations()
            .string_or(annotations::AUTH_REALM, "Realm")
    }

    pub fn auth_secret_name(&self) -> Option<String> {
        self.annotations()
            .str(annotations::AUTH_SECRET)
            .map(String::from)
    }

    /// TLS secret bound to `host` by `spec.tls`, if any.
    pub fn tls_secret_for_host(&self, host: &str) -> Option<String> {
        self.spec
            .tls
            .iter()
            .find(|tls| tls.hosts.iter().any(|h| h == host))
            .and_then(|tls| tls.secret_name())
    }

    /// TLS secret terminating traffic for this rule: the host must be bound
    /// in `spec.tls` and the rule must not opt out with `noTLS`.
    pub fn tls_secret_for_rule(&self, rule: &IngressRule) -> Option<String> {
        let no_tls = match (&rule.http, &rule.tcp) {
            (Some(http), _) => http.no_tls,
            (None, Some(tcp)) => tcp.no_tls,
            (None, None) => true,
        };
        if no_tls {
            return None;
        }
        self.tls_secret_for_host(rule.host())
    }
}

pub const DEFAULT_STICKY_COOKIE: &str = "SERVERID";

const DEFAULT_TIMEOUTS: [(&str, &str); 5] = [
    ("connect", "5s"),
    ("client", "50s"),
    ("client-fin", "50s"),
    ("server", "50s"),
    ("tunnel", "50s"),
];

const DEFAULT_OPTIONS: [&str; 2] = ["http-server-close", "dontlognull"];
pub const CERT_SECRET_PREFIX: &str = "tls-";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "voyager.appscode.com",
    version = "v1beta1",
    kind = "Certificate",
    namespaced,
    shortname = "cert",
    status = "CertificateStatus",
    printcolumn = r#"{"name":"Domains","type":"string","jsonPath":".spec.domains[0]"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// The first domain is the certificate's common name; all of them are
    /// subject alternative names.
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub challenge_provider: ChallengeProvider,
    /// Secret holding `ACME_EMAIL` and the account registration.
    #[serde(default, rename = "acmeUserSecretName")]
    pub acme_user_secret_name: String,
    #[serde(default)]
    pub storage: CertificateStorage,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeProvider {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpChallengeProvider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsChallengeProvider>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpChallengeProvider {
    pub ingress: LocalTypedReference,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DnsChallengeProvider {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_secret_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStorage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretStore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault: Option<VaultStore>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretStore {
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct VaultStore {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CertificateCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_issued_certificate: Option<CertificateDetails>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDetails {
    #[serde(default)]
    pub serial_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<Time>,
    #[serde(default, rename = "certURL")]
    pub cert_url: String,
    #[serde(default, rename = "certStableURL")]
    pub cert_stable_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_ref: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    Issued,
    Failed,
    RateLimited,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,
}

impl CertificateStatus {
    /// Sets a condition of `type_`, updating an existing one in place.
    pub fn set_condition(&mut self, type_: ConditionType, reason: &str, now: Time) {
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(c) => {
                c.last_update_time = Some(now);
                c.reason = reason.to_string();
            }
            None => self.conditions.push(CertificateCondition {
                type_,
                reason: reason.to_string(),
                message: String::new(),
                last_update_time: Some(now),
            }),
        }
    }
}

impl Certificate {
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    /// Name under which the issued certificate is stored.
    pub fn secret_name(&self) -> String {
        let storage = &self.spec.storage;
        match (&storage.secret, &storage.vault) {
            (Some(s), _) if !s.name.is_empty() => s.name.clone(),
            (_, Some(v)) if !v.name.is_empty() => v.name.clone(),
            _ => format!("{CERT_SECRET_PREFIX}{}", self.name()),
        }
    }

    pub fn last_issued(&self) -> Option<&CertificateDetails> {
        self.status.as_ref()?.last_issued_certificate.as_ref()
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(Error::invalid("certificate", self.key(), reason));

        if self.spec.domains.is_empty() {
            return invalid("domain list is empty");
        }
        if self.spec.acme_user_secret_name.is_empty() {
            return invalid("acmeUserSecretName is empty");
        }
        match (&self.spec.challenge_provider.http, &self.spec.challenge_provider.dns) {
            (Some(_), Some(_)) => invalid("both http and dns challenge providers are set"),
            (None, None) => invalid("no challenge provider is set"),
            (Some(http), None) if http.ingress.name.is_empty() => {
                invalid("http challenge provider has no ingress reference")
            }
            (None, Some(dns)) if dns.provider.is_empty() => invalid("dns provider name is empty"),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn certificate(spec: CertificateSpec) -> Certificate {
        let mut crd = Certificate::new("web", spec);
        crd.metadata.namespace = Some("default".into());
        crd
    }

    #[test]
    fn certificate_secret_name() {
        let mut crd = certificate(CertificateSpec::default());
        assert_eq!("tls-web", crd.secret_name());

        crd.spec.storage.vault = Some(VaultStore {
            name: "web-vault".into(),
            prefix: "secret".into(),
        });
        assert_eq!("web-vault", crd.secret_name());

        crd.spec.storage.secret = Some(SecretStore { name: "web-tls".into() });
        assert_eq!("web-tls", crd.secret_name());
    }

    #[test]
    fn certificate_validation() {
        let mut crd = certificate(CertificateSpec {
            domains: vec!["example.com".into()],
            acme_user_secret_name: "acme".into(),
            ..Default::default()
        });
        assert!(crd.validate().is_err());

        crd.spec.challenge_provider.dns = Some(DnsChallengeProvider {
            provider: "cloudflare".into(),
            credential_secret_name: Some("cf".into()),
        });
        assert!(crd.validate().is_ok());

        crd.spec.challenge_provider.http = Some(HttpChallengeProvider {
            ingress: LocalTypedReference {
                name: "web".into(),
                ..Default::default()
            },
        });
        assert!(crd.validate().is_err());
    }

    #[test]
    fn conditions_update_in_place() {
        let mut status = CertificateStatus::default();
        let t0 = Time(k8s_openapi::chrono::DateTime::from_timestamp(0, 0).unwrap());
        let t1 = Time(k8s_openapi::chrono::DateTime::from_timestamp(60, 0).unwrap());

        status.set_condition(ConditionType::Failed, "first", t0);
        status.set_condition(ConditionType::Failed, "second", t1.clone());
        status.set_condition(ConditionType::Issued, "", t1.clone());

        assert_eq!(2, status.conditions.len());
        assert_eq!("second", status.conditions[0].reason);
        assert_eq!(Some(t1), status.conditions[0].last_update_time);
    }

    #[test]
    fn tls_binding_for_rules() {
        let ing: Ingress = serde_json::from_value(serde_json::json!({
            "apiVersion": API_VERSION,
            "kind": "Ingress",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "tls": [
                    {"hosts": ["secure.example.com"], "secretName": "secure-tls"},
                    {"hosts": ["cert.example.com"], "ref": {"kind": "Certificate", "name": "cert"}},
                ],
                "rules": [
                    {"host": "secure.example.com", "http": {"paths": []}},
                    {"host": "secure.example.com", "http": {"noTLS": true, "paths": []}},
                    {"host": "cert.example.com", "tcp": {"port": 993, "backend": {"serviceName": "imap", "servicePort": 993}}},
                    {"host": "plain.example.com", "http": {"paths": []}},
                ],
            },
        }))
        .unwrap();

        let secrets: Vec<_> = ing
            .spec
            .rules
            .iter()
            .map(|r| ing.tls_secret_for_rule(r))
            .collect();
        assert_eq!(
            vec![
                Some("secure-tls".to_string()),
                None,
                Some("tls-cert".to_string()),
                None
            ],
            secrets
        );
    }
}
