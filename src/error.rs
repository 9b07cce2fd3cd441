use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
    #[error("watch failed: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    #[error("haproxy frontend name {0} is reused")]
    FrontendReused(String),
    #[error("haproxy backend name {0} is reused")]
    BackendReused(String),

    #[error("service port {port} unavailable for service {service}")]
    ServicePortUnavailable { service: String, port: String },
    #[error("service {0} not found")]
    ServiceNotFound(String),
    #[error("failed to load stats secret for ingress {0}")]
    StatsSecret(String),
    #[error("invalid value for annotation {key}: {reason}")]
    Annotation { key: String, reason: String },
    #[error("invalid {kind} {name}: {reason}")]
    Invalid {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("openssl error: {0}")]
    Openssl(#[from] openssl::error::ErrorStack),
    #[error("{0}")]
    BadCertificate(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no acme user email is provided")]
    MissingAcmeEmail,
    #[error("unknown provider specified: {0}")]
    UnknownProvider(String),
    #[error("dns provider credential missing key {0}")]
    MissingCredential(&'static str),
    #[error("acme client returned an empty certificate")]
    EmptyCert,
    #[error("acme error: {0}")]
    Acme(String),
    #[error("acme error: {0}")]
    AcmeProtocol(#[from] instant_acme::Error),
    #[error("dns provider {0} cannot publish challenge records")]
    UnsupportedDnsProvider(&'static str),
    #[error("no dns zone found for {0}")]
    DnsZoneNotFound(String),

    #[error("vault error: {0}")]
    Vault(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to update {resource} after {attempts} attempts: {source}")]
    RetryExhausted {
        resource: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn invalid(kind: &'static str, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            kind,
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn annotation(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Annotation {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Conflict on an optimistic-concurrency write; safe to re-read and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(e)) if e.code == 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: "Conflict".into(),
            code,
        }))
    }

    #[test]
    fn classifies_api_errors() {
        assert!(api_error(409).is_conflict());
        assert!(!api_error(409).is_not_found());
        assert!(api_error(404).is_not_found());
        assert!(!Error::EmptyCert.is_conflict());
    }

    #[test]
    fn collision_messages_name_the_resource() {
        let e = Error::FrontendReused("http-0_0_0_0-80".into());
        assert_eq!("haproxy frontend name http-0_0_0_0-80 is reused", e.to_string());
    }
}
