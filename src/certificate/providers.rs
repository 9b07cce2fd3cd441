//! Challenge providers proving domain control to the ACME CA.

use async_trait::async_trait;
use std::collections::BTreeMap as Map;
use std::sync::Arc;

use crate::Result;

pub mod dns;
pub mod http;

pub use dns::DnsProvider;
pub use http::HttpProvider;

/// Name selecting the in-process HTTP-01 responder.
pub const HTTP: &str = "http";

/// Data of the credential secret, keyed by variable name.
pub type Credentials = Map<String, String>;

/// Capability the ACME client drives while a challenge is pending.
#[async_trait]
pub trait ChallengeProvider: Send + Sync {
    /// Makes `key_auth` answerable for `domain` until [`clean_up`].
    ///
    /// [`clean_up`]: ChallengeProvider::clean_up
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()>;
    async fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> Result<()>;
}

/// The one challenge mechanism an ACME client is bound to. Choosing one
/// excludes the other.
#[derive(Clone, Debug)]
pub enum Challenge {
    Http(Arc<HttpProvider>),
    Dns(DnsProvider),
}

impl Challenge {
    /// `name` is matched case-insensitively.
    pub async fn select(
        name: &str,
        credentials: &Credentials,
        cloud_provider: &str,
        http: &Arc<HttpProvider>,
    ) -> Result<Self> {
        if name.eq_ignore_ascii_case(HTTP) {
            return Ok(Self::Http(http.clone()));
        }
        Ok(Self::Dns(dns::provider(name, credentials, cloud_provider).await?))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Http(_) => HTTP,
            Self::Dns(p) => p.name,
        }
    }

    pub fn provider(&self) -> &dyn ChallengeProvider {
        match self {
            Self::Http(p) => p.as_ref(),
            Self::Dns(p) => p,
        }
    }
}
