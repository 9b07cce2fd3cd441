//! ACME account handling and the client seam.
//!
//! The controller talks to the CA through [`AcmeClient`]. This module knows
//! how an account is persisted in the user secret; [`directory`] implements
//! the client against an ACME v2 directory.

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use log::{debug, warn};
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use std::collections::BTreeMap as Map;

use super::providers::Challenge;
use crate::{Error, Result};

pub mod directory;

pub const LETS_ENCRYPT_PROD_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING_URL: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Port of the HTTP-01 responder behind the challenge route.
pub const RESPONDER_PORT: u16 = 56791;

/// User secret keys.
pub const USER_EMAIL: &str = "ACME_EMAIL";
pub const SERVER_URL: &str = "ACME_SERVER_URL";
pub const REGISTRATION_DATA: &str = "ACME_REGISTRATION_DATA";
pub const USER_PRIVATE_KEY: &str = "ACME_USER_PRIVATE_KEY";

const USER_KEY_BITS: u32 = 2048;

/// Problem types the CA uses for rate-limit errors, ACME v1 and v2.
pub const RATE_LIMITED_MARKERS: [&str; 2] = [
    "urn:acme:error:rateLimited",
    "urn:ietf:params:acme:error:rateLimited",
];

/// An ACME account, rebuilt from its secret on every run.
#[derive(Clone, Debug)]
pub struct AcmeUser {
    pub email: String,
    pub server_url: String,
    /// Registration resource as returned by the CA.
    pub registration: Option<serde_json::Value>,
    pub key: Option<PKey<Private>>,
}

impl AcmeUser {
    /// Unreadable registration data or keys are treated as absent, leading to
    /// a new registration.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let empty = Map::new();
        let data = secret.data.as_ref().unwrap_or(&empty);
        let get = |key: &str| data.get(key).map(|v| v.0.as_slice());

        let email = get(USER_EMAIL)
            .map(|v| String::from_utf8_lossy(v).trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(Error::MissingAcmeEmail)?;

        let server_url = get(SERVER_URL)
            .map(|v| String::from_utf8_lossy(v).trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| LETS_ENCRYPT_PROD_URL.to_string());

        let registration = get(REGISTRATION_DATA).and_then(|v| match serde_json::from_slice(v) {
            Ok(reg) => Some(reg),
            Err(e) => {
                warn!("ignoring unreadable registration of {email}: {e}");
                None
            }
        });

        let key = get(USER_PRIVATE_KEY).and_then(|v| {
            match Rsa::private_key_from_pem(v).and_then(PKey::from_rsa) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("ignoring unreadable private key of {email}: {e}");
                    None
                }
            }
        });

        Ok(Self {
            email,
            server_url,
            registration,
            key,
        })
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some() && self.key.is_some()
    }

    /// Makes sure the account has a key, generating one if needed.
    pub fn ensure_key(&mut self) -> Result<()> {
        if self.key.is_none() {
            debug!("generating a new account key for {}", self.email);
            self.key = Some(PKey::from_rsa(Rsa::generate(USER_KEY_BITS)?)?);
        }
        Ok(())
    }

    /// Secret data persisting the account after a registration.
    pub fn to_secret_data(&self) -> Result<Map<String, ByteString>> {
        let mut data = Map::new();
        if let Some(key) = &self.key {
            let pem = key.rsa()?.private_key_to_pem()?;
            data.insert(USER_PRIVATE_KEY.to_string(), ByteString(pem));
        }
        if let Some(reg) = &self.registration {
            data.insert(REGISTRATION_DATA.to_string(), ByteString(serde_json::to_vec(reg)?));
        }
        Ok(data)
    }
}

/// Issued certificate and where the CA keeps it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificateResource {
    pub domain: String,
    pub cert_url: String,
    pub cert_stable_url: String,
    pub account_ref: String,
    /// PEM chain
    pub certificate: Vec<u8>,
    /// PEM key; left empty on renewal requests to get a fresh key.
    pub private_key: Vec<u8>,
}

impl CertificateResource {
    pub fn is_empty(&self) -> bool {
        self.certificate.is_empty() || self.private_key.is_empty()
    }
}

/// A client bound to one account and one challenge mechanism.
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Registers the account, returning the registration resource.
    async fn register(&self) -> Result<serde_json::Value>;

    async fn agree_to_tos(&self) -> Result<()>;

    /// Issues a certificate covering all `domains`, the first one being the
    /// common name.
    async fn obtain(&self, domains: &[String]) -> Result<CertificateResource>;

    /// Renews `previous`; `Err(Error::EmptyCert)` or an empty result make the
    /// caller fall back to a fresh issuance.
    async fn renew(&self, previous: CertificateResource) -> Result<CertificateResource>;
}

#[async_trait]
pub trait AcmeClientFactory: Send + Sync {
    async fn client(&self, user: &AcmeUser, challenge: Challenge) -> Result<Box<dyn AcmeClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(data: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn email_is_required() {
        let err = AcmeUser::from_secret(&secret(&[])).unwrap_err();
        assert!(matches!(err, Error::MissingAcmeEmail));
        assert_eq!("no acme user email is provided", err.to_string());
    }

    #[test]
    fn defaults_to_production_server() -> Result<()> {
        let user = AcmeUser::from_secret(&secret(&[(USER_EMAIL, "me@example.com")]))?;
        assert_eq!(LETS_ENCRYPT_PROD_URL, user.server_url);
        assert!(!user.is_registered());

        let user = AcmeUser::from_secret(&secret(&[
            (USER_EMAIL, "me@example.com"),
            (SERVER_URL, LETS_ENCRYPT_STAGING_URL),
        ]))?;
        assert_eq!(LETS_ENCRYPT_STAGING_URL, user.server_url);
        Ok(())
    }

    #[test]
    fn account_survives_the_secret() -> Result<()> {
        let mut user = AcmeUser::from_secret(&secret(&[(USER_EMAIL, "me@example.com")]))?;
        user.ensure_key()?;
        user.registration = Some(serde_json::json!({"uri": "https://ca/acct/1"}));

        let data = user.to_secret_data()?;
        let mut restored = Secret {
            data: Some(data),
            ..Default::default()
        };
        restored
            .data
            .get_or_insert_default()
            .insert(USER_EMAIL.into(), ByteString(b"me@example.com".to_vec()));

        let restored = AcmeUser::from_secret(&restored)?;
        assert!(restored.is_registered());
        assert_eq!(user.registration, restored.registration);
        let (a, b) = (user.key.unwrap(), restored.key.unwrap());
        assert!(a.public_eq(&b));
        Ok(())
    }

    #[test]
    fn garbage_account_data_is_ignored() -> Result<()> {
        let user = AcmeUser::from_secret(&secret(&[
            (USER_EMAIL, "me@example.com"),
            (REGISTRATION_DATA, "{not json"),
            (USER_PRIVATE_KEY, "-----BEGIN NOTHING-----"),
        ]))?;
        assert!(user.registration.is_none());
        assert!(user.key.is_none());
        Ok(())
    }
}
