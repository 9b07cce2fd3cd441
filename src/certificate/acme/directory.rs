//! [`AcmeClient`] for ACME v2 directories such as Let's Encrypt, built on
//! `instant-acme`.
//!
//! The account key and URL live in the registration data persisted in the
//! user secret. Certificates get a fresh RSA key on every issuance; ACME v2
//! has no renewal, so a renewal is a new order for the same domains.

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use log::{debug, info, warn};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509ReqBuilder};
use std::time::Duration;
use tokio::sync::OnceCell;

use super::{AcmeClient, AcmeClientFactory, AcmeUser, CertificateResource};
use crate::certificate::CertInfo;
use crate::certificate::providers::Challenge;
use crate::{Error, Result};

const CERT_KEY_BITS: u32 = 2048;

const POLL_ATTEMPTS: u32 = 10;
const POLL_FIRST_DELAY: Duration = Duration::from_secs(1);
const POLL_MAX_DELAY: Duration = Duration::from_secs(16);

pub struct DirectoryFactory {
    dns_propagation: Duration,
}

impl DirectoryFactory {
    /// `dns_propagation` is waited after publishing DNS-01 records.
    pub fn new(dns_propagation: Duration) -> Self {
        Self { dns_propagation }
    }
}

#[async_trait]
impl AcmeClientFactory for DirectoryFactory {
    async fn client(&self, user: &AcmeUser, challenge: Challenge) -> Result<Box<dyn AcmeClient>> {
        let credentials = user.registration.as_ref().and_then(|reg| {
            match serde_json::from_value::<AccountCredentials>(reg.clone()) {
                Ok(credentials) => Some(credentials),
                Err(e) => {
                    warn!("registration of {} is not an ACME v2 account: {e}", user.email);
                    None
                }
            }
        });
        let account = match credentials {
            Some(credentials) => Some(Account::from_credentials(credentials).await?),
            None => None,
        };

        Ok(Box::new(DirectoryClient {
            email: user.email.clone(),
            server_url: user.server_url.clone(),
            account: OnceCell::new_with(account),
            challenge,
            dns_propagation: self.dns_propagation,
        }))
    }
}

struct DirectoryClient {
    email: String,
    server_url: String,
    account: OnceCell<Account>,
    challenge: Challenge,
    dns_propagation: Duration,
}

/// A challenge presented to the CA and not cleaned up yet.
struct Pending {
    domain: String,
    token: String,
    key_auth: String,
    url: String,
}

impl DirectoryClient {
    fn account(&self) -> Result<&Account> {
        self.account.get().ok_or_else(|| {
            Error::Acme(format!(
                "{} has no account at {}, registration data is unusable",
                self.email, self.server_url
            ))
        })
    }

    fn challenge_type(&self) -> ChallengeType {
        match self.challenge {
            Challenge::Http(_) => ChallengeType::Http01,
            Challenge::Dns(_) => ChallengeType::Dns01,
        }
    }

    /// Presents a challenge for every pending authorization of `order`.
    async fn authorize(&self, order: &mut Order) -> Result<Vec<Pending>> {
        let wanted = self.challenge_type();
        let mut pending = vec![];
        for authz in order.authorizations().await? {
            let Identifier::Dns(domain) = &authz.identifier else {
                continue;
            };
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                ref status => {
                    self.clean_up(&pending).await;
                    return Err(Error::Acme(format!("authorization of {domain} is {status:?}")));
                }
            }

            let Some(challenge) = authz.challenges.iter().find(|c| c.r#type == wanted) else {
                self.clean_up(&pending).await;
                return Err(Error::Acme(format!(
                    "CA offers no {} challenge for {domain}",
                    self.challenge.name()
                )));
            };
            let key_auth = order.key_authorization(challenge).as_str().to_string();
            let presented = self
                .challenge
                .provider()
                .present(domain, &challenge.token, &key_auth)
                .await;
            if let Err(e) = presented {
                self.clean_up(&pending).await;
                return Err(e);
            }
            pending.push(Pending {
                domain: domain.clone(),
                token: challenge.token.clone(),
                key_auth,
                url: challenge.url.clone(),
            });
        }
        Ok(pending)
    }

    async fn clean_up(&self, pending: &[Pending]) {
        for p in pending {
            let provider = self.challenge.provider();
            if let Err(e) = provider.clean_up(&p.domain, &p.token, &p.key_auth).await {
                warn!("[{}] failed to clean up challenge: {e}", p.domain);
            }
        }
    }

    /// Tells the CA the challenges are ready and waits for the order to be.
    async fn validate(&self, order: &mut Order, pending: &[Pending]) -> Result<()> {
        if !pending.is_empty() && matches!(self.challenge, Challenge::Dns(_)) {
            debug!("waiting {:?} for DNS records to propagate", self.dns_propagation);
            tokio::time::sleep(self.dns_propagation).await;
        }
        for p in pending {
            order.set_challenge_ready(&p.url).await?;
        }

        let mut delay = POLL_FIRST_DELAY;
        for _ in 0..POLL_ATTEMPTS {
            order.refresh().await?;
            let state = order.state();
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    let reason = state.error.as_ref().map(|e| e.to_string());
                    let reason = reason.unwrap_or_else(|| "no reason given".into());
                    return Err(Error::Acme(format!("order is invalid: {reason}")));
                }
                _ => {}
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX_DELAY);
        }
        Err(Error::Acme("timed out waiting for the order to be ready".into()))
    }

    async fn download(&self, order: &mut Order) -> Result<String> {
        let mut delay = POLL_FIRST_DELAY;
        for _ in 0..POLL_ATTEMPTS {
            if let Some(chain) = order.certificate().await? {
                return Ok(chain);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX_DELAY);
        }
        Err(Error::Acme("timed out waiting for the certificate".into()))
    }
}

#[async_trait]
impl AcmeClient for DirectoryClient {
    async fn register(&self) -> Result<serde_json::Value> {
        let contact = format!("mailto:{}", self.email);
        let new_account = NewAccount {
            contact: &[&contact],
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (account, credentials) =
            Account::create(&new_account, &self.server_url, None).await?;
        info!("registered ACME account {} for {}", account.id(), self.email);

        let registration = serde_json::to_value(&credentials)?;
        self.account
            .set(account)
            .map_err(|_| Error::Acme(format!("{} is already registered", self.email)))?;
        Ok(registration)
    }

    async fn agree_to_tos(&self) -> Result<()> {
        // ACME v2 takes the agreement with the account creation
        self.account()?;
        Ok(())
    }

    async fn obtain(&self, domains: &[String]) -> Result<CertificateResource> {
        let account = self.account()?;
        let identifiers: Vec<_> = domains.iter().cloned().map(Identifier::Dns).collect();
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let pending = self.authorize(&mut order).await?;
        let validated = self.validate(&mut order, &pending).await;
        self.clean_up(&pending).await;
        validated?;

        let (csr, private_key) = certificate_request(domains)?;
        order.finalize(&csr).await?;
        let chain = self.download(&mut order).await?;
        info!("issued certificate for {}", domains.join(", "));

        let cert_url = order.state().certificate.clone().unwrap_or_default();
        Ok(CertificateResource {
            domain: domains.first().cloned().unwrap_or_default(),
            cert_stable_url: cert_url.clone(),
            cert_url,
            account_ref: account.id().to_string(),
            certificate: chain.into_bytes(),
            private_key,
        })
    }

    async fn renew(&self, previous: CertificateResource) -> Result<CertificateResource> {
        if previous.certificate.is_empty() {
            return Err(Error::EmptyCert);
        }
        let info = CertInfo::from_pem(&previous.certificate)?;
        self.obtain(&renewal_domains(&previous.domain, &info)).await
    }
}

/// Domains of the certificate being renewed, `main` first.
fn renewal_domains(main: &str, info: &CertInfo) -> Vec<String> {
    let mut domains = vec![];
    let candidates = std::iter::once(main)
        .chain(info.common_name.as_deref())
        .chain(info.dns_names.iter().map(String::as_str));
    for d in candidates.filter(|d| !d.is_empty()) {
        if !domains.iter().any(|known| known == d) {
            domains.push(d.to_string());
        }
    }
    domains
}

/// DER CSR for `domains`, the first one being the common name, and the PEM
/// key it was signed with.
fn certificate_request(domains: &[String]) -> Result<(Vec<u8>, Vec<u8>)> {
    let cn = domains.first().ok_or(Error::EmptyCert)?;
    let key = PKey::from_rsa(Rsa::generate(CERT_KEY_BITS)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, cn)?;
    let name = name.build();

    let mut req = X509ReqBuilder::new()?;
    req.set_pubkey(&key)?;
    req.set_subject_name(&name)?;

    let mut san = SubjectAlternativeName::new();
    for d in domains {
        san.dns(d);
    }
    let san = san.build(&req.x509v3_context(None))?;
    let mut extensions = Stack::new()?;
    extensions.push(san)?;
    req.add_extensions(&extensions)?;

    req.sign(&key, MessageDigest::sha256())?;
    Ok((req.build().to_der()?, key.private_key_to_pem_pkcs8()?))
}
