//! Persistence of issued certificates: a `kubernetes.io/tls` Secret by
//! default, or a Vault generic secret when the Certificate asks for it.

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use log::{debug, info};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap as Map;
use std::sync::Arc;

use super::CertInfo;
use super::acme::CertificateResource;
use super::cluster::CertCluster;
use crate::api::{Certificate, CertificateDetails, ConditionType};
use crate::{Error, Result};

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

const VAULT_ADDR_ENV: &str = "VAULT_ADDR";
const VAULT_TOKEN_ENV: &str = "VAULT_TOKEN";
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// PEM certificate chain and key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredCert {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

pub struct CertStore<C> {
    cluster: Arc<C>,
    vault: Option<VaultClient>,
}

impl<C: CertCluster> CertStore<C> {
    /// The Vault client is only built when `VAULT_ADDR` is set.
    pub fn new(cluster: Arc<C>) -> Result<Self> {
        let vault = match std::env::var(VAULT_ADDR_ENV) {
            Ok(addr) if !addr.is_empty() => Some(VaultClient::from_env(addr)?),
            _ => None,
        };
        Ok(Self { cluster, vault })
    }

    pub fn has_vault(&self) -> bool {
        self.vault.is_some()
    }

    fn vault(&self, crd: &Certificate) -> Result<&VaultClient> {
        self.vault.as_ref().ok_or_else(|| {
            Error::Vault(format!(
                "certificate {} uses vault but vault address is missing",
                crd.key()
            ))
        })
    }

    /// `None` means nothing was issued yet.
    pub async fn get(&self, crd: &Certificate) -> Result<Option<StoredCert>> {
        let ns = crd.namespace();
        let name = crd.secret_name();

        let data: Map<String, Vec<u8>> = if let Some(vault) = &crd.spec.storage.vault {
            let path = vault_path(&vault.prefix, ns, &name);
            match self.vault(crd)?.read(&path).await? {
                None => return Ok(None),
                Some(data) => data.into_iter().map(|(k, v)| (k, v.into_bytes())).collect(),
            }
        } else {
            match self.cluster.secret(ns, &name).await? {
                None => return Ok(None),
                Some(secret) => secret
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, v.0))
                    .collect(),
            }
        };

        stored_cert(data, ns, &name).map(Some)
    }

    /// Writes the material, then records the issued certificate in the
    /// Certificate status.
    pub async fn save(&self, crd: &Certificate, cert: &CertificateResource) -> Result<()> {
        let ns = crd.namespace();
        let name = crd.secret_name();

        if let Some(vault) = &crd.spec.storage.vault {
            let path = vault_path(&vault.prefix, ns, &name);
            let data = Map::from([
                (TLS_CERT_KEY, String::from_utf8_lossy(&cert.certificate).into_owned()),
                (TLS_PRIVATE_KEY_KEY, String::from_utf8_lossy(&cert.private_key).into_owned()),
            ]);
            self.vault(crd)?.write(&path, &data).await?;
        } else {
            self.cluster.apply_secret(tls_secret(ns, &name, cert)).await?;
        }
        info!("stored certificate {} in {ns}/{name}", crd.key());

        let info = CertInfo::from_pem(&cert.certificate).map_err(|e| {
            Error::BadCertificate(format!(
                "failed to parse tls.crt for Certificate {}. Reason: {e}",
                crd.key()
            ))
        })?;
        let details = CertificateDetails {
            serial_number: info.serial_number.clone(),
            not_before: Some(Time(info.not_before)),
            not_after: Some(Time(info.not_after)),
            cert_url: cert.cert_url.clone(),
            cert_stable_url: cert.cert_stable_url.clone(),
            account_ref: cert.account_ref.clone(),
        };

        self.cluster
            .update_status(ns, crd.name(), |c| {
                let status = c.status.get_or_insert_default();
                status.last_issued_certificate = Some(details.clone());
                status.set_condition(ConditionType::Issued, "", super::now());
                true
            })
            .await
    }
}

fn vault_path(prefix: &str, namespace: &str, name: &str) -> String {
    [prefix.trim_matches('/'), namespace, name]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

fn stored_cert(mut data: Map<String, Vec<u8>>, ns: &str, name: &str) -> Result<StoredCert> {
    let mut take = |key: &str| {
        data.remove(key)
            .ok_or_else(|| Error::BadCertificate(format!("secret {ns}/{name} is missing {key}")))
    };
    Ok(StoredCert {
        certificate: take(TLS_CERT_KEY)?,
        private_key: take(TLS_PRIVATE_KEY_KEY)?,
    })
}

fn tls_secret(ns: &str, name: &str, cert: &CertificateResource) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            ..Default::default()
        },
        type_: Some(SECRET_TYPE_TLS.to_string()),
        data: Some(Map::from([
            (TLS_CERT_KEY.to_string(), ByteString(cert.certificate.clone())),
            (TLS_PRIVATE_KEY_KEY.to_string(), ByteString(cert.private_key.clone())),
        ])),
        ..Default::default()
    }
}

/// Minimal client for Vault's generic secret backend.
struct VaultClient {
    http: reqwest::Client,
    addr: String,
    token: String,
}

#[derive(Deserialize)]
struct VaultSecret {
    #[serde(default)]
    data: Map<String, String>,
}

impl VaultClient {
    /// Token from `VAULT_TOKEN`, else the pod's service account token.
    fn from_env(addr: String) -> Result<Self> {
        let token = match std::env::var(VAULT_TOKEN_ENV) {
            Ok(token) if !token.is_empty() => token,
            _ => std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN)?,
        };
        Ok(Self {
            http: reqwest::Client::new(),
            addr: addr.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.addr)
    }

    async fn read(&self, path: &str) -> Result<Option<Map<String, String>>> {
        let resp = self
            .http
            .get(self.url(path))
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!("vault: nothing at {path}");
            return Ok(None);
        }
        let resp = check(resp, path).await?;
        Ok(Some(resp.json::<VaultSecret>().await?.data))
    }

    async fn write(&self, path: &str, data: &Map<&str, String>) -> Result<()> {
        let resp = self
            .http
            .post(self.url(path))
            .header("X-Vault-Token", &self.token)
            .json(data)
            .send()
            .await?;
        check(resp, path).await?;
        Ok(())
    }
}

async fn check(resp: reqwest::Response, path: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Vault(format!("{status} on {path}: {}", body.trim())))
}
