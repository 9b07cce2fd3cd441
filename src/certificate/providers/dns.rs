//! DNS-01 provider registry: maps a provider name to the credential keys it
//! needs and collects them from the credential secret.

use async_trait::async_trait;
use log::{debug, info};
use std::collections::BTreeMap as Map;

use super::{ChallengeProvider, Credentials};
use crate::{Error, Result};

mod records;

const DNSMADEEASY_SANDBOX_URL: &str = "https://api.sandbox.dnsmadeeasy.com/V2.0";
const DNSMADEEASY_URL: &str = "https://api.dnsmadeeasy.com/V2.0";

const GCE_METADATA_PROJECT_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/project/project-id";

/// A configured DNS-01 provider, ready to hand to the ACME client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsProvider {
    /// canonical name
    pub name: &'static str,
    /// Settings for the provider; empty when it bootstraps from the
    /// ambient cloud identity.
    pub config: Map<String, String>,
}

impl DnsProvider {
    fn setting(&self, key: &'static str) -> Result<&str> {
        self.config
            .get(key)
            .map(String::as_str)
            .ok_or(Error::MissingCredential(key))
    }
}

/// Publishes `_acme-challenge` TXT records through the provider's API.
/// Only providers with a plain REST API are driven in-process; the others
/// fail with [`Error::UnsupportedDnsProvider`].
#[async_trait]
impl ChallengeProvider for DnsProvider {
    async fn present(&self, domain: &str, _token: &str, key_auth: &str) -> Result<()> {
        let value = records::txt_value(key_auth);
        records::publish(self, domain, &value).await
    }

    async fn clean_up(&self, domain: &str, _token: &str, key_auth: &str) -> Result<()> {
        let value = records::txt_value(key_auth);
        records::remove(self, domain, &value).await
    }
}

struct Entry {
    aliases: &'static [&'static str],
    required: &'static [&'static str],
    optional: &'static [&'static str],
}

const REGISTRY: &[Entry] = &[
    Entry {
        aliases: &["aws", "route53"],
        required: &["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"],
        optional: &["AWS_HOSTED_ZONE_ID"],
    },
    Entry {
        aliases: &["azure", "acs"],
        required: &[
            "AZURE_CLIENT_ID",
            "AZURE_CLIENT_SECRET",
            "AZURE_SUBSCRIPTION_ID",
            "AZURE_TENANT_ID",
            "AZURE_RESOURCE_GROUP",
        ],
        optional: &[],
    },
    Entry {
        aliases: &["cloudflare"],
        required: &["CLOUDFLARE_EMAIL", "CLOUDFLARE_API_KEY"],
        optional: &[],
    },
    Entry {
        aliases: &["digitalocean", "do"],
        required: &["DO_AUTH_TOKEN"],
        optional: &[],
    },
    Entry {
        aliases: &["dnsimple"],
        required: &["DNSIMPLE_OAUTH_TOKEN", "DNSIMPLE_BASE_URL"],
        optional: &[],
    },
    Entry {
        aliases: &["dnsmadeeasy"],
        required: &["DNSMADEEASY_API_KEY", "DNSMADEEASY_API_SECRET"],
        optional: &[],
    },
    Entry {
        aliases: &["dyn"],
        required: &["DYN_CUSTOMER_NAME", "DYN_USER_NAME", "DYN_PASSWORD"],
        optional: &[],
    },
    Entry {
        aliases: &["googlecloud", "google", "gce", "gke"],
        required: &["GCE_PROJECT"],
        optional: &[],
    },
    Entry {
        aliases: &["gandi"],
        required: &["GANDI_API_KEY"],
        optional: &[],
    },
    Entry {
        aliases: &["linode"],
        required: &["LINODE_API_KEY"],
        optional: &[],
    },
    Entry {
        aliases: &["namecheap"],
        required: &["NAMECHEAP_API_USER", "NAMECHEAP_API_KEY"],
        optional: &[],
    },
    Entry {
        aliases: &["ovh"],
        required: &[
            "OVH_ENDPOINT",
            "OVH_APPLICATION_KEY",
            "OVH_APPLICATION_SECRET",
            "OVH_CONSUMER_KEY",
        ],
        optional: &[],
    },
    Entry {
        aliases: &["pdns"],
        required: &["PDNS_API_KEY", "PDNS_API_URL"],
        optional: &[],
    },
    Entry {
        aliases: &["vultr"],
        required: &["VULTR_API_KEY"],
        optional: &[],
    },
    Entry {
        aliases: &["fastdns", "akamai"],
        required: &[
            "AKAMAI_HOST",
            "AKAMAI_CLIENT_TOKEN",
            "AKAMAI_CLIENT_SECRET",
            "AKAMAI_ACCESS_TOKEN",
        ],
        optional: &[],
    },
    Entry {
        aliases: &["godaddy"],
        required: &["GODADDY_API_KEY", "GODADDY_API_SECRET"],
        optional: &[],
    },
];

fn lookup(name: &str) -> Option<&'static Entry> {
    REGISTRY
        .iter()
        .find(|e| e.aliases.iter().any(|a| a.eq_ignore_ascii_case(name)))
}

fn collect(entry: &Entry, credentials: &Credentials) -> Result<Map<String, String>> {
    let mut config = Map::new();
    for &key in entry.required {
        let value = credentials.get(key).ok_or(Error::MissingCredential(key))?;
        config.insert(key.to_string(), value.clone());
    }
    for &key in entry.optional {
        if let Some(value) = credentials.get(key) {
            config.insert(key.to_string(), value.clone());
        }
    }
    Ok(config)
}

/// Builds the DNS provider known as `name` (case-insensitive) from the
/// credential secret data.
pub async fn provider(
    name: &str,
    credentials: &Credentials,
    cloud_provider: &str,
) -> Result<DnsProvider> {
    let entry = lookup(name).ok_or_else(|| Error::UnknownProvider(name.to_string()))?;
    let canonical = entry.aliases[0];

    let config = match canonical {
        "aws" if cloud_provider == "aws" && credentials.is_empty() => {
            info!("route53 provider without credentials, using the node's IAM role");
            Map::new()
        }
        "googlecloud" => google_cloud(credentials, cloud_provider).await?,
        _ => {
            let mut config = collect(entry, credentials)?;
            match canonical {
                "dnsmadeeasy" => {
                    let sandbox = credentials
                        .get("DNSMADEEASY_SANDBOX")
                        .map(|v| v.trim().parse::<bool>())
                        .transpose()
                        .map_err(|e| {
                            Error::invalid("dns credential", "DNSMADEEASY_SANDBOX", e.to_string())
                        })?
                        .unwrap_or(false);
                    let url = if sandbox { DNSMADEEASY_SANDBOX_URL } else { DNSMADEEASY_URL };
                    config.insert("DNSMADEEASY_BASE_URL".into(), url.into());
                }
                "pdns" => {
                    let url = &config["PDNS_API_URL"];
                    reqwest::Url::parse(url).map_err(|e| {
                        Error::invalid("dns credential", "PDNS_API_URL", e.to_string())
                    })?;
                }
                _ => {}
            }
            config
        }
    };

    debug!("dns provider {canonical} configured with keys {:?}", config.keys());
    Ok(DnsProvider {
        name: canonical,
        config,
    })
}

async fn google_cloud(
    credentials: &Credentials,
    cloud_provider: &str,
) -> Result<Map<String, String>> {
    if credentials.is_empty() && matches!(cloud_provider, "gce" | "gke") {
        let project = gce_project().await?;
        info!("googlecloud provider without credentials, using project {project}");
        return Ok([("GCE_PROJECT".to_string(), project)].into());
    }

    let project = credentials
        .get("GCE_PROJECT")
        .ok_or(Error::MissingCredential("GCE_PROJECT"))?;
    let key = credentials
        .get("GOOGLE_SERVICE_ACCOUNT_JSON_KEY")
        .or_else(|| credentials.get("GCE_SERVICE_ACCOUNT_DATA"))
        .ok_or(Error::MissingCredential("GOOGLE_SERVICE_ACCOUNT_JSON_KEY"))?;
    if key.trim().is_empty() {
        return Err(Error::invalid(
            "dns credential",
            "GOOGLE_SERVICE_ACCOUNT_JSON_KEY",
            "service account key is empty",
        ));
    }

    Ok([
        ("GCE_PROJECT".to_string(), project.clone()),
        ("GOOGLE_SERVICE_ACCOUNT_JSON_KEY".to_string(), key.clone()),
    ]
    .into())
}

/// Project id of the instance, from the GCE metadata server.
async fn gce_project() -> Result<String> {
    let project = reqwest::Client::new()
        .get(GCE_METADATA_PROJECT_URL)
        .header("Metadata-Flavor", "Google")
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(project.trim().to_string())
}
