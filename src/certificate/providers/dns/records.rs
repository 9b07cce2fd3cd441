//! `_acme-challenge` TXT records on the DNS providers with a plain REST API.

use log::{debug, info, warn};
use openssl::base64;
use openssl::sha::sha256;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;

use super::DnsProvider;
use crate::{Error, Result};

const CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";
const DIGITALOCEAN_API: &str = "https://api.digitalocean.com/v2";
const TTL: u32 = 120;

/// Record validated for `domain`; a wildcard is validated on its base domain.
pub fn challenge_record(domain: &str) -> String {
    format!("_acme-challenge.{}", base_domain(domain))
}

fn base_domain(domain: &str) -> &str {
    domain.trim_start_matches("*.").trim_end_matches('.')
}

/// Unpadded base64url of the key authorization's SHA-256.
pub fn txt_value(key_auth: &str) -> String {
    base64::encode_block(&sha256(key_auth.as_bytes()))
        .trim_end_matches('=')
        .replace('+', "-")
        .replace('/', "_")
}

/// Zones that may hold `domain`, most specific first. Top-level domains
/// are never candidates.
fn zone_candidates(domain: &str) -> Vec<&str> {
    let mut zones = vec![base_domain(domain)];
    let mut rest = zones[0];
    while let Some((_, parent)) = rest.split_once('.') {
        if !parent.contains('.') {
            break;
        }
        zones.push(parent);
        rest = parent;
    }
    zones
}

pub async fn publish(provider: &DnsProvider, domain: &str, value: &str) -> Result<()> {
    let record = challenge_record(domain);
    let http = Client::new();
    match provider.name {
        "cloudflare" => Cloudflare::new(provider, &http)?.publish(domain, &record, value).await?,
        "digitalocean" => {
            DigitalOcean::new(provider, &http)?
                .publish(domain, &record, value)
                .await?
        }
        "pdns" => PowerDns::new(provider, &http)?.change(domain, &record, Some(value)).await?,
        name => return Err(Error::UnsupportedDnsProvider(name)),
    }
    info!("[{domain}] published {record} through {}", provider.name);
    Ok(())
}

pub async fn remove(provider: &DnsProvider, domain: &str, value: &str) -> Result<()> {
    let record = challenge_record(domain);
    let http = Client::new();
    match provider.name {
        "cloudflare" => Cloudflare::new(provider, &http)?.remove(domain, &record, value).await?,
        "digitalocean" => {
            DigitalOcean::new(provider, &http)?
                .remove(domain, &record, value)
                .await?
        }
        "pdns" => PowerDns::new(provider, &http)?.change(domain, &record, None).await?,
        name => return Err(Error::UnsupportedDnsProvider(name)),
    }
    debug!("[{domain}] removed {record}");
    Ok(())
}

fn url(base: &str, params: &[(&str, &str)]) -> Result<Url> {
    Url::parse_with_params(base, params)
        .map_err(|e| Error::invalid("dns api url", base, e.to_string()))
}

struct Cloudflare<'a> {
    http: &'a Client,
    email: &'a str,
    key: &'a str,
}

#[derive(Deserialize)]
struct CloudflareList {
    #[serde(default)]
    result: Vec<CloudflareObject>,
}

#[derive(Deserialize)]
struct CloudflareObject {
    id: String,
}

impl<'a> Cloudflare<'a> {
    fn new(provider: &'a DnsProvider, http: &'a Client) -> Result<Self> {
        Ok(Self {
            http,
            email: provider.setting("CLOUDFLARE_EMAIL")?,
            key: provider.setting("CLOUDFLARE_API_KEY")?,
        })
    }

    fn auth(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("X-Auth-Email", self.email)
            .header("X-Auth-Key", self.key)
    }

    async fn list(&self, url: Url) -> Result<Vec<CloudflareObject>> {
        let list: CloudflareList = self
            .auth(self.http.get(url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list.result)
    }

    async fn zone(&self, domain: &str) -> Result<String> {
        for candidate in zone_candidates(domain) {
            let zones = self
                .list(url(&format!("{CLOUDFLARE_API}/zones"), &[("name", candidate)])?)
                .await?;
            if let Some(zone) = zones.into_iter().next() {
                return Ok(zone.id);
            }
        }
        Err(Error::DnsZoneNotFound(domain.to_string()))
    }

    async fn publish(&self, domain: &str, record: &str, value: &str) -> Result<()> {
        let zone = self.zone(domain).await?;
        let body = json!({"type": "TXT", "name": record, "content": value, "ttl": TTL});
        self.auth(self.http.post(format!("{CLOUDFLARE_API}/zones/{zone}/dns_records")))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn remove(&self, domain: &str, record: &str, value: &str) -> Result<()> {
        let zone = self.zone(domain).await?;
        let records_url = format!("{CLOUDFLARE_API}/zones/{zone}/dns_records");
        let params = [("type", "TXT"), ("name", record), ("content", value)];
        for r in self.list(url(&records_url, &params)?).await? {
            self.auth(self.http.delete(format!("{records_url}/{}", r.id)))
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }
}

struct DigitalOcean<'a> {
    http: &'a Client,
    token: &'a str,
}

#[derive(Deserialize)]
struct DigitalOceanRecords {
    #[serde(default)]
    domain_records: Vec<DigitalOceanRecord>,
}

#[derive(Deserialize)]
struct DigitalOceanRecord {
    id: u64,
    #[serde(default)]
    data: String,
}

impl<'a> DigitalOcean<'a> {
    fn new(provider: &'a DnsProvider, http: &'a Client) -> Result<Self> {
        Ok(Self {
            http,
            token: provider.setting("DO_AUTH_TOKEN")?,
        })
    }

    async fn zone(&self, domain: &str) -> Result<String> {
        for candidate in zone_candidates(domain) {
            let resp = self
                .http
                .get(format!("{DIGITALOCEAN_API}/domains/{candidate}"))
                .bearer_auth(self.token)
                .send()
                .await?;
            if resp.status() == StatusCode::NOT_FOUND {
                continue;
            }
            resp.error_for_status()?;
            return Ok(candidate.to_string());
        }
        Err(Error::DnsZoneNotFound(domain.to_string()))
    }

    async fn publish(&self, domain: &str, record: &str, value: &str) -> Result<()> {
        let zone = self.zone(domain).await?;
        let name = record.strip_suffix(&format!(".{zone}")).unwrap_or(record);
        let body = json!({"type": "TXT", "name": name, "data": value, "ttl": TTL});
        self.http
            .post(format!("{DIGITALOCEAN_API}/domains/{zone}/records"))
            .bearer_auth(self.token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn remove(&self, domain: &str, record: &str, value: &str) -> Result<()> {
        let zone = self.zone(domain).await?;
        let records_url = format!("{DIGITALOCEAN_API}/domains/{zone}/records");
        let records: DigitalOceanRecords = self
            .http
            .get(url(&records_url, &[("type", "TXT"), ("name", record)])?)
            .bearer_auth(self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        for r in records.domain_records.iter().filter(|r| r.data == value) {
            self.http
                .delete(format!("{records_url}/{}", r.id))
                .bearer_auth(self.token)
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }
}

struct PowerDns<'a> {
    http: &'a Client,
    base: &'a str,
    key: &'a str,
}

impl<'a> PowerDns<'a> {
    fn new(provider: &'a DnsProvider, http: &'a Client) -> Result<Self> {
        Ok(Self {
            http,
            base: provider.setting("PDNS_API_URL")?.trim_end_matches('/'),
            key: provider.setting("PDNS_API_KEY")?,
        })
    }

    async fn zone_url(&self, domain: &str) -> Result<String> {
        for candidate in zone_candidates(domain) {
            let url = format!("{}/api/v1/servers/localhost/zones/{candidate}.", self.base);
            let resp = self.http.get(&url).header("X-API-Key", self.key).send().await?;
            match resp.status() {
                StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => continue,
                _ => {
                    resp.error_for_status()?;
                    return Ok(url);
                }
            }
        }
        Err(Error::DnsZoneNotFound(domain.to_string()))
    }

    /// Replaces the record with `value`, or deletes it when `None`.
    async fn change(&self, domain: &str, record: &str, value: Option<&str>) -> Result<()> {
        let url = self.zone_url(domain).await?;
        let rrset = match value {
            Some(value) => json!({
                "name": format!("{record}."),
                "type": "TXT",
                "ttl": TTL,
                "changetype": "REPLACE",
                "records": [{"content": format!("\"{value}\""), "disabled": false}],
            }),
            None => json!({
                "name": format!("{record}."),
                "type": "TXT",
                "changetype": "DELETE",
            }),
        };
        let resp = self
            .http
            .patch(&url)
            .header("X-API-Key", self.key)
            .json(&json!({"rrsets": [rrset]}))
            .send()
            .await?;
        if let Err(e) = resp.error_for_status_ref() {
            warn!("pdns refused {record}: {e}");
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::providers::ChallengeProvider;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use warp::Filter;
    use warp::http::StatusCode as WarpStatus;

    #[test]
    fn record_names() {
        assert_eq!("_acme-challenge.example.com", challenge_record("example.com"));
        assert_eq!("_acme-challenge.example.com", challenge_record("*.example.com"));
        assert_eq!("_acme-challenge.www.example.com", challenge_record("www.example.com."));
    }

    #[test]
    fn txt_values_are_unpadded_base64url() {
        let value = txt_value("tok3n.thumbprint");
        // 32 bytes of digest
        assert_eq!(43, value.len());
        assert!(!value.contains(['+', '/', '=']));
        assert_eq!(value, txt_value("tok3n.thumbprint"));
        assert_ne!(value, txt_value("tok3n.other"));
    }

    #[test]
    fn zones_most_specific_first() {
        assert_eq!(
            vec!["a.b.example.com", "b.example.com", "example.com"],
            zone_candidates("*.a.b.example.com")
        );
        assert_eq!(vec!["example.com"], zone_candidates("example.com"));
    }

    /// PowerDNS API knowing the `example.com.` zone.
    fn pdns_api(
        changes: Arc<Mutex<Vec<(String, Value)>>>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let zone = warp::path!("api" / "v1" / "servers" / "localhost" / "zones" / String);
        let get = zone.and(warp::get()).map(|zone: String| {
            let status = if zone == "example.com." {
                WarpStatus::OK
            } else {
                WarpStatus::NOT_FOUND
            };
            warp::reply::with_status(warp::reply::json(&json!({})), status)
        });
        let patch = zone
            .and(warp::patch())
            .and(warp::header::exact("x-api-key", "s3cr3t"))
            .and(warp::body::json())
            .map(move |zone: String, body: Value| {
                changes.lock().unwrap().push((zone, body));
                warp::reply::with_status(warp::reply::json(&json!({})), WarpStatus::NO_CONTENT)
            });
        get.or(patch).unify()
    }

    #[tokio::test]
    async fn pdns_records_follow_the_challenge() -> Result<()> {
        let changes = Arc::new(Mutex::new(vec![]));
        let (addr, server) =
            warp::serve(pdns_api(changes.clone())).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let provider = DnsProvider {
            name: "pdns",
            config: [
                ("PDNS_API_URL".to_string(), format!("http://{addr}/")),
                ("PDNS_API_KEY".to_string(), "s3cr3t".to_string()),
            ]
            .into(),
        };
        provider.present("www.example.com", "tok3n", "tok3n.key").await?;
        provider.clean_up("www.example.com", "tok3n", "tok3n.key").await?;

        let changes = changes.lock().unwrap();
        assert_eq!(2, changes.len());
        assert!(changes.iter().all(|(zone, _)| zone == "example.com."));

        let replace = &changes[0].1["rrsets"][0];
        assert_eq!("_acme-challenge.www.example.com.", replace["name"]);
        assert_eq!("REPLACE", replace["changetype"]);
        assert_eq!(
            format!("\"{}\"", txt_value("tok3n.key")),
            replace["records"][0]["content"]
        );

        let delete = &changes[1].1["rrsets"][0];
        assert_eq!("_acme-challenge.www.example.com.", delete["name"]);
        assert_eq!("DELETE", delete["changetype"]);
        Ok(())
    }

    #[tokio::test]
    async fn providers_without_api_are_refused() {
        let provider = DnsProvider {
            name: "dyn",
            config: Default::default(),
        };
        let err = provider.present("example.com", "t", "k").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedDnsProvider("dyn")));
    }
}
