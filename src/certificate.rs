//! Certificate lifecycle: decide what a Certificate needs from what is
//! stored, then issue or renew through an ACME client.

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::chrono::{DateTime, TimeDelta, Utc};
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use log::{debug, error, info, warn};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::nid::Nid;
use openssl::x509::X509;
use std::collections::BTreeSet as Set;
use std::sync::Arc;
use std::time::Duration;

use crate::api::{
    self, Certificate, ConditionType, HttpIngressBackend, HttpIngressPath, HttpIngressRuleValue,
    IngressBackend, IngressRule, IngressSpec,
};
use crate::config::Options;
use crate::eventer::{self, EventPublisher};
use crate::haproxy::ACME_URL_PREFIX;
use crate::{Error, Result};

pub mod acme;
pub mod cluster;
pub mod providers;
pub mod store;

use acme::{AcmeClient, AcmeClientFactory, AcmeUser, CertificateResource};
use providers::{Challenge, Credentials, HttpProvider};
use cluster::CertCluster;
use store::CertStore;

/// Renew once fewer days of validity than this remain.
pub const RENEW_BEFORE_DAYS: i64 = 7;

pub(crate) fn now() -> Time {
    Time(Utc::now())
}

/// What the controller reads from a stored certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertInfo {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    /// decimal
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertInfo {
    /// Reads the first certificate of a PEM chain.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let x509 = X509::stack_from_pem(pem)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::BadCertificate("no certificate in PEM data".into()))?;

        let common_name = x509
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .map(|e| e.data().as_utf8().map(|s| s.to_string()))
            .transpose()?;
        let dns_names = x509
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.dnsname().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            common_name,
            dns_names,
            serial_number: x509.serial_number().to_bn()?.to_dec_str()?.to_string(),
            not_before: asn1_to_utc(x509.not_before())?,
            not_after: asn1_to_utc(x509.not_after())?,
        })
    }

    /// Common name and SANs.
    pub fn domains(&self) -> Set<&str> {
        self.common_name
            .iter()
            .chain(&self.dns_names)
            .map(String::as_str)
            .collect()
    }

    /// Same domain set, in any order.
    pub fn covers(&self, domains: &[String]) -> bool {
        let wanted: Set<&str> = domains.iter().map(String::as_str).collect();
        self.domains() == wanted
    }

    pub fn renewal_due(&self, now: DateTime<Utc>) -> bool {
        self.not_after <= now + TimeDelta::days(RENEW_BEFORE_DAYS)
    }
}

fn asn1_to_utc(t: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let diff = Asn1Time::from_unix(0)?.diff(t)?;
    let secs = i64::from(diff.days) * 86400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::BadCertificate(format!("certificate time out of range: {t}")))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Create,
    Renew,
    NoOp,
}

/// Chooses the action for `crd` given its currently stored certificate.
pub fn decide(current: Option<&CertInfo>, crd: &Certificate, now: DateTime<Utc>) -> Action {
    if crd.spec.paused {
        return Action::NoOp;
    }
    let Some(current) = current else {
        return Action::Create;
    };
    if !current.covers(&crd.spec.domains) || crd.last_issued().is_none() {
        return Action::Create;
    }
    if current.renewal_due(now) {
        return Action::Renew;
    }
    Action::NoOp
}

/// Condition recorded for an ACME failure.
pub fn classify_error(message: &str) -> ConditionType {
    if acme::RATE_LIMITED_MARKERS.iter().any(|m| message.contains(m)) {
        ConditionType::RateLimited
    } else {
        ConditionType::Failed
    }
}

/// Prepends the HTTP-01 challenge route to `spec` unless some rule already
/// serves the challenge path. Returns whether a rule was added.
pub fn add_challenge_route(spec: &mut IngressSpec, responder_service: &str) -> bool {
    let routed = spec
        .rules
        .iter()
        .filter_map(|r| r.http.as_ref())
        .flat_map(|http| &http.paths)
        .any(|p| p.path.as_deref() == Some(ACME_URL_PREFIX));
    if routed {
        return false;
    }

    let rule = IngressRule {
        host: None,
        http: Some(HttpIngressRuleValue {
            paths: vec![HttpIngressPath {
                path: Some(ACME_URL_PREFIX.to_string()),
                backend: HttpIngressBackend {
                    backend: IngressBackend {
                        name: None,
                        host_names: vec![],
                        service_name: responder_service.to_string(),
                        service_port: IntOrString::Int(i32::from(acme::RESPONDER_PORT)),
                        backend_rules: vec![],
                        alpn: vec![],
                        proto: None,
                        load_balance_on: None,
                    },
                    rewrite_rules: vec![],
                    header_rules: vec![],
                },
            }],
            ..Default::default()
        }),
        tcp: None,
    };
    spec.rules.insert(0, rule);
    true
}

fn object_ref(crd: &Certificate) -> ObjectReference {
    crd.object_ref(&())
}

/// Drives Certificates to a valid, current certificate.
pub struct Controller<C> {
    cluster: Arc<C>,
    store: CertStore<C>,
    factory: Arc<dyn AcmeClientFactory>,
    http: Arc<HttpProvider>,
    events: Arc<dyn EventPublisher>,
    opts: Options,
}

impl<C: CertCluster + 'static> Controller<C> {
    pub fn new(
        cluster: Arc<C>,
        factory: Arc<dyn AcmeClientFactory>,
        http: Arc<HttpProvider>,
        events: Arc<dyn EventPublisher>,
        opts: Options,
    ) -> Result<Self> {
        let store = CertStore::new(cluster.clone())?;
        Ok(Self {
            cluster,
            store,
            factory,
            http,
            events,
            opts,
        })
    }

    /// Brings one Certificate up to date.
    pub async fn process(&self, crd: &Certificate) -> Result<()> {
        crd.validate()?;
        if crd.spec.storage.vault.is_some() && !self.store.has_vault() {
            return Err(Error::invalid(
                "certificate",
                crd.key(),
                "uses vault but vault address is missing",
            ));
        }

        let stored = self.store.get(crd).await?;
        let current = match &stored {
            None => None,
            Some(s) => Some(CertInfo::from_pem(&s.certificate).map_err(|e| {
                Error::BadCertificate(format!(
                    "secret {}/{} contains bad certificate. Reason: {e}",
                    crd.namespace(),
                    crd.secret_name()
                ))
            })?),
        };

        let action = decide(current.as_ref(), crd, Utc::now());
        debug!("certificate {}: {action:?}", crd.key());

        let (result, reason, note) = match action {
            Action::NoOp => return Ok(()),
            Action::Create => (
                self.create(crd).await,
                eventer::REASON_ISSUE_SUCCESSFUL,
                "Successfully issued certificate",
            ),
            Action::Renew => {
                let previous = stored.map(|s| s.certificate).unwrap_or_default();
                (
                    self.renew(crd, previous).await,
                    eventer::REASON_RENEW_SUCCESSFUL,
                    "Successfully renewed certificate",
                )
            }
        };
        let action = match action {
            Action::Renew => eventer::ACTION_RENEW,
            _ => eventer::ACTION_ISSUE,
        };

        let obj = object_ref(crd);
        match result {
            Ok(()) => {
                info!("certificate {}: {note}", crd.key());
                self.events.normal(&obj, reason, action, note.into()).await;
                Ok(())
            }
            Err(e) => {
                self.events
                    .warning(&obj, eventer::REASON_ISSUE_FAILED, action, e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn create(&self, crd: &Certificate) -> Result<()> {
        let client = self.prepare(crd).await?;
        let cert = match client.obtain(&crd.spec.domains).await {
            Ok(cert) if !cert.is_empty() => cert,
            Ok(_) => return self.record_error(crd, Error::EmptyCert).await,
            Err(e) => {
                let e = Error::Acme(format!("failed to create certificate. Reason: {e}"));
                return self.record_error(crd, e).await;
            }
        };
        self.store.save(crd, &cert).await
    }

    async fn renew(&self, crd: &Certificate, previous: Vec<u8>) -> Result<()> {
        let client = self.prepare(crd).await?;
        let last = crd.last_issued().cloned().unwrap_or_default();
        let request = CertificateResource {
            domain: crd.spec.domains.first().cloned().unwrap_or_default(),
            cert_url: last.cert_url,
            cert_stable_url: last.cert_stable_url,
            account_ref: last.account_ref,
            certificate: previous,
            private_key: vec![],
        };

        match client.renew(request).await {
            Ok(cert) if !cert.is_empty() => self.store.save(crd, &cert).await,
            Ok(_) | Err(Error::EmptyCert) => {
                warn!("certificate {}: renewal returned no certificate, issuing anew", crd.key());
                self.create(crd).await
            }
            Err(e) => self.record_error(crd, e).await,
        }
    }

    /// Records `err` as a status condition and returns it.
    async fn record_error(&self, crd: &Certificate, err: Error) -> Result<()> {
        let message = err.to_string();
        let type_ = classify_error(&message);
        error!("certificate {}: {message}", crd.key());

        let updated = self
            .cluster
            .update_status(crd.namespace(), crd.name(), |c| {
                c.status
                    .get_or_insert_default()
                    .set_condition(type_, &message, now());
                true
            })
            .await;
        if let Err(e) = updated {
            warn!("certificate {}: failed to record {type_:?} condition: {e}", crd.key());
        }
        Err(err)
    }

    /// ACME client for the Certificate's account and challenge, with the
    /// challenge route in place when validating over HTTP.
    async fn prepare(&self, crd: &Certificate) -> Result<Box<dyn AcmeClient>> {
        let challenge = self.challenge(crd).await?;
        let client = self.acme_client(crd, challenge.clone()).await?;
        if let Challenge::Http(_) = challenge {
            self.update_ingress(crd).await?;
        }
        Ok(client)
    }

    async fn challenge(&self, crd: &Certificate) -> Result<Challenge> {
        let provider = &crd.spec.challenge_provider;
        if provider.http.is_some() {
            return Ok(Challenge::Http(self.http.clone()));
        }

        let Some(dns) = &provider.dns else {
            return Err(Error::invalid("certificate", crd.key(), "no challenge provider is set"));
        };
        let mut credentials = Credentials::new();
        if let Some(name) = dns.credential_secret_name.as_deref().filter(|n| !n.is_empty()) {
            let secret = self.required_secret(crd, name).await?;
            credentials = secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
                .collect();
        }
        Challenge::select(&dns.provider, &credentials, &self.opts.cloud_provider, &self.http).await
    }

    /// Registers a new account when the user secret holds none, persisting it
    /// back into the secret.
    async fn acme_client(
        &self,
        crd: &Certificate,
        challenge: Challenge,
    ) -> Result<Box<dyn AcmeClient>> {
        let secret_name = &crd.spec.acme_user_secret_name;
        let mut user = AcmeUser::from_secret(&self.required_secret(crd, secret_name).await?)?;

        let registered = user.is_registered();
        if !registered {
            info!("no ACME account for {}, registering a new one", user.email);
        }
        user.ensure_key()?;

        let client = self.factory.client(&user, challenge).await?;
        if registered {
            return Ok(client);
        }

        let register_failed =
            |e: Error| Error::Acme(format!("failed to register user {}. Reason: {e}", user.email));
        let registration = client.register().await.map_err(register_failed)?;
        client.agree_to_tos().await.map_err(register_failed)?;
        user.registration = Some(registration);

        let data = user.to_secret_data()?;
        self.cluster
            .update_secret(crd.namespace(), secret_name, |s| {
                let current = s.data.get_or_insert_default();
                current.extend(data.clone());
                true
            })
            .await?;
        Ok(client)
    }

    async fn required_secret(&self, crd: &Certificate, name: &str) -> Result<Secret> {
        let secret = self.cluster.secret(crd.namespace(), name).await?;
        secret.ok_or_else(|| {
            Error::invalid("certificate", crd.key(), format!("secret {name} not found"))
        })
    }

    async fn update_ingress(&self, crd: &Certificate) -> Result<()> {
        let Some(http) = &crd.spec.challenge_provider.http else {
            return Ok(());
        };
        let reference = &http.ingress;
        match reference.api_version.as_deref() {
            None | Some("") | Some(api::API_VERSION) => {}
            Some(other) => {
                return Err(Error::invalid(
                    "certificate",
                    crd.key(),
                    format!("unsupported ingress apiVersion {other}"),
                ));
            }
        }

        let service = self.opts.responder_service();
        let mut changed = false;
        self.cluster
            .update_ingress(crd.namespace(), &reference.name, |ing| {
                changed = add_challenge_route(&mut ing.spec, &service);
                changed
            })
            .await?;
        if changed {
            info!(
                "added ACME challenge route to ingress {}/{}",
                crd.namespace(),
                reference.name
            );
            // let the proxy reload before the CA comes knocking
            tokio::time::sleep(self.opts.challenge_route_delay).await;
        }
        Ok(())
    }

    /// Processes Certificates as they change, and all of them again on every
    /// sweep.
    pub async fn run(self: Arc<Self>, client: Client, retry_delay: Duration) {
        let certs: Api<Certificate> = match &self.opts.namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client),
        };

        let sweeper = {
            let this = self.clone();
            let certs = certs.clone();
            tokio::spawn(async move { this.sweep(certs).await })
        };

        loop {
            let Err(e) = self.watch(&certs).await else {
                break;
            };
            error!("certificate watcher failed (retrying): {e}");
            tokio::time::sleep(retry_delay).await;
        }
        sweeper.abort();
    }

    async fn watch(&self, certs: &Api<Certificate>) -> Result<()> {
        let mut stream = watcher(certs.clone(), watcher::Config::default()).boxed();
        while let Some(event) = stream.try_next().await? {
            use watcher::Event::*;
            match event {
                Apply(crd) | InitApply(crd) => self.process_logged(&crd).await,
                Init | InitDone | Delete(_) => {}
            }
        }
        Ok(())
    }

    async fn sweep(&self, certs: Api<Certificate>) {
        let mut interval = tokio::time::interval(self.opts.cert_sweep_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            info!("checking all certificates");
            match certs.list(&Default::default()).await {
                Ok(list) => {
                    for crd in &list.items {
                        self.process_logged(crd).await;
                    }
                }
                Err(e) => error!("failed to list certificates: {e}"),
            }
        }
    }

    async fn process_logged(&self, crd: &Certificate) {
        if let Err(e) = self.process(crd).await {
            error!("certificate {} failed: {e}", crd.key());
        }
    }
}

#[cfg(test)]
mod test;
