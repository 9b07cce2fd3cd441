use super::*;
use crate::api::{
    CertificateDetails, CertificateSpec, CertificateStatus, DnsChallengeProvider, Ingress,
    LocalTypedReference,
};
use crate::eventer::testing::CapturingPublisher;
use crate::retry::RetryConfig;
use async_trait::async_trait;
use cluster::fake::FakeCluster;
use k8s_openapi::ByteString;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Builder, X509NameBuilder};
use std::collections::BTreeMap as Map;
use std::sync::Mutex;

const DAY: i64 = 86400;

fn self_signed(cn: &str, sans: &[&str], valid_for_days: i64) -> Result<X509> {
    let key = PKey::from_rsa(Rsa::generate(2048)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, cn)?;
    let name = name.build();

    let now = Utc::now().timestamp();
    let mut b = X509Builder::new()?;
    b.set_version(2)?;
    b.set_serial_number(&*BigNum::from_u32(4242)?.to_asn1_integer()?)?;
    b.set_subject_name(&name)?;
    b.set_issuer_name(&name)?;
    b.set_pubkey(&key)?;
    b.set_not_before(&*Asn1Time::from_unix(now - DAY)?)?;
    b.set_not_after(&*Asn1Time::from_unix(now + valid_for_days * DAY)?)?;
    if !sans.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for s in sans {
            san.dns(s);
        }
        let ext = san.build(&b.x509v3_context(None, None))?;
        b.append_extension(ext)?;
    }
    b.sign(&key, MessageDigest::sha256())?;
    Ok(b.build())
}

fn info(cn: &str, sans: &[&str], valid_for_days: i64) -> Result<CertInfo> {
    let pem = self_signed(cn, sans, valid_for_days)?.to_pem()?;
    CertInfo::from_pem(&pem)
}

fn certificate(domains: &[&str], issued: bool) -> Certificate {
    let mut crd = Certificate::new(
        "web",
        CertificateSpec {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            challenge_provider: crate::api::ChallengeProvider {
                http: None,
                dns: Some(DnsChallengeProvider {
                    provider: "cloudflare".into(),
                    credential_secret_name: Some("cf".into()),
                }),
            },
            acme_user_secret_name: "acme".into(),
            ..Default::default()
        },
    );
    crd.metadata.namespace = Some("default".into());
    if issued {
        crd.status = Some(CertificateStatus {
            last_issued_certificate: Some(CertificateDetails {
                serial_number: "4242".into(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    crd
}

#[test]
fn pem_round_trip() -> Result<()> {
    let cert = info("example.com", &["example.com", "www.example.com"], 90)?;

    assert_eq!(Some("example.com"), cert.common_name.as_deref());
    assert_eq!(vec!["example.com", "www.example.com"], cert.dns_names);
    assert_eq!("4242", cert.serial_number);

    let expected = Utc::now() + TimeDelta::days(90);
    assert!((cert.not_after - expected).num_seconds().abs() < 60);
    assert!(cert.not_before < Utc::now());
    Ok(())
}

#[test]
fn garbage_pem_is_rejected() {
    assert!(CertInfo::from_pem(b"not a certificate").is_err());
    assert!(CertInfo::from_pem(b"").is_err());
}

#[test]
fn renewal_window() -> Result<()> {
    let now = Utc::now();
    assert!(info("example.com", &[], 6)?.renewal_due(now));
    assert!(!info("example.com", &[], 25)?.renewal_due(now));
    Ok(())
}

#[test]
fn domain_set_ignores_order_and_duplicates() -> Result<()> {
    let cert = info("example.com", &["www.example.com", "example.com"], 90)?;
    assert!(cert.covers(&["www.example.com".into(), "example.com".into()]));
    assert!(!cert.covers(&["example.com".into()]));
    assert!(!cert.covers(&["example.com".into(), "api.example.com".into()]));
    Ok(())
}

#[test]
fn decisions() -> Result<()> {
    let now = Utc::now();
    let domains = ["example.com", "www.example.com"];
    let valid = info("example.com", &domains, 60)?;
    let expiring = info("example.com", &domains, 3)?;
    let crd = certificate(&domains, true);

    assert_eq!(Action::Create, decide(None, &crd, now));
    assert_eq!(Action::NoOp, decide(Some(&valid), &crd, now));
    assert_eq!(Action::Renew, decide(Some(&expiring), &crd, now));

    // never recorded as issued
    let fresh = certificate(&domains, false);
    assert_eq!(Action::Create, decide(Some(&valid), &fresh, now));

    let grown = certificate(&["example.com", "www.example.com", "api.example.com"], true);
    assert_eq!(Action::Create, decide(Some(&valid), &grown, now));

    let mut paused = certificate(&domains, false);
    paused.spec.paused = true;
    assert_eq!(Action::NoOp, decide(None, &paused, now));
    Ok(())
}

#[test]
fn rate_limits_are_told_apart() {
    assert_eq!(
        ConditionType::RateLimited,
        classify_error("acme: error 429 urn:acme:error:rateLimited: too many certificates")
    );
    assert_eq!(
        ConditionType::RateLimited,
        classify_error("API error: too many new orders (urn:ietf:params:acme:error:rateLimited)")
    );
    assert_eq!(
        ConditionType::Failed,
        classify_error("acme: error 403 urn:acme:error:unauthorized")
    );
}

#[test]
fn challenge_route_is_added_once() {
    let mut spec: IngressSpec = serde_json::from_value(serde_json::json!({
        "rules": [
            {"host": "example.com", "http": {"paths": [
                {"path": "/", "backend": {"serviceName": "web", "servicePort": 80}},
            ]}},
        ],
    }))
    .unwrap();

    assert!(add_challenge_route(&mut spec, "voyager-operator.kube-system"));
    assert_eq!(2, spec.rules.len());

    let rule = &spec.rules[0];
    assert_eq!("", rule.host());
    let path = &rule.http.as_ref().unwrap().paths[0];
    assert_eq!(Some(ACME_URL_PREFIX), path.path.as_deref());
    assert_eq!("voyager-operator.kube-system", path.backend.backend.service_name);
    assert_eq!(IntOrString::Int(56791), path.backend.backend.service_port);

    assert!(!add_challenge_route(&mut spec, "voyager-operator.kube-system"));
    assert_eq!(2, spec.rules.len());
}

fn http_certificate(domains: &[&str]) -> Certificate {
    let mut crd = certificate(domains, false);
    crd.spec.challenge_provider.dns = None;
    crd.spec.challenge_provider.http = Some(crate::api::HttpChallengeProvider {
        ingress: LocalTypedReference {
            api_version: Some(api::API_VERSION.into()),
            kind: Some("Ingress".into()),
            name: "web".into(),
        },
    });
    crd
}

#[test]
fn http_challenge_validation() {
    assert!(http_certificate(&["example.com"]).validate().is_ok());
}

// controller runs against an in-memory cluster and a scripted CA

#[derive(Clone, Copy)]
enum Outcome {
    Issue,
    Empty,
    EmptyCert,
    Fail(&'static str),
}

struct FakeAcme {
    certificate: Vec<u8>,
    obtain: Mutex<Outcome>,
    renew: Mutex<Outcome>,
    calls: Mutex<Vec<String>>,
}

impl FakeAcme {
    fn new(obtain: Outcome, renew: Outcome) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            certificate: self_signed("example.com", &["example.com"], 90)?.to_pem()?,
            obtain: Mutex::new(obtain),
            renew: Mutex::new(renew),
            calls: Mutex::new(vec![]),
        }))
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    /// Returns and forgets the calls made so far.
    fn take_calls(&self) -> Vec<String> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    fn result(&self, outcome: Outcome) -> Result<CertificateResource> {
        match outcome {
            Outcome::Issue => Ok(CertificateResource {
                domain: "example.com".into(),
                cert_url: "https://ca/cert/1".into(),
                account_ref: "https://ca/acct/1".into(),
                certificate: self.certificate.clone(),
                private_key: b"key".to_vec(),
                ..Default::default()
            }),
            Outcome::Empty => Ok(CertificateResource::default()),
            Outcome::EmptyCert => Err(Error::EmptyCert),
            Outcome::Fail(msg) => Err(Error::Acme(msg.into())),
        }
    }
}

struct FakeClient(Arc<FakeAcme>);

#[async_trait]
impl AcmeClient for FakeClient {
    async fn register(&self) -> Result<serde_json::Value> {
        self.0.record("register");
        Ok(serde_json::json!({"uri": "https://ca/acct/1"}))
    }

    async fn agree_to_tos(&self) -> Result<()> {
        self.0.record("agree");
        Ok(())
    }

    async fn obtain(&self, domains: &[String]) -> Result<CertificateResource> {
        self.0.record(format!("obtain {}", domains.join(",")));
        let outcome = *self.0.obtain.lock().unwrap();
        self.0.result(outcome)
    }

    async fn renew(&self, previous: CertificateResource) -> Result<CertificateResource> {
        self.0.record(format!("renew {}", previous.domain));
        let outcome = *self.0.renew.lock().unwrap();
        self.0.result(outcome)
    }
}

struct FakeFactory(Arc<FakeAcme>);

#[async_trait]
impl AcmeClientFactory for FakeFactory {
    async fn client(
        &self,
        _user: &AcmeUser,
        challenge: Challenge,
    ) -> Result<Box<dyn AcmeClient>> {
        self.0.record(format!("client {}", challenge.name()));
        Ok(Box::new(FakeClient(self.0.clone())))
    }
}

fn secret(name: &str, data: Map<String, ByteString>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

fn strings(data: &[(&str, &str)]) -> Map<String, ByteString> {
    data.iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect()
}

struct Harness {
    cluster: Arc<FakeCluster>,
    acme: Arc<FakeAcme>,
    events: Arc<CapturingPublisher>,
    controller: Controller<FakeCluster>,
}

/// Cluster holding `crd`, its DNS credentials and its ACME user, the latter
/// already registered when `registered`.
fn harness(crd: &Certificate, acme: Arc<FakeAcme>, registered: bool) -> Result<Harness> {
    let cluster = Arc::new(FakeCluster::default());
    cluster.add_certificate(crd.clone());
    cluster.add_secret(secret(
        "cf",
        strings(&[("CLOUDFLARE_EMAIL", "me@example.com"), ("CLOUDFLARE_API_KEY", "k")]),
    ));

    let mut user = strings(&[(acme::USER_EMAIL, "me@example.com")]);
    if registered {
        let mut account = AcmeUser::from_secret(&secret("acme", user.clone()))?;
        account.ensure_key()?;
        account.registration = Some(serde_json::json!({"uri": "https://ca/acct/1"}));
        user.extend(account.to_secret_data()?);
    }
    cluster.add_secret(secret("acme", user));

    let events = Arc::new(CapturingPublisher::default());
    let opts = Options {
        challenge_route_delay: Duration::ZERO,
        retry: RetryConfig {
            attempts: 2,
            interval: Duration::ZERO,
        },
        ..Default::default()
    };
    let controller = Controller::new(
        cluster.clone(),
        Arc::new(FakeFactory(acme.clone())),
        Arc::new(HttpProvider::default()),
        events.clone(),
        opts,
    )?;
    Ok(Harness {
        cluster,
        acme,
        events,
        controller,
    })
}

impl Harness {
    fn conditions(&self) -> Vec<api::CertificateCondition> {
        let crd = self.cluster.get_certificate("default", "web").unwrap();
        crd.status.unwrap_or_default().conditions
    }

    fn stored_certificate(&self) -> Option<Vec<u8>> {
        let secret = self.cluster.get_secret("default", "tls-web")?;
        let data = secret.data.unwrap_or_default();
        data.get(store::TLS_CERT_KEY).map(|v| v.0.clone())
    }
}

#[tokio::test]
async fn renewal_without_certificate_issues_anew() -> Result<()> {
    for outcome in [Outcome::EmptyCert, Outcome::Empty] {
        let crd = certificate(&["example.com"], true);
        let h = harness(&crd, FakeAcme::new(Outcome::Issue, outcome)?, true)?;
        let expiring = self_signed("example.com", &["example.com"], 3)?.to_pem()?;
        h.cluster.add_secret(secret(
            "tls-web",
            [
                (store::TLS_CERT_KEY.to_string(), ByteString(expiring)),
                (store::TLS_PRIVATE_KEY_KEY.to_string(), ByteString(b"old".to_vec())),
            ]
            .into(),
        ));

        h.controller.process(&crd).await?;

        assert_eq!(
            vec![
                "client cloudflare",
                "renew example.com",
                "client cloudflare",
                "obtain example.com",
            ],
            h.acme.take_calls()
        );
        assert_eq!(Some(h.acme.certificate.clone()), h.stored_certificate());
        let status = h.cluster.get_certificate("default", "web").unwrap().status.unwrap();
        let issued = status.last_issued_certificate.unwrap();
        assert_eq!("https://ca/cert/1", issued.cert_url);
        assert_eq!(vec![eventer::REASON_RENEW_SUCCESSFUL], h.events.reasons());
    }
    Ok(())
}

#[tokio::test]
async fn renewal_errors_are_not_retried_as_creation() -> Result<()> {
    let crd = certificate(&["example.com"], true);
    let h = harness(&crd, FakeAcme::new(Outcome::Issue, Outcome::Fail("boom"))?, true)?;
    let expiring = self_signed("example.com", &["example.com"], 3)?.to_pem()?;
    h.cluster.add_secret(secret(
        "tls-web",
        [
            (store::TLS_CERT_KEY.to_string(), ByteString(expiring.clone())),
            (store::TLS_PRIVATE_KEY_KEY.to_string(), ByteString(b"old".to_vec())),
        ]
        .into(),
    ));

    assert!(h.controller.process(&crd).await.is_err());
    assert_eq!(vec!["client cloudflare", "renew example.com"], h.acme.take_calls());
    assert_eq!(Some(expiring), h.stored_certificate());
    assert_eq!(vec![eventer::REASON_ISSUE_FAILED], h.events.reasons());
    Ok(())
}

#[tokio::test]
async fn failures_update_their_condition_in_place() -> Result<()> {
    let limited = "too many new orders (urn:ietf:params:acme:error:rateLimited)";
    let crd = certificate(&["example.com"], false);
    let h = harness(&crd, FakeAcme::new(Outcome::Fail(limited), Outcome::Issue)?, true)?;

    assert!(h.controller.process(&crd).await.is_err());
    let first = h.conditions();
    assert_eq!(1, first.len());
    assert_eq!(ConditionType::RateLimited, first[0].type_);
    assert!(first[0].reason.contains("rateLimited"), "{}", first[0].reason);

    assert!(h.controller.process(&crd).await.is_err());
    let second = h.conditions();
    assert_eq!(1, second.len());
    assert_eq!(ConditionType::RateLimited, second[0].type_);
    assert_eq!(first[0].reason, second[0].reason);

    *h.acme.obtain.lock().unwrap() = Outcome::Fail("urn:ietf:params:acme:error:unauthorized");
    assert!(h.controller.process(&crd).await.is_err());
    let types: Vec<_> = h.conditions().into_iter().map(|c| c.type_).collect();
    assert_eq!(vec![ConditionType::RateLimited, ConditionType::Failed], types);

    // no certificate was written
    assert_eq!(None, h.stored_certificate());
    assert_eq!(vec![eventer::REASON_ISSUE_FAILED; 3], h.events.reasons());
    Ok(())
}

#[tokio::test]
async fn empty_issuance_is_recorded_as_failure() -> Result<()> {
    let crd = certificate(&["example.com"], false);
    let h = harness(&crd, FakeAcme::new(Outcome::Empty, Outcome::Issue)?, true)?;

    let err = h.controller.process(&crd).await.unwrap_err();
    assert!(matches!(err, Error::EmptyCert));
    let conditions = h.conditions();
    assert_eq!(1, conditions.len());
    assert_eq!(ConditionType::Failed, conditions[0].type_);
    Ok(())
}

#[tokio::test]
async fn new_account_is_registered_and_persisted_once() -> Result<()> {
    let crd = certificate(&["example.com"], false);
    let h = harness(&crd, FakeAcme::new(Outcome::Issue, Outcome::Issue)?, false)?;

    h.controller.process(&crd).await?;
    assert_eq!(
        vec!["client cloudflare", "register", "agree", "obtain example.com"],
        h.acme.take_calls()
    );
    assert_eq!(
        vec!["secret default/acme", "secret default/tls-web", "certificate default/web"],
        h.cluster.writes()
    );
    let user = h.cluster.get_secret("default", "acme").unwrap();
    let data = user.data.as_ref().unwrap();
    assert!(data.contains_key(acme::REGISTRATION_DATA));
    assert!(data.contains_key(acme::USER_PRIVATE_KEY));
    assert!(AcmeUser::from_secret(&user)?.is_registered());

    // the stale object still asks for an issuance, now with the saved account
    h.cluster.writes.lock().unwrap().clear();
    h.controller.process(&crd).await?;
    assert_eq!(vec!["client cloudflare", "obtain example.com"], h.acme.take_calls());
    assert!(!h.cluster.writes().contains(&"secret default/acme".to_string()));
    Ok(())
}

#[tokio::test]
async fn missing_user_secret_is_invalid() -> Result<()> {
    let mut crd = certificate(&["example.com"], false);
    crd.spec.acme_user_secret_name = "nobody".into();
    let h = harness(&crd, FakeAcme::new(Outcome::Issue, Outcome::Issue)?, true)?;

    let err = h.controller.process(&crd).await.unwrap_err();
    assert!(err.to_string().contains("secret nobody not found"), "{err}");
    assert!(h.acme.take_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn http_validation_routes_the_challenge() -> Result<()> {
    let crd = http_certificate(&["example.com"]);
    let h = harness(&crd, FakeAcme::new(Outcome::Issue, Outcome::Issue)?, true)?;
    let ing: Ingress = serde_json::from_value(serde_json::json!({
        "apiVersion": api::API_VERSION,
        "kind": "Ingress",
        "metadata": {"name": "web", "namespace": "default"},
        "spec": {"rules": [
            {"host": "example.com", "http": {"paths": [
                {"path": "/", "backend": {"serviceName": "web", "servicePort": 80}},
            ]}},
        ]},
    }))?;
    h.cluster.add_ingress(ing);

    h.controller.process(&crd).await?;
    assert_eq!(vec!["client http", "obtain example.com"], h.acme.take_calls());

    let spec = h.cluster.get_ingress("default", "web").unwrap().spec;
    assert_eq!(2, spec.rules.len());
    let path = &spec.rules[0].http.as_ref().unwrap().paths[0];
    assert_eq!(Some(ACME_URL_PREFIX), path.path.as_deref());
    assert_eq!("voyager-operator.kube-system", path.backend.backend.service_name);

    h.controller.process(&crd).await?;
    let patches = h.cluster.writes().iter().filter(|w| *w == "ingress default/web").count();
    assert_eq!(1, patches);
    Ok(())
}

#[tokio::test]
async fn http_validation_needs_the_ingress() -> Result<()> {
    let crd = http_certificate(&["example.com"]);
    let h = harness(&crd, FakeAcme::new(Outcome::Issue, Outcome::Issue)?, true)?;

    let err = h.controller.process(&crd).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert_eq!(vec!["client http"], h.acme.take_calls());
    Ok(())
}
