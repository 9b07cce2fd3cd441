//! Turns a backend's service reference into HAProxy endpoints.

use k8s_openapi::api::core::v1::{EndpointAddress, Endpoints, Pod, Secret, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use log::{debug, info, trace, warn};
use std::collections::{BTreeMap as Map, HashMap};
use std::future::Future;

use crate::api::annotations::{self, Annotations, check_map_keys};
use crate::api::{DEFAULT_STICKY_COOKIE, port_string};
use crate::haproxy::{BasicAuth, DnsResolver, Endpoint, EndpointTarget, StickyCookie, UserList};
use crate::ingress::auth;
use crate::{Error, Result};

pub mod kube;

#[cfg(test)]
pub mod fake;

const DNS_RESOLVER_HOLD_KEYS: [&str; 6] =
    ["nx", "other", "refused", "timeout", "valid", "obsolete"];
const DNS_RESOLVER_TIMEOUT_KEYS: [&str; 2] = ["resolve", "retry"];

/// Read access to the cluster objects a backend depends on. Missing objects
/// are `Ok(None)`.
pub trait ClusterReader: Send + Sync {
    fn service(&self, namespace: &str, name: &str)
    -> impl Future<Output = Result<Option<Service>>> + Send;

    fn endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Endpoints>>> + Send;

    /// Pods matching a label selector. An empty selector matches nothing.
    fn pods(
        &self,
        namespace: &str,
        selector: &Map<String, String>,
    ) -> impl Future<Output = Result<Vec<Pod>>> + Send;

    fn secret(&self, namespace: &str, name: &str)
    -> impl Future<Output = Result<Option<Secret>>> + Send;
}

/// Endpoints of one backend plus the settings its service carries.
#[derive(Debug, Default)]
pub struct Resolved {
    pub endpoints: Vec<Endpoint>,
    pub sticky: Option<StickyCookie>,
    pub basic_auth: Option<BasicAuth>,
    pub dns_resolver: Option<DnsResolver>,
}

pub struct Resolver<'t, R> {
    reader: &'t R,
    namespace: &'t str,
    /// Ingress-wide stickiness; overrides per-service affinity.
    sticky: Option<StickyCookie>,
}

impl<'t, R: ClusterReader> Resolver<'t, R> {
    pub fn new(reader: &'t R, namespace: &'t str, sticky: Option<StickyCookie>) -> Self {
        Self {
            reader,
            namespace,
            sticky,
        }
    }

    /// Resolves `service` (`name` or `name.namespace`) on `port`. When
    /// `host_names` is not empty, only addresses with a matching hostname are
    /// kept.
    pub async fn service_endpoints(
        &self,
        service: &str,
        port: &IntOrString,
        host_names: &[String],
        user_lists: &mut Map<String, UserList>,
    ) -> Result<Resolved> {
        let (name, namespace) = match service.split_once('.') {
            Some((name, rest)) => (name, rest.split('.').next().unwrap_or(rest)),
            None => (service, self.namespace),
        };
        info!("getting endpoints for service {namespace}/{name} port {}", port_string(port));

        let Some(svc) = self.reader.service(namespace, name).await? else {
            return Err(Error::ServiceNotFound(format!("{namespace}/{name}")));
        };
        let spec = svc.spec.clone().unwrap_or_default();
        let svc_annotations = Annotations(svc.metadata.annotations.as_ref());

        if spec.type_.as_deref() == Some("ExternalName") {
            return external_endpoint(&svc, port);
        }

        let Some(svc_port) = specified_port(spec.ports.as_deref().unwrap_or_default(), port) else {
            return Err(Error::ServicePortUnavailable {
                service: name.to_string(),
                port: port_string(port),
            });
        };

        let endpoints = self.endpoints(&svc, namespace, name, svc_port, host_names).await?;

        let sticky = self.sticky.clone().or_else(|| {
            (svc_annotations.str(annotations::AFFINITY) == Some("cookie")).then(|| StickyCookie {
                name: svc_annotations
                    .string_or(annotations::SESSION_COOKIE_NAME, DEFAULT_STICKY_COOKIE),
                hash: svc_annotations
                    .str(annotations::SESSION_COOKIE_HASH)
                    .map(String::from),
            })
        });

        let basic_auth = self.service_auth(&svc, user_lists).await;

        Ok(Resolved {
            endpoints,
            sticky,
            basic_auth,
            dns_resolver: None,
        })
    }

    async fn endpoints(
        &self,
        svc: &Service,
        namespace: &str,
        name: &str,
        svc_port: &ServicePort,
        host_names: &[String],
    ) -> Result<Vec<Endpoint>> {
        let Some(eps) = self.reader.endpoints(namespace, name).await? else {
            warn!("service {namespace}/{name} has no endpoints object");
            return Ok(vec![]);
        };

        let selector = (svc.spec.as_ref())
            .and_then(|s| s.selector.clone())
            .unwrap_or_default();
        let pods: HashMap<String, Pod> = (self.reader.pods(namespace, &selector).await?)
            .into_iter()
            .filter_map(|pod| Some((pod.metadata.name.clone()?, pod)))
            .collect();

        let svc_annotations = Annotations(svc.metadata.annotations.as_ref());

        let mut result = Vec::new();
        // union of all subsets exposing the target port
        for subset in eps.subsets.iter().flatten() {
            let ports = subset.ports.as_deref().unwrap_or_default();
            for ep_port in ports {
                let target_port = match target_port(svc_port, ep_port) {
                    Some(p) => p,
                    None if ports.len() == 1 => ep_port.port.to_string(),
                    None => {
                        let port = &ep_port.name;
                        trace!("{namespace}/{name}: port {port:?} is not the target port");
                        continue;
                    }
                };
                debug!("{namespace}/{name}: target port {target_port}");

                for addr in subset.addresses.iter().flatten() {
                    if !is_forwardable(host_names, addr.hostname.as_deref()) {
                        continue;
                    }
                    let mut ep = Endpoint::new(
                        endpoint_name(addr),
                        EndpointTarget::Ip { ip: addr.ip.clone() },
                        target_port.clone(),
                    );

                    if let Some(target) = &addr.target_ref {
                        match target.name.as_ref().and_then(|n| pods.get(n)) {
                            Some(pod) => {
                                let a = Annotations(pod.metadata.annotations.as_ref());
                                ep.weight = a.parse(annotations::BACKEND_WEIGHT).ok().flatten();
                                ep.max_connections =
                                    a.parse(annotations::MAX_CONNECTIONS).ok().flatten();
                            }
                            None => {
                                let ip = &addr.ip;
                                warn!("{namespace}/{name}: pod for endpoint {ip} not found")
                            }
                        }
                    }

                    ep.tls_option = svc_annotations.str(annotations::BACKEND_TLS).map(String::from);
                    if svc_annotations.str(annotations::CHECK_HEALTH) == Some("true") {
                        ep.check_health = true;
                        ep.check_health_port = svc_annotations
                            .str(annotations::CHECK_HEALTH_PORT)
                            .map(String::from);
                    }
                    ep.send_proxy = svc_annotations
                        .str(annotations::SEND_PROXY)
                        .and_then(proxy_protocol_command);

                    result.push(ep);
                }
            }
        }
        Ok(result)
    }

    /// Service-level basic auth; unreadable secrets disable it.
    async fn service_auth(
        &self,
        svc: &Service,
        user_lists: &mut Map<String, UserList>,
    ) -> Option<BasicAuth> {
        let a = Annotations(svc.metadata.annotations.as_ref());
        if a.str(annotations::AUTH_TYPE) != Some("basic") {
            return None;
        }
        let secret_name = a.str(annotations::AUTH_SECRET)?;

        let secret = match self.reader.secret(self.namespace, secret_name).await {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                warn!("auth secret {}/{secret_name} not found", self.namespace);
                return None;
            }
            Err(e) => {
                warn!("failed to read auth secret {}/{secret_name}: {e}", self.namespace);
                return None;
            }
        };
        match auth::basic_auth_users(user_lists, &secret) {
            Ok(lists) => Some(BasicAuth {
                realm: a.string_or(annotations::AUTH_REALM, ""),
                user_lists: lists,
            }),
            Err(e) => {
                warn!("invalid auth secret {}/{secret_name}: {e}", self.namespace);
                None
            }
        }
    }
}

/// Single endpoint pointing at the external name, optionally resolved at
/// runtime through a dedicated resolver.
fn external_endpoint(svc: &Service, port: &IntOrString) -> Result<Resolved> {
    let external_name = (svc.spec.as_ref())
        .and_then(|s| s.external_name.clone())
        .unwrap_or_default();
    info!("service {:?} is an ExternalName service for {external_name}", svc.metadata.name);

    let resolver = dns_resolver_for_service(svc, &external_name)?;
    let a = Annotations(svc.metadata.annotations.as_ref());

    let mut ep = Endpoint::new(
        "external",
        EndpointTarget::External {
            external_name,
            use_dns_resolver: resolver.is_some(),
            dns_resolver: resolver.as_ref().map(|r| r.name.clone()),
        },
        port_string(port),
    );
    ep.check_health = resolver.as_ref().is_some_and(|r| r.check_health);
    ep.tls_option = a.str(annotations::BACKEND_TLS).map(String::from);

    Ok(Resolved {
        endpoints: vec![ep],
        dns_resolver: resolver,
        ..Default::default()
    })
}

/// Resolver settings for an ExternalName service, when enabled.
pub fn dns_resolver_for_service(svc: &Service, external_name: &str) -> Result<Option<DnsResolver>> {
    let a = Annotations(svc.metadata.annotations.as_ref());
    if !a.flag(annotations::USE_DNS_RESOLVER) {
        return Ok(None);
    }

    let nameservers: Vec<String> = a
        .json(annotations::DNS_RESOLVER_NAMESERVERS)?
        .unwrap_or_default();
    let check_health = a
        .parse(annotations::DNS_RESOLVER_CHECK_HEALTH)
        .ok()
        .flatten()
        .unwrap_or(!nameservers.is_empty());

    let hold: Map<String, String> = a.json(annotations::DNS_RESOLVER_HOLD)?.unwrap_or_default();
    check_map_keys(annotations::DNS_RESOLVER_HOLD, &hold, &DNS_RESOLVER_HOLD_KEYS)?;

    let timeout: Map<String, String> =
        a.json(annotations::DNS_RESOLVER_TIMEOUT)?.unwrap_or_default();
    check_map_keys(annotations::DNS_RESOLVER_TIMEOUT, &timeout, &DNS_RESOLVER_TIMEOUT_KEYS)?;

    Ok(Some(DnsResolver {
        name: external_name.to_string(),
        nameservers,
        check_health,
        retries: a.parse(annotations::DNS_RESOLVER_RETRIES)?,
        timeout,
        hold,
    }))
}

fn specified_port<'p>(ports: &'p [ServicePort], port: &IntOrString) -> Option<&'p ServicePort> {
    ports.iter().find(|p| match port {
        IntOrString::Int(n) => p.port == *n,
        IntOrString::String(s) => {
            p.name.as_deref() == Some(s.as_str()) || s.parse::<i32>().ok() == Some(p.port)
        }
    })
}

/// Port number on the endpoint when it is the service's target port.
fn target_port(
    svc_port: &ServicePort,
    ep_port: &k8s_openapi::api::core::v1::EndpointPort,
) -> Option<String> {
    match svc_port.target_port.as_ref() {
        Some(IntOrString::Int(n)) => (ep_port.port == *n).then(|| n.to_string()),
        Some(IntOrString::String(s)) => {
            let name = ep_port.name.as_deref();
            (name == Some(s.as_str()) || (name.is_some() && name == svc_port.name.as_deref()))
                .then(|| ep_port.port.to_string())
        }
        // target port defaults to the service port
        None => (ep_port.port == svc_port.port).then(|| ep_port.port.to_string()),
    }
}

fn is_forwardable(host_names: &[String], host_name: Option<&str>) -> bool {
    if host_names.is_empty() {
        return true;
    }
    let host_name = host_name.unwrap_or_default();
    host_names.iter().any(|n| n.eq_ignore_ascii_case(host_name))
}

fn endpoint_name(addr: &EndpointAddress) -> String {
    match addr.target_ref.as_ref().and_then(|t| t.name.as_ref()) {
        Some(name) => format!("pod-{name}"),
        None => format!("pod-{}", addr.ip),
    }
}

fn proxy_protocol_command(version: &str) -> Option<String> {
    match version {
        "v1" => Some("send-proxy".into()),
        "v2" | "v2-ssl" | "v2-ssl-cn" => Some(format!("send-proxy-{version}")),
        _ => None,
    }
}
