//! Turns an `Ingress` into HAProxy `TemplateData`.

use log::{debug, info, warn};
use openssl::hash::{MessageDigest, hash};
use std::collections::{BTreeMap as Map, HashSet};

use crate::api::{
    FrontendRule, Ingress, IngressBackend, annotations, port_number, port_string,
};
use crate::haproxy::{
    Backend, BasicAuth, DnsResolver, HttpPath, HttpService, SharedInfo, StatsInfo, StickyCookie,
    TcpService, TemplateData, UserList, alpn_options,
};
use crate::resolvers::{ClusterReader, Resolved, Resolver};
use crate::{Error, Result};

pub mod auth;

pub const DEFAULT_BACKEND_NAME: &str = "default-backend";
pub const CLOUD_PROVIDER_AWS: &str = "aws";

/// Outcome of one parsing pass.
#[derive(Debug, Default)]
pub struct Parsed {
    pub data: TemplateData,
    /// Backends that could not be resolved, one human readable message
    /// each. Their routes are left out of `data`.
    pub invalid_backends: Vec<String>,
}

pub struct Parser<'t, R> {
    reader: &'t R,
    cloud_provider: &'t str,
}

impl<'t, R: ClusterReader> Parser<'t, R> {
    pub fn new(reader: &'t R, cloud_provider: &'t str) -> Self {
        Self {
            reader,
            cloud_provider,
        }
    }

    pub async fn parse(&self, ing: &Ingress) -> Result<Parsed> {
        info!("parsing ingress {}", ing.key());

        let sticky = ing.sticky().then(|| StickyCookie {
            name: ing.sticky_cookie_name(),
            hash: ing.sticky_cookie_hash(),
        });
        let mut pass = Pass {
            ing,
            resolver: Resolver::new(self.reader, ing.namespace(), sticky),
            user_lists: Map::new(),
            dns_resolvers: Map::new(),
            backend_names: HashSet::new(),
            invalid_backends: Vec::new(),
        };

        let global_auth = self.global_basic_auth(ing, &mut pass.user_lists).await?;

        let mut shared = self.shared_info(ing)?;
        shared.default_backend = pass.default_backend(global_auth.as_ref()).await?;

        let stats = self.stats(ing).await?;

        let mut http = pass.http_rules().await?;
        let tcp = pass.tcp_rules().await?;
        let tcp_uses_80 = tcp.iter().any(|svc| svc.port == 80);

        if ing.ssl_redirect() && !tcp_uses_80 {
            for svc in tcp.iter().filter(|svc| svc.port == 443) {
                add_redirect_paths(&mut http, &svc.host, &["/".to_string()]);
            }
            let tls_paths: Vec<(String, Vec<String>)> = (http.get(&443).into_iter())
                .flat_map(|info| hosts(&info.paths))
                .collect();
            for (host, paths) in tls_paths {
                add_redirect_paths(&mut http, &host, &paths);
            }
        }

        if http.is_empty() && !tcp_uses_80 && shared.default_backend.is_some() {
            http.insert(
                80,
                HttpInfo {
                    paths: vec![HttpPath {
                        path: "/".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            );
        }

        if ing.force_ssl_redirect() {
            if let Some(info) = http.get_mut(&80) {
                for path in &mut info.paths {
                    path.ssl_redirect = true;
                }
            }
        }

        let http_services = http
            .into_iter()
            .map(|(port, info)| {
                let mut svc = HttpService {
                    frontend_name: frontend_name("http", port),
                    port,
                    offload_ssl: info.offload_ssl,
                    alpn_options: info.alpn_options,
                    proto: info.proto,
                    frontend_rules: frontend_rules(&ing.spec.frontend_rules, port),
                    basic_auth: None,
                    paths: info.paths,
                };
                if let Some(auth) = &global_auth {
                    svc.basic_auth = Some(auth.clone());
                    for b in svc.paths.iter_mut().filter_map(|p| p.backend.as_mut()) {
                        b.basic_auth = None;
                    }
                }
                svc
            })
            .collect();

        let Pass {
            user_lists,
            dns_resolvers,
            invalid_backends,
            ..
        } = pass;

        let data = TemplateData {
            shared,
            timeout_defaults: ing.timeouts()?,
            option_defaults: ing.haproxy_options()?,
            stats,
            dns_resolvers,
            http_services,
            tcp_services: tcp,
            user_lists: user_lists.into_values().collect(),
        };
        debug!(
            "ingress {}: {} http services, {} tcp services, {} invalid backends",
            ing.key(),
            data.http_services.len(),
            data.tcp_services.len(),
            invalid_backends.len()
        );
        Ok(Parsed {
            data,
            invalid_backends,
        })
    }

    fn shared_info(&self, ing: &Ingress) -> Result<SharedInfo> {
        let keep_source_ip = self.cloud_provider == CLOUD_PROVIDER_AWS
            && ing.lb_type() == annotations::LB_TYPE_LOAD_BALANCER
            && ing.keep_source_ip();

        Ok(SharedInfo {
            accept_proxy: keep_source_ip || ing.accept_proxy(),
            sticky: ing.sticky(),
            default_backend: None,
            cors: ing.cors(),
            hsts: ing.hsts()?,
            proxy_body_size: ing.proxy_body_size(),
            whitelist_source_range: ing.whitelist_source_range(),
            max_connections: ing.max_connections()?,
        })
    }

    async fn stats(&self, ing: &Ingress) -> Result<Option<StatsInfo>> {
        if !ing.stats() {
            return Ok(None);
        }
        let mut stats = StatsInfo {
            port: ing.stats_port()?,
            ..Default::default()
        };
        if let Some(name) = ing.stats_secret_name() {
            let secret = match self.reader.secret(ing.namespace(), &name).await {
                Ok(Some(secret)) => secret,
                Ok(None) => return Err(Error::StatsSecret(ing.key())),
                Err(e) => {
                    warn!("failed to read stats secret {}/{name}: {e}", ing.namespace());
                    return Err(Error::StatsSecret(ing.key()));
                }
            };
            let field = |key: &str| {
                (secret.data.as_ref())
                    .and_then(|d| d.get(key))
                    .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            };
            stats.username = field("username");
            stats.password = field("password");
        }
        Ok(Some(stats))
    }

    /// Ingress-wide basic auth; overrides any service-level auth.
    async fn global_basic_auth(
        &self,
        ing: &Ingress,
        user_lists: &mut Map<String, UserList>,
    ) -> Result<Option<BasicAuth>> {
        if !ing.basic_auth_enabled() {
            return Ok(None);
        }
        let Some(name) = ing.auth_secret_name() else {
            return Err(Error::annotation(
                annotations::AUTH_SECRET,
                "required when auth-type is basic",
            ));
        };
        let Some(secret) = self.reader.secret(ing.namespace(), &name).await? else {
            return Err(Error::invalid(
                "ingress",
                ing.key(),
                format!("auth secret {name} not found"),
            ));
        };
        Ok(Some(BasicAuth {
            realm: ing.auth_realm(),
            user_lists: auth::basic_auth_users(user_lists, &secret)?,
        }))
    }
}

/// HTTP paths collected for one listening port.
#[derive(Default)]
struct HttpInfo {
    offload_ssl: bool,
    alpn_options: String,
    proto: Option<String>,
    paths: Vec<HttpPath>,
}

/// Mutable state of one parsing pass.
struct Pass<'t, R> {
    ing: &'t Ingress,
    resolver: Resolver<'t, R>,
    user_lists: Map<String, UserList>,
    dns_resolvers: Map<String, DnsResolver>,
    backend_names: HashSet<String>,
    invalid_backends: Vec<String>,
}

impl<R: ClusterReader> Pass<'_, R> {
    async fn default_backend(
        &mut self,
        global_auth: Option<&BasicAuth>,
    ) -> Result<Option<Backend>> {
        let Some(spec) = &self.ing.spec.backend else {
            return Ok(None);
        };
        let Some(resolved) = self.resolve(&spec.backend, "spec.backend").await? else {
            return Ok(None);
        };

        let (name, name_generated) = match &spec.backend.name {
            Some(name) => (name.clone(), false),
            None => (DEFAULT_BACKEND_NAME.to_string(), true),
        };
        let mut backend = backend(name, name_generated, &spec.backend, resolved);
        backend.rewrite_rules = spec.rewrite_rules.clone();
        backend.header_rules = spec.header_rules.clone();
        if let Some(auth) = global_auth {
            backend.basic_auth = Some(auth.clone());
        }
        Ok(Some(backend))
    }

    async fn http_rules(&mut self) -> Result<Map<u16, HttpInfo>> {
        let ing = self.ing;
        let mut services: Map<u16, HttpInfo> = Map::new();

        for (ri, rule) in ing.spec.rules.iter().enumerate() {
            let Some(http) = &rule.http else {
                continue;
            };
            let tls_secret = ing.tls_secret_for_rule(rule);
            let port = match http.port.as_ref().map(port_number) {
                Some(n) if n > 0 => listen_port(ing, n)?,
                _ if tls_secret.is_some() => 443,
                _ => 80,
            };
            let host = rule.host();

            let mut paths = Vec::new();
            for (pi, p) in http.paths.iter().enumerate() {
                let location = format!("spec.rules[{ri}].http.paths[{pi}]");
                let Some(resolved) = self.resolve(&p.backend.backend, &location).await? else {
                    continue;
                };
                if resolved.endpoints.is_empty() {
                    continue;
                }

                let path = p.path.clone().unwrap_or_default();
                let (name, generated) = self.backend_name(&p.backend.backend, host, port, &path)?;
                let mut b = backend(name, generated, &p.backend.backend, resolved);
                let target = ing.rewrite_target();
                b.rewrite_rules =
                    rewrite_target(target.as_deref(), &path, &p.backend.rewrite_rules);
                b.header_rules = p.backend.header_rules.clone();

                paths.push(HttpPath {
                    host: host.to_string(),
                    path,
                    backend: Some(b),
                    ssl_redirect: false,
                });
            }

            let info = services.entry(port).or_default();
            info.offload_ssl = tls_secret.is_some();
            info.alpn_options = alpn_options(&http.alpn);
            info.proto = http.proto.clone();
            info.paths.extend(paths);
        }
        Ok(services)
    }

    async fn tcp_rules(&mut self) -> Result<Vec<TcpService>> {
        let ing = self.ing;
        let mut services = Vec::new();

        for (ri, rule) in ing.spec.rules.iter().enumerate() {
            let Some(tcp) = rule.tcp.as_ref().filter(|_| rule.http.is_none()) else {
                continue;
            };
            let port = listen_port(ing, port_number(&tcp.port))?;
            let host = rule.host();

            let location = format!("spec.rules[{ri}].tcp");
            let Some(resolved) = self.resolve(&tcp.backend, &location).await? else {
                continue;
            };
            let (name, generated) = self.backend_name(&tcp.backend, host, port, "")?;

            services.push(TcpService {
                frontend_name: frontend_name("tcp", port),
                host: host.to_string(),
                port,
                secret_name: ing.tls_secret_for_rule(rule),
                alpn_options: alpn_options(&tcp.alpn),
                proto: tcp.proto.clone(),
                frontend_rules: frontend_rules(&ing.spec.frontend_rules, port),
                backend: backend(name, generated, &tcp.backend, resolved),
            });
        }
        Ok(services)
    }

    /// Resolves a backend's service. A missing service is reported and
    /// yields `None`; any other failure aborts the pass.
    async fn resolve(&mut self, be: &IngressBackend, location: &str) -> Result<Option<Resolved>> {
        let resolved = self
            .resolver
            .service_endpoints(
                &be.service_name,
                &be.service_port,
                &be.host_names,
                &mut self.user_lists,
            )
            .await;

        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e @ Error::ServiceNotFound(_)) => {
                self.invalid(location, &e.to_string());
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if resolved.endpoints.is_empty() {
            self.invalid(location, "endpoint not found");
        }
        if let Some(resolver) = &resolved.dns_resolver {
            self.dns_resolvers
                .insert(resolver.name.clone(), resolver.clone());
        }
        Ok(Some(resolved))
    }

    fn invalid(&mut self, location: &str, reason: &str) {
        let msg = format!("can't resolve backend for {location}, reason: {reason}");
        warn!("ingress {}: {msg}", self.ing.key());
        self.invalid_backends.push(msg);
    }

    /// Explicit names are kept verbatim. Generated names are
    /// `<service>.<namespace>:<port>`, suffixed with a digest of the route
    /// when already taken in this pass.
    fn backend_name(
        &mut self,
        be: &IngressBackend,
        host: &str,
        port: u16,
        path: &str,
    ) -> Result<(String, bool)> {
        if let Some(name) = &be.name {
            self.backend_names.insert(name.clone());
            return Ok((name.clone(), false));
        }

        let mut labels = be.service_name.split('.');
        let service = labels.next().unwrap_or_default();
        let namespace = labels.next().unwrap_or(self.ing.namespace());
        let mut name = format!("{service}.{namespace}:{}", port_string(&be.service_port));

        if self.backend_names.contains(&name) {
            let digest = hash(MessageDigest::md5(), format!("{host}-{port}-{path}").as_bytes())?;
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            name = format!("{name}-{hex}");
        }
        self.backend_names.insert(name.clone());
        Ok((name, true))
    }
}

fn backend(name: String, name_generated: bool, be: &IngressBackend, resolved: Resolved) -> Backend {
    Backend {
        name,
        name_generated,
        endpoints: resolved.endpoints,
        backend_rules: be.backend_rules.clone(),
        rewrite_rules: vec![],
        header_rules: vec![],
        sticky: resolved.sticky,
        basic_auth: resolved.basic_auth,
        alpn_options: alpn_options(&be.alpn),
        proto: be.proto.clone(),
        load_balance_on: be.load_balance_on.clone(),
    }
}

fn listen_port(ing: &Ingress, port: i32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(Error::invalid(
            "ingress",
            ing.key(),
            format!("invalid listen port {port}"),
        )),
    }
}

fn frontend_name(mode: &str, port: u16) -> String {
    format!("{mode}-0_0_0_0-{port}")
}

fn frontend_rules(rules: &[FrontendRule], port: u16) -> Vec<String> {
    rules
        .iter()
        .find(|r| port_number(&r.port) == i32::from(port))
        .map(|r| r.rules.clone())
        .unwrap_or_default()
}

/// Paths grouped by host, in first-seen order.
fn hosts(paths: &[HttpPath]) -> Vec<(String, Vec<String>)> {
    let mut result: Vec<(String, Vec<String>)> = Vec::new();
    for p in paths {
        match result.iter_mut().find(|(h, _)| *h == p.host) {
            Some((_, list)) => list.push(p.path.clone()),
            None => result.push((p.host.clone(), vec![p.path.clone()])),
        }
    }
    result
}

/// Adds port 80 paths redirecting to HTTPS for `host`, skipping paths port
/// 80 already routes.
fn add_redirect_paths(http: &mut Map<u16, HttpInfo>, host: &str, paths: &[String]) {
    let info = http.entry(80).or_default();
    for path in paths {
        let exists = info.paths.iter().any(|p| p.host == host && p.path == *path);
        if !exists {
            info.paths.push(HttpPath {
                host: host.to_string(),
                path: path.clone(),
                backend: None,
                ssl_redirect: true,
            });
        }
    }
}

/// Prepends the `reqrep` rule rewriting `path` to `target`.
fn rewrite_target(target: Option<&str>, path: &str, rules: &[String]) -> Vec<String> {
    let rule = match target {
        None => return rules.to_vec(),
        Some("/") => format!(r"^([^\ :]*)\ {path}/?(.*$) \1\ /\2"),
        Some(target) => {
            let slash = if path.ends_with('/') { "/" } else { "" };
            format!(r"^([^\ :]*)\ {path}(.*$) \1\ {target}{slash}\2")
        }
    };
    let mut result = vec![rule];
    result.extend_from_slice(rules);
    result
}
