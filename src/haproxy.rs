//! HAProxy configuration model and renderer.
//!
//! `TemplateData` is rebuilt from scratch on every reconciliation pass and
//! rendered to text. Rendering validates name uniqueness, puts the model in
//! canonical order, then runs the template, so identical logical input always
//! yields byte-identical output.

use log::{debug, log_enabled};
use minijinja::Environment;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap as Map, HashSet};

use crate::{Error, Result};

pub mod template;

/// Path answered by the HTTP-01 challenge responder.
pub const ACME_URL_PREFIX: &str = "/.well-known/acme-challenge/";
pub const ACME_RESPONDER_PORT: u16 = 56791;

const TEMPLATE_NAME: &str = "haproxy.cfg";
const BUILTIN_TEMPLATE: &str = include_str!("haproxy/haproxy.cfg.j2");

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TemplateData {
    #[serde(flatten)]
    pub shared: SharedInfo,
    pub timeout_defaults: Map<String, String>,
    pub option_defaults: Map<String, bool>,
    pub stats: Option<StatsInfo>,
    pub dns_resolvers: Map<String, DnsResolver>,
    pub http_services: Vec<HttpService>,
    pub tcp_services: Vec<TcpService>,
    pub user_lists: Vec<UserList>,
}

/// Ingress-wide settings shared by every frontend.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SharedInfo {
    /// add `accept-proxy` to bind lines
    pub accept_proxy: bool,
    pub sticky: bool,
    pub default_backend: Option<Backend>,
    pub cors: CorsConfig,
    pub hsts: Option<HstsConfig>,
    pub proxy_body_size: Option<String>,
    pub whitelist_source_range: Option<String>,
    pub max_connections: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origin: String,
    pub allowed_methods: String,
    pub allowed_headers: String,
    pub allow_credentials: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HstsConfig {
    pub max_age: i64,
    pub preload: bool,
    pub include_subdomains: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatsInfo {
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DnsResolver {
    pub name: String,
    pub nameservers: Vec<String>,
    pub check_health: bool,
    pub retries: Option<i32>,
    pub timeout: Map<String, String>,
    pub hold: Map<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HttpService {
    pub frontend_name: String,
    pub port: u16,
    pub offload_ssl: bool,
    pub alpn_options: String,
    pub proto: Option<String>,
    pub frontend_rules: Vec<String>,
    pub basic_auth: Option<BasicAuth>,
    pub paths: Vec<HttpPath>,
}

impl HttpService {
    fn sort_key(&self) -> (&'static str, u16) {
        (if self.offload_ssl { "https" } else { "http" }, self.port)
    }

    pub fn redirects_ssl(&self) -> bool {
        self.paths.iter().any(|p| p.ssl_redirect)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HttpPath {
    /// empty matches any host
    pub host: String,
    pub path: String,
    /// `None` for paths that only redirect or fall through to the default
    /// backend.
    pub backend: Option<Backend>,
    pub ssl_redirect: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TcpService {
    pub frontend_name: String,
    pub host: String,
    pub port: u16,
    /// TLS secret terminating this frontend; the PEM is mounted under the
    /// same name.
    pub secret_name: Option<String>,
    pub alpn_options: String,
    pub proto: Option<String>,
    pub frontend_rules: Vec<String>,
    pub backend: Backend,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Backend {
    pub name: String,
    #[serde(skip)]
    pub name_generated: bool,
    pub endpoints: Vec<Endpoint>,
    pub backend_rules: Vec<String>,
    pub rewrite_rules: Vec<String>,
    pub header_rules: Vec<String>,
    pub sticky: Option<StickyCookie>,
    pub basic_auth: Option<BasicAuth>,
    pub alpn_options: String,
    pub proto: Option<String>,
    pub load_balance_on: Option<String>,
}

impl Backend {
    fn canonicalize(&mut self) {
        self.endpoints.sort_by(|a, b| a.ip().cmp(b.ip()));
        if let Some(auth) = &mut self.basic_auth {
            auth.user_lists.sort();
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StickyCookie {
    pub name: String,
    /// `md5`, `sha` or `index`; cookie value is the server name otherwise
    pub hash: Option<String>,
}

/// One server line of a backend.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Endpoint {
    pub name: String,
    pub port: String,
    pub weight: Option<i32>,
    pub max_connections: Option<i32>,
    pub check_health: bool,
    pub check_health_port: Option<String>,
    pub tls_option: Option<String>,
    pub send_proxy: Option<String>,
    #[serde(flatten)]
    pub target: EndpointTarget,
}

/// Where an endpoint sends traffic. A pod address and an external DNS name
/// are exclusive.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EndpointTarget {
    Ip {
        ip: String,
    },
    External {
        external_name: String,
        use_dns_resolver: bool,
        dns_resolver: Option<String>,
    },
}

impl Endpoint {
    pub fn new(name: impl Into<String>, target: EndpointTarget, port: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: port.into(),
            weight: None,
            max_connections: None,
            check_health: false,
            check_health_port: None,
            tls_option: None,
            send_proxy: None,
            target,
        }
    }

    /// Sort key; external endpoints have no IP.
    pub fn ip(&self) -> &str {
        match &self.target {
            EndpointTarget::Ip { ip } => ip,
            EndpointTarget::External { .. } => "",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UserList {
    pub name: String,
    pub users: Vec<AuthUser>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuthUser {
    pub username: String,
    pub password: String,
    pub encrypted: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BasicAuth {
    pub realm: String,
    pub user_lists: Vec<String>,
}

/// HAProxy `alpn` bind option for a protocol list.
pub fn alpn_options(protocols: &[String]) -> String {
    if protocols.is_empty() {
        return String::new();
    }
    format!("alpn {}", protocols.join(","))
}

impl TemplateData {
    /// Rejects configurations where a frontend or backend name is used twice.
    pub fn validate(&self) -> Result<()> {
        let mut frontends = HashSet::new();
        let mut backends = HashSet::new();

        let mut backend = |b: &Backend| -> Result<()> {
            if backends.insert(b.name.clone()) {
                Ok(())
            } else {
                Err(Error::BackendReused(b.name.clone()))
            }
        };

        if let Some(b) = &self.shared.default_backend {
            backend(b)?;
        }
        for svc in &self.http_services {
            if !frontends.insert(svc.frontend_name.as_str()) {
                return Err(Error::FrontendReused(svc.frontend_name.clone()));
            }
            for b in svc.paths.iter().filter_map(|p| p.backend.as_ref()) {
                backend(b)?;
            }
        }
        for svc in &self.tcp_services {
            if !frontends.insert(svc.frontend_name.as_str()) {
                return Err(Error::FrontendReused(svc.frontend_name.clone()));
            }
            backend(&svc.backend)?;
        }
        Ok(())
    }

    /// Puts every list in a canonical order.
    pub fn canonicalize(&mut self) {
        if let Some(b) = &mut self.shared.default_backend {
            b.canonicalize();
        }
        for svc in &mut self.http_services {
            if let Some(auth) = &mut svc.basic_auth {
                auth.user_lists.sort();
            }
            for path in &mut svc.paths {
                if let Some(b) = &mut path.backend {
                    b.canonicalize();
                }
            }
            svc.paths.sort_by(compare_paths);
        }
        for svc in &mut self.tcp_services {
            svc.backend.canonicalize();
        }

        self.http_services.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        self.tcp_services
            .sort_by(|a, b| (a.port, &a.host).cmp(&(b.port, &b.host)));

        for list in &mut self.user_lists {
            list.users.sort_by(|a, b| a.username.cmp(&b.username));
        }
        self.user_lists.sort_by(|a, b| a.name.cmp(&b.name));

        self.move_acme_path_to_top();
    }

    /// The challenge path for the catch-all host on port 80 must win over
    /// every other route.
    fn move_acme_path_to_top(&mut self) {
        for svc in self.http_services.iter_mut().filter(|s| s.port == 80) {
            let pos = svc
                .paths
                .iter()
                .position(|p| host_rank(&p.host) == 0 && p.path == ACME_URL_PREFIX);
            if let Some(pos) = pos {
                let acme = svc.paths.remove(pos);
                svc.paths.insert(0, acme);
            }
        }
    }
}

/// Most specific first: exact hosts, then wildcards, then the catch-all;
/// within a host, deeper paths first.
fn compare_paths(a: &HttpPath, b: &HttpPath) -> Ordering {
    let (ha, hb) = (host_rank(&a.host), host_rank(&b.host));
    hb.cmp(&ha)
        .then_with(|| host_name(&b.host).cmp(&host_name(&a.host)))
        .then_with(|| {
            let (pa, pb) = (path_key(&a.path), path_key(&b.path));
            path_depth(&pb)
                .cmp(&path_depth(&pa))
                .then_with(|| pb.cmp(&pa))
        })
        .then_with(|| backend_name(a).cmp(backend_name(b)))
        .then_with(|| a.path.cmp(&b.path))
        .then_with(|| a.host.cmp(&b.host))
        .then_with(|| a.ssl_redirect.cmp(&b.ssl_redirect))
}

fn backend_name(p: &HttpPath) -> &str {
    p.backend.as_ref().map_or("", |b| b.name.as_str())
}

fn host_name(host: &str) -> String {
    if host.is_empty() || host == "*" {
        return String::new();
    }
    host.trim_start_matches("*.").to_lowercase()
}

fn host_rank(host: &str) -> u8 {
    if host.is_empty() || host == "*" {
        0
    } else if host.starts_with('*') {
        1
    } else {
        2
    }
}

fn path_key(path: &str) -> String {
    path.trim_matches('/').to_lowercase()
}

fn path_depth(path: &str) -> usize {
    path.split('/').count()
}

/// Renders `TemplateData` into HAProxy configuration text.
pub struct Renderer {
    env: Environment<'static>,
}

impl Renderer {
    /// Renderer using the built-in template.
    pub fn new() -> Result<Self> {
        Self::build(BUILTIN_TEMPLATE.to_string())
    }

    /// Renderer using a custom template source.
    pub fn with_template(source: String) -> Result<Self> {
        Self::build(source)
    }

    fn build(source: String) -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        template::register(&mut env);
        env.add_template_owned(TEMPLATE_NAME, source)?;
        Ok(Self { env })
    }

    pub fn render(&self, mut data: TemplateData) -> Result<String> {
        data.validate()?;
        data.canonicalize();

        if log_enabled!(log::Level::Debug) {
            match serde_json::to_string_pretty(&data) {
                Ok(json) => debug!("rendering template data: {json}"),
                Err(e) => debug!("template data is not serializable: {e}"),
            }
        }

        let tmpl = self.env.get_template(TEMPLATE_NAME)?;
        Ok(tmpl.render(&data)?)
    }
}
