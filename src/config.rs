use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryConfig;

/// Operator settings, filled from the command line.
#[derive(Clone, Debug)]
pub struct Options {
    /// Namespace to watch; all namespaces when unset.
    pub namespace: Option<String>,
    /// Cloud the cluster runs on (`aws`, `gce`, `gke`, ...), empty if none.
    pub cloud_provider: String,
    /// Service exposing the operator's HTTP-01 responder.
    pub operator_service: String,
    pub operator_namespace: String,
    /// Replaces the built-in HAProxy template.
    pub template_path: Option<PathBuf>,
    /// Where the HTTP-01 responder listens, if enabled.
    pub acme_responder: Option<SocketAddr>,
    pub cert_sweep_interval: Duration,
    /// Pause after adding the challenge route, while the proxy reloads.
    pub challenge_route_delay: Duration,
    /// Wait between publishing DNS-01 records and asking the CA to check them.
    pub dns_propagation: Duration,
    /// Ingresses are re-rendered this often to pick up service and endpoint
    /// changes.
    pub resync_period: Duration,
    pub retry: RetryConfig,
    /// Rendered configs go to ConfigMap `<prefix><ingress name>`.
    pub config_map_prefix: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            namespace: None,
            cloud_provider: String::new(),
            operator_service: "voyager-operator".into(),
            operator_namespace: "kube-system".into(),
            template_path: None,
            acme_responder: None,
            cert_sweep_interval: Duration::from_secs(24 * 3600),
            challenge_route_delay: Duration::from_secs(5),
            dns_propagation: Duration::from_secs(60),
            resync_period: Duration::from_secs(5 * 60),
            retry: RetryConfig::default(),
            config_map_prefix: "voyager-".into(),
        }
    }
}

impl Options {
    pub fn config_map_name(&self, ingress: &str) -> String {
        format!("{}{ingress}", self.config_map_prefix)
    }

    /// Backend service of the challenge route, `name.namespace`.
    pub fn responder_service(&self) -> String {
        format!("{}.{}", self.operator_service, self.operator_namespace)
    }
}
