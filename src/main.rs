use clap::Parser;
use kube::Client;
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use voyager::certificate::acme::{AcmeClientFactory, directory::DirectoryFactory};
use voyager::config::Options;
use voyager::haproxy::Renderer;
use voyager::retry::RetryConfig;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Namespace to watch (all namespaces by default)
    #[arg(short = 'n', long)]
    namespace: Option<String>,
    /// Cloud the cluster runs on (aws, gce, gke, ...)
    #[arg(long, default_value = "")]
    cloud_provider: String,
    #[arg(long, default_value = "voyager-operator")]
    operator_service: String,
    #[arg(long, default_value = "kube-system")]
    operator_namespace: String,
    /// HAProxy template replacing the built-in one
    #[arg(long)]
    template: Option<PathBuf>,
    #[arg(long, default_value = "0.0.0.0:56791")]
    acme_responder: SocketAddr,
    #[arg(long)]
    no_acme_responder: bool,
    /// Seconds between two checks of all certificates
    #[arg(long, default_value_t = 24 * 3600)]
    cert_sweep_interval: u64,
    /// Leave Certificate resources alone
    #[arg(long)]
    no_certificates: bool,
    /// Seconds to wait for HAProxy to pick up the challenge route
    #[arg(long, default_value_t = 5)]
    challenge_route_delay: u64,
    /// Seconds to wait for DNS-01 records to propagate
    #[arg(long, default_value_t = 60)]
    dns_propagation: u64,
    /// Seconds between two renderings of all ingresses
    #[arg(long, default_value_t = 300)]
    resync_period: u64,
    #[arg(long, default_value_t = 5)]
    retry_attempts: u32,
    /// Milliseconds between two attempts of a conflicting update
    #[arg(long, default_value_t = 500)]
    retry_interval: u64,
    #[arg(long, default_value = "voyager-")]
    config_map_prefix: String,
}

impl Cli {
    fn options(&self) -> Options {
        Options {
            namespace: self.namespace.clone(),
            cloud_provider: self.cloud_provider.clone(),
            operator_service: self.operator_service.clone(),
            operator_namespace: self.operator_namespace.clone(),
            template_path: self.template.clone(),
            acme_responder: (!self.no_acme_responder).then_some(self.acme_responder),
            cert_sweep_interval: Duration::from_secs(self.cert_sweep_interval),
            challenge_route_delay: Duration::from_secs(self.challenge_route_delay),
            dns_propagation: Duration::from_secs(self.dns_propagation),
            resync_period: Duration::from_secs(self.resync_period),
            retry: RetryConfig {
                attempts: self.retry_attempts,
                interval: Duration::from_millis(self.retry_interval),
            },
            config_map_prefix: self.config_map_prefix.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("RUST_LOG", "info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let opts = cli.options();

    if let Some(ns) = &opts.namespace {
        info!("starting for namespace {ns}");
    } else {
        info!("starting for all namespaces");
    };

    let renderer = match &opts.template_path {
        Some(path) => {
            info!("using HAProxy template {}", path.display());
            Renderer::with_template(std::fs::read_to_string(path)?)?
        }
        None => Renderer::new()?,
    };

    let client: Client = kube::Config::infer().await?.try_into()?;
    let acme = (!cli.no_certificates).then(|| {
        Arc::new(DirectoryFactory::new(opts.dns_propagation)) as Arc<dyn AcmeClientFactory>
    });
    voyager::controller::run(client, opts, renderer, acme).await?;
    Ok(())
}
