//! Ingress reconciliation: parse, render, publish the HAProxy configuration
//! in a ConfigMap next to the Ingress.

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher;
use kube::{Client, Resource};
use log::{debug, error, info, trace};
use std::collections::BTreeMap as Map;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;
use crate::api::Ingress;
use crate::certificate::{self, acme::AcmeClientFactory, providers::HttpProvider};
use crate::certificate::cluster::kube::KubeCluster;
use crate::config::Options;
use crate::eventer::{self, EventPublisher, KubeEventPublisher};
use crate::haproxy::Renderer;
use crate::ingress::Parser;
use crate::resolvers::ClusterReader;
use crate::resolvers::kube::KubeReader;

/// ConfigMap key holding the rendered configuration.
pub const CONFIG_KEY: &str = "haproxy.cfg";

const FIELD_MANAGER: &str = "voyager-operator";
const CONTROLLER_NAME: &str = "voyager-operator";
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Runs the operator until the process ends: the Ingress controller, the
/// HTTP-01 responder when configured, and the Certificate controller unless
/// `acme` is `None`.
pub async fn run(
    client: Client,
    opts: Options,
    renderer: Renderer,
    acme: Option<Arc<dyn AcmeClientFactory>>,
) -> Result<()> {
    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
    let http = Arc::new(HttpProvider::default());

    if let Some(bind) = opts.acme_responder {
        let http = http.clone();
        tokio::spawn(async move {
            if let Err(e) = http.serve(bind).await {
                error!("ACME responder failed: {e}");
            }
        });
    }

    match acme {
        Some(factory) => {
            let cluster = Arc::new(KubeCluster::new(client.clone(), opts.retry.clone()));
            let certs =
                certificate::Controller::new(cluster, factory, http, events.clone(), opts.clone())?;
            tokio::spawn(Arc::new(certs).run(client.clone(), WATCH_RETRY_DELAY));
        }
        None => info!("certificate management is disabled"),
    }

    let reader = KubeReader::new(client.clone());
    IngressController::new(client, reader, renderer, events, opts)
        .run(WATCH_RETRY_DELAY)
        .await;
    Ok(())
}

pub struct IngressController<R> {
    client: Client,
    reader: R,
    renderer: Renderer,
    events: Arc<dyn EventPublisher>,
    opts: Options,
}

impl<R: ClusterReader> IngressController<R> {
    pub fn new(
        client: Client,
        reader: R,
        renderer: Renderer,
        events: Arc<dyn EventPublisher>,
        opts: Options,
    ) -> Self {
        Self {
            client,
            reader,
            renderer,
            events,
            opts,
        }
    }

    /// Renders `ing` and stores the result. Returns whether the stored
    /// configuration changed.
    pub async fn reconcile(&self, ing: &Ingress) -> Result<bool> {
        let obj = ing.object_ref(&());
        let parser = Parser::new(&self.reader, &self.opts.cloud_provider);

        let rendered = match parser.parse(ing).await {
            Ok(parsed) => {
                for reason in &parsed.invalid_backends {
                    self.events
                        .warning(
                            &obj,
                            eventer::REASON_BACKEND_INVALID,
                            eventer::ACTION_RECONCILE,
                            reason.clone(),
                        )
                        .await;
                }
                self.renderer.render(parsed.data)
            }
            Err(e) => Err(e),
        };
        let config = match rendered {
            Ok(config) => config,
            Err(e) => {
                self.events
                    .warning(
                        &obj,
                        eventer::REASON_RENDER_FAILED,
                        eventer::ACTION_RECONCILE,
                        e.to_string(),
                    )
                    .await;
                return Err(e);
            }
        };

        let changed = self.store(ing, config).await?;
        if changed {
            info!("ingress {}: configuration updated", ing.key());
            self.events
                .normal(
                    &obj,
                    eventer::REASON_CONFIG_RENDERED,
                    eventer::ACTION_RECONCILE,
                    "HAProxy configuration updated".into(),
                )
                .await;
        }
        Ok(changed)
    }

    async fn store(&self, ing: &Ingress, config: String) -> Result<bool> {
        let name = self.opts.config_map_name(ing.name());
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), ing.namespace());

        let current = config_maps.get_opt(&name).await?;
        if !needs_update(current.as_ref(), &config) {
            debug!("ingress {}: configuration unchanged", ing.key());
            return Ok(false);
        }

        let cm = config_map(ing, &name, config);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        config_maps.patch(&name, &params, &Patch::Apply(&cm)).await?;
        Ok(true)
    }

    async fn reconcile_logged(&self, ing: &Ingress) {
        if let Err(e) = self.reconcile(ing).await {
            error!("ingress {} failed: {e}", ing.key());
        }
    }

    /// Watches Ingresses until the process ends, restarting the watch on
    /// failure.
    pub async fn run(&self, retry_delay: Duration) {
        loop {
            let Err(e) = self.run_once().await else {
                break;
            };
            error!("ingress watcher failed (retrying): {e}");
            tokio::time::sleep(retry_delay).await;
        }
    }

    async fn run_once(&self) -> Result<()> {
        let ingresses: Api<Ingress> = match &self.opts.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let mut stream = watcher(ingresses, watcher::Config::default()).boxed();

        // services and endpoints are not watched; a periodic resync picks
        // their changes up
        let mut resync = tokio::time::interval(self.opts.resync_period);
        resync.tick().await;

        let mut known = Map::new();
        loop {
            tokio::select!(
                e = stream.try_next() => {
                    let Some(e) = e? else {
                        return Ok(());
                    };
                    trace!("got ing event: {e:?}");
                    if let Some(ing) = ingest_event(&mut known, e) {
                        self.reconcile_logged(&ing).await;
                    }
                },
                _ = resync.tick() => {
                    debug!("resyncing {} ingresses", known.len());
                    for ing in known.values() {
                        self.reconcile_logged(ing).await;
                    }
                },
            );
        }
    }
}

/// Tracks known Ingresses; returns the one to reconcile, if any.
fn ingest_event(
    known: &mut Map<String, Ingress>,
    event: watcher::Event<Ingress>,
) -> Option<Ingress> {
    use watcher::Event::*;
    match event {
        Init => {
            known.clear();
            None
        }
        InitApply(ing) | Apply(ing) => {
            known.insert(ing.key(), ing.clone());
            Some(ing)
        }
        InitDone => None,
        Delete(ing) => {
            // the ConfigMap goes with its owner
            info!("ingress {} deleted", ing.key());
            known.remove(&ing.key());
            None
        }
    }
}

fn needs_update(current: Option<&ConfigMap>, config: &str) -> bool {
    let stored = current.and_then(|cm| cm.data.as_ref()?.get(CONFIG_KEY));
    stored.map(String::as_str) != Some(config)
}

fn config_map(ing: &Ingress, name: &str, config: String) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ing.namespace().to_string()),
            owner_references: ing.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        data: Some(Map::from([(CONFIG_KEY.to_string(), config)])),
        ..Default::default()
    }
}
