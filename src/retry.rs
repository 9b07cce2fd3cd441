//! Bounded retry for writes that race against other writers.
//!
//! Remote updates read the current object, apply a transform and attempt the
//! write. A conflict sends the loop back to the read; any other error is
//! returned as-is.

use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, PostParams};
use log::{debug, warn};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;
use std::time::Duration;

use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_millis(500),
        }
    }
}

impl RetryConfig {
    /// interval with 0.5x..1.5x jitter
    fn delay(&self) -> Duration {
        self.interval.mul_f64(0.5 + fastrand::f64())
    }
}

/// Attempt budget shared by the retry loops below.
struct Attempts<'a> {
    cfg: &'a RetryConfig,
    resource: &'a str,
    attempt: u32,
}

impl<'a> Attempts<'a> {
    fn new(cfg: &'a RetryConfig, resource: &'a str) -> Self {
        Self {
            cfg,
            resource,
            attempt: 0,
        }
    }

    /// Records a failed attempt. Sleeps and returns `Ok` when another attempt
    /// is allowed, otherwise hands back the error to surface.
    async fn failed(&mut self, err: Error) -> Result<()> {
        self.attempt += 1;
        let attempts = self.cfg.attempts.max(1);
        if !err.is_conflict() {
            return Err(err);
        }
        if self.attempt >= attempts {
            return Err(Error::RetryExhausted {
                resource: self.resource.to_string(),
                attempts: self.attempt,
                source: Box::new(err),
            });
        }
        let delay = self.cfg.delay();
        warn!(
            "conflict updating {} (attempt {}/{attempts}), retrying in {delay:?}",
            self.resource, self.attempt
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

/// Read-transform-write on a namespaced object. The transform sees the
/// freshest copy on every attempt; returning `false` skips the write.
pub async fn update<K, F>(
    api: &Api<K>,
    name: &str,
    cfg: &RetryConfig,
    mut transform: F,
) -> Result<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
    <K as kube::Resource>::DynamicType: Default,
    F: FnMut(&mut K) -> bool,
{
    let resource = format!("{}/{name}", K::kind(&Default::default()));
    let mut attempts = Attempts::new(cfg, &resource);
    loop {
        let mut obj = match api.get(name).await {
            Ok(obj) => obj,
            Err(e) => {
                attempts.failed(e.into()).await?;
                continue;
            }
        };
        if !transform(&mut obj) {
            debug!("{resource}: nothing to update");
            return Ok(obj);
        }
        match api.replace(name, &PostParams::default(), &obj).await {
            Ok(obj) => return Ok(obj),
            Err(e) => attempts.failed(e.into()).await?,
        }
    }
}

/// Same loop as [`update`], against the status subresource.
pub async fn update_status<K, F>(
    api: &Api<K>,
    name: &str,
    cfg: &RetryConfig,
    mut transform: F,
) -> Result<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
    <K as kube::Resource>::DynamicType: Default,
    F: FnMut(&mut K) -> bool,
{
    let resource = format!("{}/{name} status", K::kind(&Default::default()));
    let mut attempts = Attempts::new(cfg, &resource);
    loop {
        let mut obj = match api.get_status(name).await {
            Ok(obj) => obj,
            Err(e) => {
                attempts.failed(e.into()).await?;
                continue;
            }
        };
        if !transform(&mut obj) {
            debug!("{resource}: nothing to update");
            return Ok(obj);
        }
        let data = serde_json::to_vec(&obj)?;
        match api.replace_status(name, &PostParams::default(), data).await {
            Ok(obj) => return Ok(obj),
            Err(e) => attempts.failed(e.into()).await?,
        }
    }
}
