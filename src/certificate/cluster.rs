//! Cluster objects the certificate controller reads and writes.

use k8s_openapi::api::core::v1::Secret;
use std::future::Future;

use crate::Result;
use crate::api::{Certificate, Ingress};

pub mod kube;

#[cfg(test)]
pub mod fake;

/// Updates re-read the object and run `transform` on it until the write
/// goes through. A transform returning `false` skips the write.
pub trait CertCluster: Send + Sync {
    /// `Ok(None)` when the secret does not exist.
    fn secret(&self, namespace: &str, name: &str)
    -> impl Future<Output = Result<Option<Secret>>> + Send;

    /// Creates the secret, or takes over the fields it sets.
    fn apply_secret(&self, secret: Secret) -> impl Future<Output = Result<()>> + Send;

    fn update_secret<F>(
        &self,
        namespace: &str,
        name: &str,
        transform: F,
    ) -> impl Future<Output = Result<()>> + Send
    where
        F: FnMut(&mut Secret) -> bool + Send;

    fn update_status<F>(
        &self,
        namespace: &str,
        name: &str,
        transform: F,
    ) -> impl Future<Output = Result<()>> + Send
    where
        F: FnMut(&mut Certificate) -> bool + Send;

    fn update_ingress<F>(
        &self,
        namespace: &str,
        name: &str,
        transform: F,
    ) -> impl Future<Output = Result<()>> + Send
    where
        F: FnMut(&mut Ingress) -> bool + Send;
}
