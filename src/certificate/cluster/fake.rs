//! In-memory cluster for certificate tests.

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap as Map;
use std::sync::Mutex;

use super::CertCluster;
use crate::api::{Certificate, Ingress};
use crate::{Error, Result};

type Objects<K> = Mutex<Map<(String, String), K>>;

#[derive(Default)]
pub struct FakeCluster {
    secrets: Objects<Secret>,
    certificates: Objects<Certificate>,
    ingresses: Objects<Ingress>,
    /// `kind namespace/name` of every write, in order.
    pub writes: Mutex<Vec<String>>,
}

fn key(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_else(|| "default".into()),
        meta.name.clone().unwrap_or_default(),
    )
}

fn get<K: Clone>(objects: &Objects<K>, namespace: &str, name: &str) -> Option<K> {
    let objects = objects.lock().unwrap();
    objects.get(&(namespace.to_string(), name.to_string())).cloned()
}

fn not_found(name: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".into(),
        message: format!("{name} not found"),
        reason: "NotFound".into(),
        code: 404,
    }))
}

impl FakeCluster {
    pub fn add_secret(&self, secret: Secret) {
        self.secrets.lock().unwrap().insert(key(&secret.metadata), secret);
    }

    pub fn add_certificate(&self, crd: Certificate) {
        self.certificates.lock().unwrap().insert(key(&crd.metadata), crd);
    }

    pub fn add_ingress(&self, ing: Ingress) {
        self.ingresses.lock().unwrap().insert(key(&ing.metadata), ing);
    }

    pub fn get_secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        get(&self.secrets, namespace, name)
    }

    pub fn get_certificate(&self, namespace: &str, name: &str) -> Option<Certificate> {
        get(&self.certificates, namespace, name)
    }

    pub fn get_ingress(&self, namespace: &str, name: &str) -> Option<Ingress> {
        get(&self.ingresses, namespace, name)
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    fn update<K: Clone>(
        &self,
        objects: &Objects<K>,
        kind: &str,
        namespace: &str,
        name: &str,
        mut transform: impl FnMut(&mut K) -> bool,
    ) -> Result<()> {
        let mut objects = objects.lock().unwrap();
        let obj = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| not_found(name))?;
        let mut updated = obj.clone();
        if transform(&mut updated) {
            *obj = updated;
            self.writes
                .lock()
                .unwrap()
                .push(format!("{kind} {namespace}/{name}"));
        }
        Ok(())
    }
}

impl CertCluster for FakeCluster {
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.get_secret(namespace, name))
    }

    async fn apply_secret(&self, secret: Secret) -> Result<()> {
        let (namespace, name) = key(&secret.metadata);
        self.writes
            .lock()
            .unwrap()
            .push(format!("secret {namespace}/{name}"));
        self.add_secret(secret);
        Ok(())
    }

    async fn update_secret<F>(&self, namespace: &str, name: &str, transform: F) -> Result<()>
    where
        F: FnMut(&mut Secret) -> bool + Send,
    {
        self.update(&self.secrets, "secret", namespace, name, transform)
    }

    async fn update_status<F>(&self, namespace: &str, name: &str, transform: F) -> Result<()>
    where
        F: FnMut(&mut Certificate) -> bool + Send,
    {
        self.update(&self.certificates, "certificate", namespace, name, transform)
    }

    async fn update_ingress<F>(&self, namespace: &str, name: &str, transform: F) -> Result<()>
    where
        F: FnMut(&mut Ingress) -> bool + Send,
    {
        self.update(&self.ingresses, "ingress", namespace, name, transform)
    }
}
