use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use kube::api::{Api, Patch, PatchParams};

use super::CertCluster;
use crate::api::{Certificate, Ingress};
use crate::retry::{self, RetryConfig};
use crate::{Error, Result};

const FIELD_MANAGER: &str = "voyager-operator";

/// Talks to the API server, retrying conflicting updates.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    retry: RetryConfig,
}

impl KubeCluster {
    pub fn new(client: Client, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::api::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl CertCluster for KubeCluster {
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.api::<Secret>(namespace).get_opt(name).await?)
    }

    async fn apply_secret(&self, secret: Secret) -> Result<()> {
        let (Some(namespace), Some(name)) = (&secret.metadata.namespace, &secret.metadata.name)
        else {
            return Err(Error::invalid("secret", "", "namespace and name are required"));
        };
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api::<Secret>(namespace)
            .patch(name, &params, &Patch::Apply(&secret))
            .await?;
        Ok(())
    }

    async fn update_secret<F>(&self, namespace: &str, name: &str, transform: F) -> Result<()>
    where
        F: FnMut(&mut Secret) -> bool + Send,
    {
        let secrets = self.api::<Secret>(namespace);
        retry::update(&secrets, name, &self.retry, transform).await?;
        Ok(())
    }

    async fn update_status<F>(&self, namespace: &str, name: &str, transform: F) -> Result<()>
    where
        F: FnMut(&mut Certificate) -> bool + Send,
    {
        let certs = self.api::<Certificate>(namespace);
        retry::update_status(&certs, name, &self.retry, transform).await?;
        Ok(())
    }

    async fn update_ingress<F>(&self, namespace: &str, name: &str, transform: F) -> Result<()>
    where
        F: FnMut(&mut Ingress) -> bool + Send,
    {
        let ingresses = self.api::<Ingress>(namespace);
        retry::update(&ingresses, name, &self.retry, transform).await?;
        Ok(())
    }
}
