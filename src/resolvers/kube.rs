use itertools::Itertools;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Secret, Service};
use kube::{
    Client,
    api::{Api, ListParams},
};
use std::collections::BTreeMap as Map;

use super::ClusterReader;
use crate::Result;

/// Reads straight from the API server.
#[derive(Clone)]
pub struct KubeReader {
    client: Client,
}

impl KubeReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::api::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl ClusterReader for KubeReader {
    async fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.api::<Service>(namespace).get_opt(name).await?)
    }

    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        Ok(self.api::<Endpoints>(namespace).get_opt(name).await?)
    }

    async fn pods(&self, namespace: &str, selector: &Map<String, String>) -> Result<Vec<Pod>> {
        if selector.is_empty() {
            return Ok(vec![]);
        }
        let labels = selector.iter().map(|(k, v)| format!("{k}={v}")).join(",");
        let pods = self
            .api::<Pod>(namespace)
            .list(&ListParams::default().labels(&labels))
            .await?;
        Ok(pods.items)
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.api::<Secret>(namespace).get_opt(name).await?)
    }
}
