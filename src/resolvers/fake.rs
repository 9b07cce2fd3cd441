//! In-memory cluster for tests.

use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, ObjectReference, Pod, Secret,
    Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use std::collections::BTreeMap as Map;

use super::ClusterReader;
use crate::Result;

#[derive(Default)]
pub struct FakeCluster {
    services: Map<(String, String), Service>,
    endpoints: Map<(String, String), Endpoints>,
    pods: Vec<Pod>,
    secrets: Map<(String, String), Secret>,
}

fn key(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn lookup<T: Clone>(m: &Map<(String, String), T>, namespace: &str, name: &str) -> Option<T> {
    m.get(&(namespace.to_string(), name.to_string())).cloned()
}

impl FakeCluster {
    pub fn add_service(&mut self, svc: Service) {
        self.services.insert(key(&svc.metadata), svc);
    }

    pub fn add_endpoints(&mut self, eps: Endpoints) {
        self.endpoints.insert(key(&eps.metadata), eps);
    }

    pub fn add_pod(&mut self, pod: Pod) {
        self.pods.push(pod);
    }

    pub fn add_secret(&mut self, secret: Secret) {
        self.secrets.insert(key(&secret.metadata), secret);
    }
}

impl ClusterReader for FakeCluster {
    async fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(lookup(&self.services, namespace, name))
    }

    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        Ok(lookup(&self.endpoints, namespace, name))
    }

    async fn pods(&self, namespace: &str, selector: &Map<String, String>) -> Result<Vec<Pod>> {
        if selector.is_empty() {
            return Ok(vec![]);
        }
        Ok((self.pods.iter())
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .filter(|p| {
                let labels = p.metadata.labels.clone().unwrap_or_default();
                selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(lookup(&self.secrets, namespace, name))
    }
}

fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        ..Default::default()
    }
}

/// Service selecting pods labelled `app: <name>`.
pub fn service(name: &str, namespace: &str, ports: &[(&str, i32, IntOrString)]) -> Service {
    Service {
        metadata: meta(name, namespace),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            selector: Some([("app".to_string(), name.to_string())].into()),
            ports: Some(
                (ports.iter())
                    .map(|(port_name, port, target)| ServicePort {
                        name: Some(port_name.to_string()),
                        port: *port,
                        target_port: Some(target.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One subset with the given `(ip, pod name)` addresses and `(name, port)`
/// ports.
pub fn endpoints(
    name: &str,
    namespace: &str,
    addresses: &[(&str, Option<&str>)],
    ports: &[(Option<&str>, i32)],
) -> Endpoints {
    Endpoints {
        metadata: meta(name, namespace),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                (addresses.iter())
                    .map(|(ip, pod)| EndpointAddress {
                        ip: ip.to_string(),
                        target_ref: pod.map(|pod| ObjectReference {
                            kind: Some("Pod".into()),
                            name: Some(pod.into()),
                            namespace: Some(namespace.into()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(
                (ports.iter())
                    .map(|(port_name, port)| EndpointPort {
                        name: port_name.map(String::from),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    }
}

/// Pod labelled `app: <name without the last dash suffix>`.
pub fn pod(name: &str, namespace: &str, annotations: &[(&str, &str)]) -> Pod {
    let app = name.rsplit_once('-').map_or(name, |(app, _)| app);
    let mut metadata = meta(name, namespace);
    metadata.labels = Some([("app".to_string(), app.to_string())].into());
    metadata.annotations = Some(
        (annotations.iter())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    Pod {
        metadata,
        ..Default::default()
    }
}

pub fn secret(name: &str, namespace: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: meta(name, namespace),
        data: Some(
            (data.iter())
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}
