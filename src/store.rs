use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
    batch::v1::{CronJob, Job},
    core::v1::Secret,
};
use kube::{
    api::{DeleteParams, PostParams},
    core::ObjectMeta,
    Api, Client,
};

use crate::{certificates::Certificate, owner::ControllerKind};

/// The slice of the cluster API the injector reads and writes.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetches the metadata of a controlling workload object.
    async fn get_controller(
        &self,
        kind: ControllerKind,
        namespace: &str,
        name: &str,
    ) -> Result<ObjectMeta, kube::Error>;

    async fn create_secret(&self, secret: Secret) -> Result<(), kube::Error>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    async fn create_certificate(&self, certificate: Certificate) -> Result<(), kube::Error>;
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }

    pub async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_controller(
        &self,
        kind: ControllerKind,
        namespace: &str,
        name: &str,
    ) -> Result<ObjectMeta, kube::Error> {
        let client = self.client.clone();
        let metadata = match kind {
            ControllerKind::Deployment => {
                Api::<Deployment>::namespaced(client, namespace)
                    .get(name)
                    .await?
                    .metadata
            }
            ControllerKind::StatefulSet => {
                Api::<StatefulSet>::namespaced(client, namespace)
                    .get(name)
                    .await?
                    .metadata
            }
            ControllerKind::ReplicaSet => {
                Api::<ReplicaSet>::namespaced(client, namespace)
                    .get(name)
                    .await?
                    .metadata
            }
            ControllerKind::DaemonSet => {
                Api::<DaemonSet>::namespaced(client, namespace)
                    .get(name)
                    .await?
                    .metadata
            }
            ControllerKind::CronJob => {
                Api::<CronJob>::namespaced(client, namespace)
                    .get(name)
                    .await?
                    .metadata
            }
            ControllerKind::Job => {
                Api::<Job>::namespaced(client, namespace)
                    .get(name)
                    .await?
                    .metadata
            }
        };
        Ok(metadata)
    }

    async fn create_secret(&self, secret: Secret) -> Result<(), kube::Error> {
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        Api::<Secret>::namespaced(self.client.clone(), &namespace)
            .create(&PostParams::default(), &secret)
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn create_certificate(&self, certificate: Certificate) -> Result<(), kube::Error> {
        let namespace = certificate.metadata.namespace.clone().unwrap_or_default();
        Api::<Certificate>::namespaced(self.client.clone(), &namespace)
            .create(&PostParams::default(), &certificate)
            .await?;
        Ok(())
    }
}
