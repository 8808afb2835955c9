use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::{
    api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::OwnerReference, ByteString,
};
use kube::core::ObjectMeta;
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    metrics::Metrics,
    pipeline::{self, classify, Outcome},
    store::ClusterStore,
    Error,
};

const SECRET_GVK: &str = "/v1, Kind=Secret";

/// A secret to create, owned by `owner_ref` when it carries a UID.
#[derive(Debug, Clone)]
pub struct SecretCreation {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, ByteString>,
    pub owner_ref: Option<OwnerReference>,
}

impl SecretCreation {
    fn into_secret(self) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                owner_references: self
                    .owner_ref
                    .filter(|x| !x.uid.is_empty())
                    .map(|x| vec![x]),
                ..Default::default()
            },
            data: Some(self.data),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretDeletion {
    pub name: String,
    pub namespace: String,
}

/// Picks the configured keys out of the default CA secret.
pub fn ca_secret_data(
    secret: &Secret,
    keys: &[String],
) -> Result<BTreeMap<String, ByteString>, Error> {
    keys.iter()
        .map(|key| {
            secret
                .data
                .as_ref()
                .and_then(|x| x.get(key))
                .map(|value| (key.clone(), value.clone()))
                .ok_or_else(|| Error::SecretKeyMissing(key.clone()))
        })
        .collect()
}

/// Creates the secrets requested through its queue, one at a time and without retries.
pub struct SecretCreator {
    store: Arc<dyn ClusterStore>,
    requests: mpsc::Receiver<SecretCreation>,
    metrics: Metrics,
}

impl SecretCreator {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        metrics: Metrics,
    ) -> (Self, mpsc::Sender<SecretCreation>) {
        let (sender, requests) = pipeline::queue();
        (
            SecretCreator {
                store,
                requests,
                metrics,
            },
            sender,
        )
    }

    pub async fn run(mut self, token: CancellationToken) -> Result<(), Error> {
        info!("starting secret creator");
        while let Some(request) = pipeline::next(&mut self.requests, &token).await {
            self.create(request).await;
        }
        info!("secret creator stopped");
        Ok(())
    }

    async fn create(&self, request: SecretCreation) {
        debug!("secret creation request {}/{}", request.namespace, request.name);
        let name = request.name.clone();
        let ns = request.namespace.clone();

        match classify(self.store.create_secret(request.into_secret()).await) {
            Outcome::Succeeded => {
                self.metrics.resource_created(&ns, SECRET_GVK);
                info!("created secret {ns}/{name}");
            }
            Outcome::AlreadyExists => {
                self.metrics.resource_already_exists(&ns, SECRET_GVK);
                info!("secret {ns}/{name} already exists");
            }
            Outcome::NotFound(message) | Outcome::Rejected(message) => {
                self.metrics.resource_create_error(&ns, SECRET_GVK);
                error!("creating secret {ns}/{name} rejected: {message}");
            }
            Outcome::Failed(e) => {
                self.metrics.resource_create_error(&ns, SECRET_GVK);
                error!("creating secret {ns}/{name}: {e}");
            }
        }
    }
}

/// Deletes the secrets of root Pods that are going away.
pub struct SecretDeleter {
    store: Arc<dyn ClusterStore>,
    requests: mpsc::Receiver<SecretDeletion>,
    metrics: Metrics,
}

impl SecretDeleter {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        metrics: Metrics,
    ) -> (Self, mpsc::Sender<SecretDeletion>) {
        let (sender, requests) = pipeline::queue();
        (
            SecretDeleter {
                store,
                requests,
                metrics,
            },
            sender,
        )
    }

    pub async fn run(mut self, token: CancellationToken) -> Result<(), Error> {
        info!("starting secret deleter");
        while let Some(request) = pipeline::next(&mut self.requests, &token).await {
            self.delete(request).await;
        }
        info!("secret deleter stopped");
        Ok(())
    }

    async fn delete(&self, SecretDeletion { name, namespace: ns }: SecretDeletion) {
        debug!("secret deletion request {ns}/{name}");

        match classify(self.store.delete_secret(&ns, &name).await) {
            Outcome::Succeeded => {
                self.metrics.resource_deleted(&ns, SECRET_GVK);
                info!("deleted secret {ns}/{name}");
            }
            Outcome::NotFound(_) => {
                self.metrics.resource_not_found(&ns, SECRET_GVK);
                info!("secret {ns}/{name} not found");
            }
            Outcome::Rejected(message) => {
                self.metrics.resource_delete_error(&ns, SECRET_GVK);
                error!("deleting secret {ns}/{name} rejected: {message}");
            }
            Outcome::AlreadyExists => {
                self.metrics.resource_delete_error(&ns, SECRET_GVK);
                error!("deleting secret {ns}/{name} rejected: unexpected conflict");
            }
            Outcome::Failed(e) => {
                self.metrics.resource_delete_error(&ns, SECRET_GVK);
                error!("deleting secret {ns}/{name}: {e}");
            }
        }
    }
}
