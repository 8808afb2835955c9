use std::sync::Arc;

use base64::{prelude::BASE64_STANDARD, Engine};
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::OwnerReference, ByteString};
use kube::CustomResource;
use log::{debug, error, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    metrics::Metrics,
    pipeline::{self, classify, Outcome},
    secrets::SecretCreation,
    store::ClusterStore,
    Error,
};

const CERTIFICATE_GVK: &str = "cert-manager.io/v1, Kind=Certificate";
const PASSWORD_KEY: &str = "password";

/// The subset of the cert-manager Certificate the injector fills in.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(group = "cert-manager.io", version = "v1", kind = "Certificate", namespaced)]
pub struct CertificateSpec {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub secret_name: String,
    pub issuer_ref: IssuerRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystores: Option<Keystores>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct IssuerRef {
    pub name: String,
    pub kind: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct Keystores {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jks: Option<JksKeystore>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JksKeystore {
    pub create: bool,
    pub password_secret_ref: SecretKeySelector,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

/// Secret holding the keystore cert-manager generates for `root_name`.
pub fn secret_name(root_name: &str) -> String {
    format!("{root_name}-truststore-cert")
}

pub fn truststore_password_secret_name(root_name: &str) -> String {
    format!("{root_name}-truststore-password")
}

/// A JVM truststore to provision for a root workload object.
#[derive(Debug, Clone)]
pub struct CertificateCreation {
    pub root_name: String,
    pub namespace: String,
    /// The first entry doubles as the common name.
    pub dns_names: Vec<String>,
    pub truststore_password: String,
    pub owner_ref: Option<OwnerReference>,
}

impl CertificateCreation {
    fn password_secret(&self) -> SecretCreation {
        let encoded = BASE64_STANDARD.encode(&self.truststore_password);
        SecretCreation {
            name: truststore_password_secret_name(&self.root_name),
            namespace: self.namespace.clone(),
            data: [(PASSWORD_KEY.to_string(), ByteString(encoded.into_bytes()))]
                .into_iter()
                .collect(),
            owner_ref: self.owner_ref.clone(),
        }
    }

    fn certificate(&self, issuer: &str) -> Certificate {
        let mut certificate = Certificate::new(
            &self.root_name,
            CertificateSpec {
                common_name: self.dns_names.first().cloned().unwrap_or_default(),
                dns_names: self.dns_names.clone(),
                secret_name: secret_name(&self.root_name),
                issuer_ref: IssuerRef {
                    name: issuer.to_string(),
                    kind: "ClusterIssuer".to_string(),
                },
                keystores: Some(Keystores {
                    jks: Some(JksKeystore {
                        create: true,
                        password_secret_ref: SecretKeySelector {
                            name: truststore_password_secret_name(&self.root_name),
                            key: PASSWORD_KEY.to_string(),
                        },
                    }),
                }),
            },
        );
        certificate.metadata.namespace = Some(self.namespace.clone());
        certificate.metadata.owner_references = self
            .owner_ref
            .clone()
            .filter(|x| !x.uid.is_empty())
            .map(|x| vec![x]);
        certificate
    }
}

/// Creates cert-manager Certificates carrying a JKS truststore for JVM workloads,
/// along with the secret holding the truststore password.
pub struct CertificateCreator {
    store: Arc<dyn ClusterStore>,
    issuer: String,
    requests: mpsc::Receiver<CertificateCreation>,
    secret_queue: mpsc::Sender<SecretCreation>,
    metrics: Metrics,
}

impl CertificateCreator {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        issuer: &str,
        secret_queue: mpsc::Sender<SecretCreation>,
        metrics: Metrics,
    ) -> (Self, mpsc::Sender<CertificateCreation>) {
        let (sender, requests) = pipeline::queue();
        (
            CertificateCreator {
                store,
                issuer: issuer.to_string(),
                requests,
                secret_queue,
                metrics,
            },
            sender,
        )
    }

    pub async fn run(mut self, token: CancellationToken) -> Result<(), Error> {
        info!("starting certificate creator");
        while let Some(request) = pipeline::next(&mut self.requests, &token).await {
            debug!(
                "certificate request {}/{} for {:?}",
                request.namespace, request.root_name, request.dns_names
            );

            match pipeline::enqueue(&self.secret_queue, request.password_secret(), &token).await {
                Ok(()) => (),
                Err(Error::Cancelled) => break,
                Err(e) => {
                    error!(
                        "queueing truststore password secret for {}/{}: {e}",
                        request.namespace, request.root_name
                    );
                }
            }

            self.create(&request).await;
        }
        info!("certificate creator stopped");
        Ok(())
    }

    async fn create(&self, request: &CertificateCreation) {
        let ns = &request.namespace;
        let name = &request.root_name;

        let result = self
            .store
            .create_certificate(request.certificate(&self.issuer))
            .await;
        match classify(result) {
            Outcome::Succeeded => {
                self.metrics.resource_created(ns, CERTIFICATE_GVK);
                info!("created certificate {ns}/{name}");
            }
            Outcome::AlreadyExists => {
                self.metrics.resource_already_exists(ns, CERTIFICATE_GVK);
                info!("certificate {ns}/{name} already exists");
            }
            Outcome::NotFound(message) | Outcome::Rejected(message) => {
                self.metrics.resource_create_error(ns, CERTIFICATE_GVK);
                error!("creating certificate {ns}/{name} rejected: {message}");
            }
            Outcome::Failed(e) => {
                self.metrics.resource_create_error(ns, CERTIFICATE_GVK);
                error!("creating certificate {ns}/{name}: {e}");
            }
        }
    }
}
