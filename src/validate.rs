use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::ByteString;
use kube::core::{admission::Operation, ObjectMeta};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    certificates::CertificateCreation,
    config::CaSecretRef,
    metadata::Extractor,
    owner::resolve_root,
    pipeline,
    secrets::{SecretCreation, SecretDeletion},
    store::ClusterStore,
    webhook::{Review, NOT_A_POD},
    Error,
};

/// Producer ends of the provisioning queues.
#[derive(Clone)]
pub struct ProvisioningQueues {
    pub secret_creation: mpsc::Sender<SecretCreation>,
    pub secret_deletion: mpsc::Sender<SecretDeletion>,
    pub certificate_creation: mpsc::Sender<CertificateCreation>,
}

/// Turns Pod admissions into provisioning requests. Never rejects a workload, the only
/// failures are unsupported operations and shutdown.
pub struct Validator {
    extractor: Extractor,
    store: Arc<dyn ClusterStore>,
    ca_secret: CaSecretRef,
    ca_data: BTreeMap<String, ByteString>,
    queues: ProvisioningQueues,
    token: CancellationToken,
}

impl Validator {
    pub fn new(
        extractor: Extractor,
        store: Arc<dyn ClusterStore>,
        ca_secret: CaSecretRef,
        ca_data: BTreeMap<String, ByteString>,
        queues: ProvisioningQueues,
        token: CancellationToken,
    ) -> Self {
        Validator {
            extractor,
            store,
            ca_secret,
            ca_data,
            queues,
            token,
        }
    }

    /// Returns the warnings to attach to an allowed review.
    pub async fn validate(&self, review: &Review) -> Result<Vec<String>, Error> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let meta = &review.object.metadata;
        if !self.extractor.is_injection_enabled(meta) {
            debug!("injection is not enabled on {}/{}", review.namespace, review.name());
            return Ok(vec![]);
        }
        if !review.is_pod() {
            warn!("no Pod object in review of {}", review.kind);
            return Ok(vec![NOT_A_POD.to_string()]);
        }

        match &review.operation {
            Operation::Delete => self.delete(meta, review).await,
            Operation::Create => self.create(meta, review).await,
            other => {
                error!("no logic to handle operation {other:?}");
                Err(Error::UnsupportedOperation(format!("{other:?}")))
            }
        }
    }

    /// Pods with owners share the secret of their root object, which the cluster
    /// collects together with that object.
    async fn delete(&self, meta: &ObjectMeta, review: &Review) -> Result<Vec<String>, Error> {
        let is_root = meta
            .owner_references
            .as_ref()
            .map_or(true, |x| x.is_empty());
        if !is_root || review.dry_run {
            return Ok(vec![]);
        }

        let request = SecretDeletion {
            name: self.ca_secret.secret_name(review.name()),
            namespace: review.namespace.clone(),
        };
        info!("queueing deletion of secret {}/{}", request.namespace, request.name);
        pipeline::enqueue(&self.queues.secret_deletion, request, &self.token).await?;
        Ok(vec![])
    }

    async fn create(&self, meta: &ObjectMeta, review: &Review) -> Result<Vec<String>, Error> {
        let mut root = match resolve_root(self.store.as_ref(), meta, &review.namespace).await {
            Ok(root) => root,
            Err(e) => {
                error!("getting root object of {}/{}: {e}", review.namespace, review.name());
                return Ok(vec![format!("No root object found for Pod: {e}")]);
            }
        };
        if review.dry_run {
            return Ok(vec![]);
        }

        if root.meta.namespace.as_deref().map_or(true, str::is_empty) {
            root.meta.namespace = Some(review.namespace.clone());
        }
        let owner_ref = root.controller_ref();

        let secret = SecretCreation {
            name: self.ca_secret.secret_name(root.name()),
            namespace: review.namespace.clone(),
            data: self.ca_data.clone(),
            owner_ref: owner_ref.clone(),
        };
        debug!("queueing creation of secret {}/{}", secret.namespace, secret.name);
        pipeline::enqueue(&self.queues.secret_creation, secret, &self.token).await?;

        if self.extractor.is_jvm_enabled(meta) {
            let certificate = CertificateCreation {
                root_name: root.name().to_string(),
                namespace: root.meta.namespace.clone().unwrap_or_default(),
                dns_names: vec![self.extractor.jvm_common_name(&root.meta)],
                truststore_password: self.extractor.truststore_password(meta),
                owner_ref,
            };
            debug!(
                "queueing certificate for {}/{}",
                certificate.namespace, certificate.root_name
            );
            pipeline::enqueue(&self.queues.certificate_creation, certificate, &self.token)
                .await?;
        }

        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::{Container, Pod, PodSpec, Secret},
        apimachinery::pkg::apis::meta::v1::OwnerReference,
    };
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::{owner::ControllerKind, store::fake::FakeStore};

    struct Harness {
        validator: Validator,
        store: Arc<FakeStore>,
        secrets: mpsc::Receiver<SecretCreation>,
        deletions: mpsc::Receiver<SecretDeletion>,
        certificates: mpsc::Receiver<CertificateCreation>,
        token: CancellationToken,
    }

    fn harness() -> Harness {
        let store = Arc::new(FakeStore::default());
        let (secret_creation, secrets) = pipeline::queue();
        let (secret_deletion, deletions) = pipeline::queue();
        let (certificate_creation, certificates) = pipeline::queue();
        let token = CancellationToken::new();
        let ca_data = [("ca.crt".to_string(), ByteString(b"PEM".to_vec()))]
            .into_iter()
            .collect();
        let validator = Validator::new(
            Extractor::new("weisshorn.cyd", "changeit"),
            store.clone(),
            "ca-pki-certs/ca.crt".parse().unwrap(),
            ca_data,
            ProvisioningQueues {
                secret_creation,
                secret_deletion,
                certificate_creation,
            },
            token.clone(),
        );
        Harness {
            validator,
            store,
            secrets,
            deletions,
            certificates,
            token,
        }
    }

    fn pod(name: &str, enabled: bool, owners: Vec<OwnerReference>) -> Pod {
        let mut labels = BTreeMap::new();
        if enabled {
            labels.insert("cain.weisshorn.cyd/enabled".to_string(), "true".to_string());
        }
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels),
                owner_references: if owners.is_empty() { None } else { Some(owners) },
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "busybox".to_string(),
                    image: Some("busybox".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn replica_set_owner() -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "ReplicaSet".to_string(),
            name: "test-dep-abc".to_string(),
            uid: "rs-uid".to_string(),
            controller: Some(true),
            ..Default::default()
        }
    }

    async fn add_deployment(store: &FakeStore) {
        store
            .add_controller(
                ControllerKind::Deployment,
                "default",
                ObjectMeta {
                    name: Some("test-dep".to_string()),
                    namespace: Some("default".to_string()),
                    ..Default::default()
                },
            )
            .await;
        store
            .add_controller(
                ControllerKind::ReplicaSet,
                "default",
                ObjectMeta {
                    name: Some("test-dep-abc".to_string()),
                    namespace: Some("default".to_string()),
                    owner_references: Some(vec![OwnerReference {
                        api_version: "apps/v1".to_string(),
                        kind: "Deployment".to_string(),
                        name: "test-dep".to_string(),
                        uid: "dep-uid".to_string(),
                        controller: Some(true),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
            )
            .await;
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let mut h = harness();
        for operation in [Operation::Create, Operation::Delete, Operation::Update] {
            let review = Review::for_pod(operation, "default", &pod("web", false, vec![]));
            assert!(h.validator.validate(&review).await.unwrap().is_empty());
        }
        assert_eq!(h.secrets.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(h.deletions.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn test_not_a_pod_is_allowed_with_warning() {
        let h = harness();
        let secret = Secret {
            metadata: pod("web", true, vec![]).metadata,
            ..Default::default()
        };
        let review = Review::for_object(Operation::Create, "default", "Secret", &secret);
        assert_eq!(
            h.validator.validate(&review).await.unwrap(),
            vec![NOT_A_POD.to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_root_pod() {
        let mut h = harness();
        let review = Review::for_pod(Operation::Delete, "default", &pod("web", true, vec![]));
        assert!(h.validator.validate(&review).await.unwrap().is_empty());
        assert_eq!(
            h.deletions.try_recv().unwrap(),
            SecretDeletion {
                name: "ca-pki-certs-web".to_string(),
                namespace: "default".to_string(),
            }
        );
        assert_eq!(h.deletions.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn test_delete_owned_pod() {
        let mut h = harness();
        let review = Review::for_pod(
            Operation::Delete,
            "default",
            &pod("test-dep-abc-xyz", true, vec![replica_set_owner()]),
        );
        assert!(h.validator.validate(&review).await.unwrap().is_empty());
        assert_eq!(h.deletions.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn test_dry_run_has_no_side_effects() {
        let mut h = harness();
        add_deployment(&h.store).await;
        let mut owned = pod("test-dep-abc-xyz", true, vec![replica_set_owner()]);
        owned.metadata.annotations = Some(
            [("cain.weisshorn.cyd/jvm".to_string(), "true".to_string())]
                .into_iter()
                .collect(),
        );

        for (operation, object) in [
            (Operation::Create, owned),
            (Operation::Delete, pod("web", true, vec![])),
        ] {
            let mut review = Review::for_pod(operation, "default", &object);
            review.dry_run = true;
            assert!(h.validator.validate(&review).await.unwrap().is_empty());
        }
        assert_eq!(h.secrets.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(h.deletions.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(h.certificates.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn test_create_owned_by_deployment() {
        let mut h = harness();
        add_deployment(&h.store).await;
        let review = Review::for_pod(
            Operation::Create,
            "default",
            &pod("test-dep-abc-xyz", true, vec![replica_set_owner()]),
        );
        assert!(h.validator.validate(&review).await.unwrap().is_empty());

        let request = h.secrets.try_recv().unwrap();
        assert_eq!(request.name, "ca-pki-certs-test-dep");
        assert_eq!(request.namespace, "default");
        assert_eq!(request.data["ca.crt"], ByteString(b"PEM".to_vec()));
        let owner = request.owner_ref.unwrap();
        assert_eq!(owner.kind, "Deployment");
        assert_eq!(owner.uid, "dep-uid");
        assert_eq!(h.certificates.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn test_create_jvm_queues_certificate() {
        let mut h = harness();
        let mut jvm = pod("web", true, vec![]);
        jvm.metadata.annotations = Some(
            [
                ("cain.weisshorn.cyd/jvm".to_string(), "true".to_string()),
                ("cain.weisshorn.cyd/truststore-password".to_string(), "s3cret".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let review = Review::for_pod(Operation::Create, "default", &jvm);
        assert!(h.validator.validate(&review).await.unwrap().is_empty());

        let secret = h.secrets.try_recv().unwrap();
        assert_eq!(secret.name, "ca-pki-certs-web");
        assert!(secret.owner_ref.is_none());

        let certificate = h.certificates.try_recv().unwrap();
        assert_eq!(certificate.root_name, "web");
        assert_eq!(certificate.namespace, "default");
        assert_eq!(certificate.dns_names, vec!["web.default.weisshorn.cyd".to_string()]);
        assert_eq!(certificate.truststore_password, "s3cret");
    }

    #[tokio::test]
    async fn test_unresolvable_owner_allows_with_warning() {
        let mut h = harness();
        let review = Review::for_pod(
            Operation::Create,
            "default",
            &pod("test-dep-abc-xyz", true, vec![replica_set_owner()]),
        );
        let warnings = h.validator.validate(&review).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("No root object found for Pod"));
        assert_eq!(h.secrets.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn test_update_is_unsupported() {
        let h = harness();
        let review = Review::for_pod(Operation::Update, "default", &pod("web", true, vec![]));
        assert!(matches!(
            h.validator.validate(&review).await,
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_fails_the_call() {
        let h = harness();
        h.token.cancel();
        let review = Review::for_pod(Operation::Create, "default", &pod("web", true, vec![]));
        assert!(matches!(
            h.validator.validate(&review).await,
            Err(Error::Cancelled)
        ));
    }
}
