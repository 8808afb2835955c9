//! Pod rewriting that wires injected CAs into every container.
//!
//! An init container regenerates the OS trust bundle from the default CA secret of the
//! workload plus any extra CA secrets into an empty-dir volume, which is then mounted
//! over the bundle directory of every other container. JVM workloads additionally get a
//! cert-manager generated truststore and Python workloads the environment variables
//! pointing their HTTP clients at the bundle.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, KeyToPath, PodSpec, ProjectedVolumeSource,
    ResourceRequirements, SecretProjection, SecretVolumeSource, Volume, VolumeMount,
    VolumeProjection,
};
use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use kube::core::admission::Operation;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    certificates,
    config::CaSecretRef,
    metadata::{Extractor, Family, WorkloadPolicy},
    owner::resolve_root,
    store::ClusterStore,
    webhook::{Review, NOT_A_POD},
    Error,
};

pub const INIT_CONTAINER_NAME: &str = "ca-cert-gen";
pub const TRUSTSTORE_VOLUME_NAME: &str = "cain-truststore";

const PROTECTED_NAMESPACE: &str = "kube-system";
const FILE_MODE: i32 = 0o644;

const REQUESTS_CA_BUNDLE: &str = "REQUESTS_CA_BUNDLE";
const SSL_CERT_FILE: &str = "SSL_CERT_FILE";

pub const ALREADY_MUTATED: &str = "Pod already mutated for CA injection";
pub const CA_VOLUMES_FAILED: &str = "adding CA secret volumes failed";

/// Init container images, one per OS family.
#[derive(Debug, Clone)]
pub struct InitImages {
    pub debian: String,
    pub redhat: String,
}

impl InitImages {
    fn for_family(&self, family: Family) -> &str {
        match family {
            Family::Debian => &self.debian,
            Family::Redhat => &self.redhat,
        }
    }
}

/// Result of a mutation: the operations that rewrite the admitted Pod, if any.
#[derive(Debug, Default)]
pub struct Mutation {
    operations: Vec<PatchOperation>,
    pub warnings: Vec<String>,
}

impl Mutation {
    fn warning(message: &str) -> Self {
        Mutation {
            warnings: vec![message.to_string()],
            ..Default::default()
        }
    }

    /// JSON patch against the Pod as submitted, `None` when nothing changes.
    pub fn patch(&self) -> Option<json_patch::Patch> {
        if self.operations.is_empty() {
            return None;
        }
        Some(json_patch::Patch(self.operations.clone()))
    }
}

pub struct Mutator {
    extractor: Extractor,
    store: Arc<dyn ClusterStore>,
    ca_secret: CaSecretRef,
    images: InitImages,
    jvm_env_var: String,
    resources: ResourceRequirements,
    token: CancellationToken,
}

impl Mutator {
    pub fn new(
        extractor: Extractor,
        store: Arc<dyn ClusterStore>,
        ca_secret: CaSecretRef,
        images: InitImages,
        jvm_env_var: &str,
        resources: ResourceRequirements,
        token: CancellationToken,
    ) -> Self {
        Mutator {
            extractor,
            store,
            ca_secret,
            images,
            jvm_env_var: jvm_env_var.to_string(),
            resources,
            token,
        }
    }

    /// Business failures never reject the Pod, they come back as warnings with the Pod
    /// left as admitted.
    pub async fn mutate(&self, review: &Review) -> Result<Mutation, Error> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !matches!(review.operation, Operation::Create) {
            return Ok(Mutation::default());
        }
        let policy = self.extractor.policy(&review.object.metadata);
        if !policy.enabled {
            debug!("injection is not enabled on {}/{}", review.namespace, review.name());
            return Ok(Mutation::default());
        }
        if review.namespace == PROTECTED_NAMESPACE {
            return Ok(Mutation::default());
        }

        let original = match review.pod() {
            Ok(pod) => pod,
            Err(e) => {
                warn!("no Pod object in review of {}: {e}", review.kind);
                return Ok(Mutation::warning(NOT_A_POD));
            }
        };
        let mut spec = original.spec.clone().unwrap_or_default();
        if spec
            .init_containers
            .iter()
            .flatten()
            .any(|x| x.name == INIT_CONTAINER_NAME)
        {
            warn!(
                "Pod {}/{} already has the CA init container",
                review.namespace,
                review.name()
            );
            return Ok(Mutation::warning(ALREADY_MUTATED));
        }

        let root = match resolve_root(self.store.as_ref(), &original.metadata, &review.namespace)
            .await
        {
            Ok(root) => root,
            Err(e) => {
                error!("{CA_VOLUMES_FAILED} for {}/{}: {e}", review.namespace, review.name());
                return Ok(Mutation::warning(CA_VOLUMES_FAILED));
            }
        };

        self.add_ca_volumes(&mut spec, &policy, root.name());

        if policy.jvm_enabled {
            if has_volume(&spec, TRUSTSTORE_VOLUME_NAME) {
                warn!(
                    "Pod {}/{} already has the CA truststore volume",
                    review.namespace,
                    review.name()
                );
            } else {
                self.add_jvm_truststore(&mut spec, &policy, root.name());
            }
        }
        if policy.python_enabled {
            add_python_env(&mut spec, policy.family);
        }

        let operations = spec_operations(original.spec.as_ref(), &spec)?;
        info!("injected CAs into Pod {}/{}", review.namespace, review.name());
        Ok(Mutation {
            operations,
            warnings: vec![],
        })
    }

    fn add_ca_volumes(&self, spec: &mut PodSpec, policy: &WorkloadPolicy, root_name: &str) {
        let layout = policy.family.layout();
        let secret_name = self.ca_secret.secret_name(root_name);

        let defaults = self.ca_secret.keys().iter().enumerate().map(|(i, key)| {
            secret_projection(&secret_name, key, format!("injected_ca-{i}.crt"))
        });
        let extras = policy.extra_ca_sources.iter().enumerate().map(|(i, source)| {
            let path = format!("injected_extra_ca-{i}.crt");
            secret_projection(&source.secret_name, &source.key, path)
        });

        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        volumes.push(Volume {
            name: policy.secret_volume_name.clone(),
            projected: Some(ProjectedVolumeSource {
                default_mode: Some(FILE_MODE),
                sources: Some(defaults.chain(extras).collect()),
            }),
            ..Default::default()
        });
        volumes.push(Volume {
            name: policy.ca_volume_name.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });

        let bundle_mount = VolumeMount {
            name: policy.ca_volume_name.clone(),
            mount_path: layout.bundle_dir.to_string(),
            ..Default::default()
        };

        let init_containers = spec.init_containers.get_or_insert_with(Vec::new);
        for container in init_containers.iter_mut() {
            push_mount(container, bundle_mount.clone());
        }
        // list order is only a convention for the kubelet, not a guarantee
        init_containers.insert(
            0,
            Container {
                name: INIT_CONTAINER_NAME.to_string(),
                image: Some(self.images.for_family(policy.family).to_string()),
                resources: Some(self.resources.clone()),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: policy.secret_volume_name.clone(),
                        mount_path: layout.incoming_ca_path.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    },
                    bundle_mount.clone(),
                ]),
                ..Default::default()
            },
        );

        for container in &mut spec.containers {
            push_mount(container, bundle_mount.clone());
        }
    }

    fn add_jvm_truststore(&self, spec: &mut PodSpec, policy: &WorkloadPolicy, root_name: &str) {
        spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: TRUSTSTORE_VOLUME_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(certificates::secret_name(root_name)),
                default_mode: Some(FILE_MODE),
                items: Some(vec![KeyToPath {
                    key: policy.jvm_mount_file.clone(),
                    path: policy.jvm_mount_file.clone(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });

        let mount = VolumeMount {
            name: TRUSTSTORE_VOLUME_NAME.to_string(),
            mount_path: policy.jvm_mount_dir.clone(),
            read_only: Some(true),
            ..Default::default()
        };
        let options = format!(
            "-Djavax.net.ssl.trustStore={} -Djavax.net.ssl.password={}",
            policy.truststore_path(),
            policy.truststore_password
        );

        for container in &mut spec.containers {
            push_mount(container, mount.clone());

            let env = container.env.get_or_insert_with(Vec::new);
            match env.iter_mut().find(|x| x.name == self.jvm_env_var) {
                Some(var) => {
                    var.value = Some(match var.value.as_deref() {
                        Some(existing) => format!("{existing} {options}"),
                        None => format!(" {options}"),
                    });
                }
                None => env.push(EnvVar {
                    name: self.jvm_env_var.clone(),
                    value: Some(options.clone()),
                    ..Default::default()
                }),
            }
        }
    }
}

/// Turns the additions made to `mutated` into patch operations.
///
/// Existing list elements are only ever extended, never rewritten, so fields the typed
/// Pod model does not know survive in the submitted object.
fn spec_operations(
    original: Option<&PodSpec>,
    mutated: &PodSpec,
) -> Result<Vec<PatchOperation>, serde_json::Error> {
    let mut operations = Vec::new();
    let Some(original) = original else {
        operations.push(add("/spec".to_string(), mutated)?);
        return Ok(operations);
    };

    for (i, (before, after)) in original.containers.iter().zip(&mutated.containers).enumerate() {
        container_operations(&format!("/spec/containers/{i}"), before, after, &mut operations)?;
    }

    let inits = mutated.init_containers.as_deref().unwrap_or_default();
    match &original.init_containers {
        Some(existing) => {
            let prepended = inits.len().saturating_sub(existing.len());
            // existing indices first, the prepended containers shift them afterwards
            for (i, before) in existing.iter().enumerate() {
                if let Some(after) = inits.get(i + prepended) {
                    let path = format!("/spec/initContainers/{i}");
                    container_operations(&path, before, after, &mut operations)?;
                }
            }
            for (i, container) in inits.iter().take(prepended).enumerate() {
                operations.push(add(format!("/spec/initContainers/{i}"), container)?);
            }
        }
        None if !inits.is_empty() => {
            operations.push(add("/spec/initContainers".to_string(), inits)?);
        }
        None => (),
    }

    append_operations(
        "/spec/volumes",
        original.volumes.as_deref(),
        mutated.volumes.as_deref(),
        &mut operations,
    )?;
    Ok(operations)
}

fn container_operations(
    path: &str,
    before: &Container,
    after: &Container,
    operations: &mut Vec<PatchOperation>,
) -> Result<(), serde_json::Error> {
    append_operations(
        &format!("{path}/volumeMounts"),
        before.volume_mounts.as_deref(),
        after.volume_mounts.as_deref(),
        operations,
    )?;

    let env = before.env.as_deref().unwrap_or_default();
    let mutated_env = after.env.as_deref().unwrap_or_default();
    for (i, (old, new)) in env.iter().zip(mutated_env).enumerate() {
        if old.value == new.value {
            continue;
        }
        let value_path = format!("{path}/env/{i}/value");
        operations.push(match old.value {
            Some(_) => PatchOperation::Replace(ReplaceOperation {
                path: value_path,
                value: serde_json::to_value(&new.value)?,
            }),
            None => add(value_path, &new.value)?,
        });
    }
    append_operations(
        &format!("{path}/env"),
        before.env.as_deref(),
        after.env.as_deref(),
        operations,
    )
}

/// Adds the tail of `mutated` past the length of `original`, creating the list when
/// it was absent.
fn append_operations<T: Serialize>(
    path: &str,
    original: Option<&[T]>,
    mutated: Option<&[T]>,
    operations: &mut Vec<PatchOperation>,
) -> Result<(), serde_json::Error> {
    let mutated = mutated.unwrap_or_default();
    match original {
        None if !mutated.is_empty() => operations.push(add(path.to_string(), mutated)?),
        None => (),
        Some(original) => {
            for item in mutated.iter().skip(original.len()) {
                operations.push(add(format!("{path}/-"), item)?);
            }
        }
    }
    Ok(())
}

fn add<T: Serialize + ?Sized>(path: String, value: &T) -> Result<PatchOperation, serde_json::Error> {
    Ok(PatchOperation::Add(AddOperation {
        path,
        value: serde_json::to_value(value)?,
    }))
}

fn add_python_env(spec: &mut PodSpec, family: Family) {
    let bundle = family.layout().bundle_path();
    for container in &mut spec.containers {
        let env = container.env.get_or_insert_with(Vec::new);
        for name in [REQUESTS_CA_BUNDLE, SSL_CERT_FILE] {
            env.push(EnvVar {
                name: name.to_string(),
                value: Some(bundle.clone()),
                ..Default::default()
            });
        }
    }
}

fn secret_projection(secret_name: &str, key: &str, path: String) -> VolumeProjection {
    VolumeProjection {
        secret: Some(SecretProjection {
            name: Some(secret_name.to_string()),
            items: Some(vec![KeyToPath {
                key: key.to_string(),
                path,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn push_mount(container: &mut Container, mount: VolumeMount) {
    container.volume_mounts.get_or_insert_with(Vec::new).push(mount);
}

fn has_volume(spec: &PodSpec, name: &str) -> bool {
    spec.volumes.iter().flatten().any(|x| x.name == name)
}
