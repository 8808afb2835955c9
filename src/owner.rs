//! Resolution of a Pod to the workload object that ultimately controls it.
//!
//! A Pod created by a Deployment only carries a generated name, its owner is a
//! ReplicaSet whose owner is the Deployment. Resources provisioned for the Pod are
//! named after, and owned by, the top of that chain so that every replica shares them
//! and they are garbage collected together with the workload.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ObjectMeta;
use log::debug;

use crate::store::ClusterStore;

/// Real hierarchies are at most CronJob -> Job -> Pod or Deployment -> ReplicaSet -> Pod.
pub const MAX_OWNER_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    Deployment,
    StatefulSet,
    ReplicaSet,
    DaemonSet,
    CronJob,
    Job,
}

impl ControllerKind {
    pub fn from_kind(kind: &str) -> Option<Self> {
        Some(match kind {
            "Deployment" => ControllerKind::Deployment,
            "StatefulSet" => ControllerKind::StatefulSet,
            "ReplicaSet" => ControllerKind::ReplicaSet,
            "DaemonSet" => ControllerKind::DaemonSet,
            "CronJob" => ControllerKind::CronJob,
            "Job" => ControllerKind::Job,
            _ => return None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no root object found")]
    NoRootObject,
    #[error("owner chain exceeds {MAX_OWNER_DEPTH} levels")]
    TooDeep,
    #[error("getting {kind:?} '{name}': {source}")]
    Fetch {
        kind: ControllerKind,
        name: String,
        source: kube::Error,
    },
}

/// The top of an owner chain and the reference that led to it.
#[derive(Debug, Clone)]
pub struct RootObject {
    pub meta: ObjectMeta,
    /// `None` when the starting object has no owners.
    pub owner_ref: Option<OwnerReference>,
}

impl RootObject {
    pub fn name(&self) -> &str {
        self.meta.name.as_deref().unwrap_or_default()
    }

    /// Owner reference suitable for resources that should be collected with the root.
    pub fn controller_ref(&self) -> Option<OwnerReference> {
        self.owner_ref.clone().filter(|x| !x.uid.is_empty())
    }
}

/// Walks controller references upwards until an object without owners is reached.
///
/// Owner references are scanned in order and the first one of a known controller kind
/// is followed. An object whose owners are all of unknown kinds has no resolvable root.
pub async fn resolve_root(
    store: &dyn ClusterStore,
    object: &ObjectMeta,
    namespace: &str,
) -> Result<RootObject, ResolveError> {
    let mut current = object.clone();
    let mut owner_ref = None;

    for _ in 0..MAX_OWNER_DEPTH {
        let owners = current.owner_references.as_deref().unwrap_or_default();
        if owners.is_empty() {
            return Ok(RootObject {
                meta: current,
                owner_ref,
            });
        }

        let Some((kind, next_ref)) = owners
            .iter()
            .find_map(|x| ControllerKind::from_kind(&x.kind).map(|kind| (kind, x.clone())))
        else {
            return Err(ResolveError::NoRootObject);
        };

        debug!("following owner {:?} {}/{}", kind, namespace, next_ref.name);
        current = store
            .get_controller(kind, namespace, &next_ref.name)
            .await
            .map_err(|source| ResolveError::Fetch {
                kind,
                name: next_ref.name.clone(),
                source,
            })?;
        owner_ref = Some(next_ref);
    }

    Err(ResolveError::TooDeep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::{api_error, FakeStore};

    fn owner(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("{name}-uid"),
            controller: Some(true),
            ..Default::default()
        }
    }

    fn meta(name: &str, owners: Vec<OwnerReference>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            owner_references: if owners.is_empty() { None } else { Some(owners) },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ownerless_is_root() {
        let store = FakeStore::default();
        let root = resolve_root(&store, &meta("pod", vec![]), "default")
            .await
            .unwrap();
        assert_eq!(root.name(), "pod");
        assert!(root.owner_ref.is_none());
        assert!(root.controller_ref().is_none());
    }

    #[tokio::test]
    async fn test_deployment_chain() {
        let store = FakeStore::default();
        store
            .add_controller(ControllerKind::Deployment, "default", meta("test-dep", vec![]))
            .await;
        store
            .add_controller(
                ControllerKind::ReplicaSet,
                "default",
                meta("test-dep-abc", vec![owner("Deployment", "test-dep")]),
            )
            .await;

        let pod = meta("test-dep-abc-xyz", vec![owner("ReplicaSet", "test-dep-abc")]);
        let root = resolve_root(&store, &pod, "default").await.unwrap();
        assert_eq!(root.name(), "test-dep");
        let edge = root.controller_ref().unwrap();
        assert_eq!(edge.kind, "Deployment");
        assert_eq!(edge.name, "test-dep");
    }

    #[tokio::test]
    async fn test_skips_unknown_kinds() {
        let store = FakeStore::default();
        store
            .add_controller(ControllerKind::Job, "default", meta("job", vec![]))
            .await;
        let pod = meta("pod", vec![owner("Node", "worker-1"), owner("Job", "job")]);
        let root = resolve_root(&store, &pod, "default").await.unwrap();
        assert_eq!(root.name(), "job");
    }

    #[tokio::test]
    async fn test_unknown_owner_has_no_root() {
        let store = FakeStore::default();
        let pod = meta("pod", vec![owner("Rollout", "argo")]);
        assert!(matches!(
            resolve_root(&store, &pod, "default").await,
            Err(ResolveError::NoRootObject)
        ));
    }

    #[tokio::test]
    async fn test_fetch_error_propagates() {
        let store = FakeStore::default();
        *store.fail_with.lock().await = Some(api_error(403, "Forbidden", "denied"));
        let pod = meta("pod", vec![owner("StatefulSet", "db")]);
        match resolve_root(&store, &pod, "default").await {
            Err(ResolveError::Fetch { kind, name, .. }) => {
                assert_eq!(kind, ControllerKind::StatefulSet);
                assert_eq!(name, "db");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cyclic_chain_is_bounded() {
        let store = FakeStore::default();
        store
            .add_controller(
                ControllerKind::ReplicaSet,
                "default",
                meta("a", vec![owner("ReplicaSet", "b")]),
            )
            .await;
        store
            .add_controller(
                ControllerKind::ReplicaSet,
                "default",
                meta("b", vec![owner("ReplicaSet", "a")]),
            )
            .await;
        let pod = meta("pod", vec![owner("ReplicaSet", "a")]);
        assert!(matches!(
            resolve_root(&store, &pod, "default").await,
            Err(ResolveError::TooDeep)
        ));
    }
}
