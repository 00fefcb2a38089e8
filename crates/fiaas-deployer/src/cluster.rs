//! Typed CRUD access to the derived cluster objects
//!
//! [`ClusterClient`] is the only way the reconciler touches the cluster, so
//! tests can substitute an in-memory implementation.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use fiaas_common::{Error, Result, FIELD_MANAGER};

use crate::object::{ManagedObject, ObjectKind};

/// get / create / replace / delete over the managed kinds.
///
/// `replace` must fail with [`Error::Conflict`] when the object's
/// resourceVersion is stale.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Read an object by name; None when it does not exist
    async fn get(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<Option<ManagedObject>>;

    /// Create an object that does not exist yet
    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject>;

    /// Replace an existing object, guarded by its resourceVersion
    async fn replace(&self, object: &ManagedObject) -> Result<ManagedObject>;

    /// Delete an object; false when it did not exist
    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<bool>;
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_as<K>(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube_for_object(kind.as_str(), name, e))
    }

    async fn create_as<K>(&self, kind: ObjectKind, object: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let meta = object.meta();
        let name = meta.name.clone().unwrap_or_default();
        let namespace = meta.namespace.clone().unwrap_or_default();
        self.api::<K>(&namespace)
            .create(&post_params(), object)
            .await
            .map_err(|e| Error::from_kube_for_object(kind.as_str(), name, e))
    }

    async fn replace_as<K>(&self, kind: ObjectKind, object: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let meta = object.meta();
        let name = meta.name.clone().unwrap_or_default();
        let namespace = meta.namespace.clone().unwrap_or_default();
        self.api::<K>(&namespace)
            .replace(&name, &post_params(), object)
            .await
            .map_err(|e| Error::from_kube_for_object(kind.as_str(), &name, e))
    }

    async fn delete_as<K>(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<bool>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(Error::from_kube_for_object(kind.as_str(), name, e)),
        }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<Option<ManagedObject>> {
        Ok(match kind {
            ObjectKind::Deployment => self
                .get_as::<Deployment>(kind, namespace, name)
                .await?
                .map(ManagedObject::Deployment),
            ObjectKind::Service => self
                .get_as::<Service>(kind, namespace, name)
                .await?
                .map(ManagedObject::Service),
            ObjectKind::Ingress => self
                .get_as::<Ingress>(kind, namespace, name)
                .await?
                .map(ManagedObject::Ingress),
            ObjectKind::Autoscaler => self
                .get_as::<HorizontalPodAutoscaler>(kind, namespace, name)
                .await?
                .map(ManagedObject::Autoscaler),
        })
    }

    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject> {
        let kind = object.kind();
        Ok(match object {
            ManagedObject::Deployment(o) => ManagedObject::Deployment(self.create_as(kind, o).await?),
            ManagedObject::Service(o) => ManagedObject::Service(self.create_as(kind, o).await?),
            ManagedObject::Ingress(o) => ManagedObject::Ingress(self.create_as(kind, o).await?),
            ManagedObject::Autoscaler(o) => ManagedObject::Autoscaler(self.create_as(kind, o).await?),
        })
    }

    async fn replace(&self, object: &ManagedObject) -> Result<ManagedObject> {
        let kind = object.kind();
        Ok(match object {
            ManagedObject::Deployment(o) => ManagedObject::Deployment(self.replace_as(kind, o).await?),
            ManagedObject::Service(o) => ManagedObject::Service(self.replace_as(kind, o).await?),
            ManagedObject::Ingress(o) => ManagedObject::Ingress(self.replace_as(kind, o).await?),
            ManagedObject::Autoscaler(o) => ManagedObject::Autoscaler(self.replace_as(kind, o).await?),
        })
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<bool> {
        match kind {
            ObjectKind::Deployment => self.delete_as::<Deployment>(kind, namespace, name).await,
            ObjectKind::Service => self.delete_as::<Service>(kind, namespace, name).await,
            ObjectKind::Ingress => self.delete_as::<Ingress>(kind, namespace, name).await,
            ObjectKind::Autoscaler => {
                self.delete_as::<HorizontalPodAutoscaler>(kind, namespace, name)
                    .await
            }
        }
    }
}
