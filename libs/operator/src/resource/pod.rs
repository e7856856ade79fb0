use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;

use crate::error::{Error, Result};
use crate::resource::{client_for, ResourceClient, TemplateValues};

/// Read-only: `Pod`s are owned transitively through a `Deployment`'s
/// `ReplicaSet`, never templated or created directly by the reconciler. Kept
/// as a distinct [`ResourceClient`] purely so `list_owned` can be used to
/// inspect pod phase when diagnosing a `Deployment`, the way the Go
/// reconciler's `hpaClient.GetStatusState` comment flags as a possible future
/// widening that was never implemented.
pub struct PodClient {
    client: Client,
    resource: ApiResource,
    template_path: PathBuf,
}

impl PodClient {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("", "v1", "Pod");
        Self {
            client,
            resource: ApiResource::from_gvk(&gvk),
            template_path: PathBuf::new(),
        }
    }
}

#[async_trait]
impl ResourceClient for PodClient {
    fn plural(&self) -> &'static str {
        "pods"
    }

    fn is_ephemeral(&self) -> bool {
        true
    }

    fn template_path(&self) -> &Path {
        &self.template_path
    }

    async fn reify(&self, _values: &TemplateValues) -> Result<DynamicObject> {
        Err(Error::UserInputError(
            "pods are not directly managed by the reconciler".to_string(),
        ))
    }

    async fn create(
        &self,
        _namespace: &str,
        _object: DynamicObject,
        _owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    ) -> Result<DynamicObject> {
        Err(Error::UserInputError(
            "pods are not directly managed by the reconciler".to_string(),
        ))
    }

    async fn is_failed(&self, _object: &DynamicObject) -> Result<bool> {
        Ok(false)
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        client_for(self.client.clone(), &self.resource, namespace)
    }
}
