use std::path::PathBuf;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;

use crate::error::Result;
use crate::resource::{client_for, reify, ResourceClient, TemplateValues};

/// Non-ephemeral: a missing `Deployment` is a reconciliation failure, not
/// something to silently recreate. Grounded in `pkg/resource/deployment_client.go`.
pub struct DeploymentClient {
    client: Client,
    resource: ApiResource,
    template_path: PathBuf,
}

impl DeploymentClient {
    pub fn new(client: Client, template_path: PathBuf) -> Self {
        let gvk = GroupVersionKind::gvk("apps", "v1", "Deployment");
        Self {
            client,
            resource: ApiResource::from_gvk(&gvk),
            template_path,
        }
    }
}

#[async_trait]
impl ResourceClient for DeploymentClient {
    fn plural(&self) -> &'static str {
        "deployments"
    }

    fn is_ephemeral(&self) -> bool {
        false
    }

    fn template_path(&self) -> &std::path::Path {
        &self.template_path
    }

    async fn reify(&self, values: &TemplateValues) -> Result<DynamicObject> {
        let json = reify(&self.template_path, values).await?;
        Ok(
            serde_json::from_value(json).map_err(|source| crate::error::Error::ReifyError {
                template: self.template_path.display().to_string(),
                source: crate::error::ReifyError::Json(source),
            })?,
        )
    }

    async fn is_failed(&self, object: &DynamicObject) -> Result<bool> {
        let conditions = object
            .data
            .get("status")
            .and_then(|s| s.get("conditions"))
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();

        let latest = conditions.iter().max_by_key(|c| {
            c.get("lastUpdateTime")
                .and_then(|t| t.as_str())
                .map(|t| t.to_string())
                .unwrap_or_default()
        });

        Ok(latest
            .and_then(|c| c.get("type"))
            .and_then(|t| t.as_str())
            .map(|t| t == "ReplicaFailure")
            .unwrap_or(false))
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        client_for(self.client.clone(), &self.resource, namespace)
    }
}
