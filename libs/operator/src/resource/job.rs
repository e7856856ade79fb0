use std::path::PathBuf;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;

use crate::error::Result;
use crate::resource::{client_for, reify, ResourceClient, TemplateValues};

/// Non-ephemeral, never reports failed. Grounded in `pkg/resource/job_client.go`.
pub struct JobClient {
    client: Client,
    resource: ApiResource,
    template_path: PathBuf,
}

impl JobClient {
    pub fn new(client: Client, template_path: PathBuf) -> Self {
        let gvk = GroupVersionKind::gvk("batch", "v1", "Job");
        Self {
            client,
            resource: ApiResource::from_gvk(&gvk),
            template_path,
        }
    }
}

#[async_trait]
impl ResourceClient for JobClient {
    fn plural(&self) -> &'static str {
        "jobs"
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

    async fn is_failed(&self, _object: &DynamicObject) -> Result<bool> {
        Ok(false)
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        client_for(self.client.clone(), &self.resource, namespace)
    }
}
