//! `Hooks<Echo>` implementation: applies and tears down the `Deployment` an
//! `Echo` owns.
//!
//! Grounded in `cmd/stream-prediction-controller/hooks/hooks.go`'s
//! `Add`/`Delete`: on apply, create (or patch) the owned sub-resource and
//! report success or failure back onto `status`; on cleanup, delete it and
//! let the finalizer combinator remove the finalizer once this returns `Ok`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tokio::time::Duration;
use tracing::info;

use crate::controller::{Context, Hooks};
use crate::crd::echo::{echo_fsm, Echo, EchoCondition, EchoStatus, ECHO_STATE_PENDING, ECHO_STATE_RUNNING};
use crate::crd::CustomResourceState;
use crate::error::{Error, Result};

pub const ECHO_FINALIZER: &str = "echo.example.com";

const DEPLOYED_REASON: &str = "Deployed sub-resources";
const FAILED_REASON: &str = "Failed to deploy sub-resources";

/// Builds the `Deployment` manifest for `name` with `replicas` pods of the
/// `inanimate/echo-server:latest` image.
fn build_deployment(name: &str, namespace: &str, replicas: i32) -> Deployment {
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), name.to_string());
    labels.insert("app.kubernetes.io/managed-by".to_string(), "kaniop".to_string());

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_string(),
                        image: Some("inanimate/echo-server:latest".to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: 8080,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn patch_status(api: &Api<Echo>, name: &str, status: EchoStatus) -> Result<Echo> {
    let patch = serde_json::json!({ "status": status });
    Ok(api
        .patch_status(
            name,
            &PatchParams::apply("kaniop").force(),
            &Patch::Merge(&patch),
        )
        .await?)
}

/// Wires `Echo` into the generic controller: applies create/update the owned
/// `Deployment`, updates `status`; cleanup deletes it.
pub struct EchoHooks {
    templates_dir: PathBuf,
}

impl EchoHooks {
    pub fn new(templates_dir: PathBuf) -> Self {
        Self { templates_dir }
    }
}

impl Default for EchoHooks {
    fn default() -> Self {
        Self::new(PathBuf::from("templates"))
    }
}

#[async_trait]
impl Hooks<Echo> for EchoHooks {
    async fn apply(&self, echo: Arc<Echo>, ctx: Arc<Context<Echo>>) -> Result<Action> {
        let client: Client = ctx.client.clone();
        let namespace = echo.namespace().ok_or_else(|| {
            Error::UserInputError(
                "expected Echo resource to be namespaced, got cluster-scoped object".to_string(),
            )
        })?;
        let name = echo.name_any();
        let _ = &self.templates_dir;

        info!(%name, %namespace, "reconciling Echo");

        let current_state = echo
            .status_state()
            .unwrap_or_else(|| ECHO_STATE_PENDING.to_string());
        let target_state = echo
            .spec_state()
            .unwrap_or_else(|| ECHO_STATE_RUNNING.to_string());
        if current_state != target_state {
            let fsm = echo_fsm();
            if !fsm.valid_transition(&current_state, &target_state)? {
                info!(
                    %name, %namespace, from = %current_state, to = %target_state,
                    "rejecting invalid state transition, no-op"
                );
                return Ok(Action::await_change());
            }
        }

        let deployment_api: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
        let deployment = build_deployment(&name, &namespace, echo.spec.replicas);

        let echo_api: Api<Echo> = Api::namespaced(client, &namespace);
        let result = deployment_api
            .patch(
                &name,
                &PatchParams::apply("kaniop").force(),
                &Patch::Apply(&deployment),
            )
            .await;

        let status = match result {
            Ok(deployment) => EchoStatus {
                replicas: deployment.spec.and_then(|s| s.replicas),
                state: Some(crate::crd::echo::ECHO_STATE_RUNNING.to_string()),
                reason: Some(DEPLOYED_REASON.to_string()),
                conditions: vec![EchoCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    reason: Some(DEPLOYED_REASON.to_string()),
                    message: None,
                }],
            },
            Err(e) => {
                patch_status(
                    &echo_api,
                    &name,
                    EchoStatus {
                        replicas: None,
                        state: Some(crate::crd::echo::ECHO_STATE_FAILED.to_string()),
                        reason: Some(FAILED_REASON.to_string()),
                        conditions: vec![EchoCondition {
                            type_: "Ready".to_string(),
                            status: "False".to_string(),
                            reason: Some(FAILED_REASON.to_string()),
                            message: None,
                        }],
                    },
                )
                .await?;
                return Err(e.into());
            }
        };

        patch_status(&echo_api, &name, status).await?;
        Ok(Action::requeue(Duration::from_secs(10)))
    }

    async fn cleanup(&self, echo: Arc<Echo>, ctx: Arc<Context<Echo>>) -> Result<Action> {
        let client = ctx.client.clone();
        let namespace = echo.namespace().ok_or_else(|| {
            Error::UserInputError(
                "expected Echo resource to be namespaced, got cluster-scoped object".to_string(),
            )
        })?;
        let name = echo.name_any();

        let deployment_api: Api<Deployment> = Api::namespaced(client, &namespace);
        match deployment_api.delete(&name, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Action::await_change())
    }
}

/// Reconcile entry point wired into `Controller::new(...).run(...)`.
pub async fn reconcile_echo(echo: Arc<Echo>, ctx: Arc<Context<Echo>>) -> Result<Action> {
    crate::controller::reconcile(echo, ctx).await
}
