//! Custom resource definition bootstrap, typed access and schema validation.
//!
//! Grounded in the Go reconciler's `pkg/crd` package: a `Handle` describes
//! the GVK and is used to install the `CustomResourceDefinition` and wait for
//! it to become queryable, while a `Client` wraps typed CRUD and optional
//! JSON-schema validation of the object's spec.

pub mod echo;

use std::time::Duration;

use jsonschema::JSONSchema;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client, CustomResourceExt, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Poll interval while waiting for a freshly-applied CRD to become `Established`.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Give up waiting for `Established` after this long.
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(60);

/// Behaviour every custom resource managed by the reconciler must expose:
/// its reconciliation status state machine value, and the hooks needed to
/// move it through that machine.
pub trait CustomResourceState {
    /// The `status.state` field, if the object has been reconciled at least once.
    fn status_state(&self) -> Option<String>;

    /// The `spec.state` field, when the CRD models a desired end-state in spec
    /// (most resources don't; the default implementation returns `None`).
    fn spec_state(&self) -> Option<String> {
        None
    }

    /// Updates `status.state` and a human-readable message describing why.
    fn set_status_state_with_message(&mut self, state: &str, message: &str);

    /// Spec fields this resource exposes to its owned sub-resources' manifest
    /// templates (e.g. `replicas`), merged into [`crate::resource::TemplateValues`]
    /// before a sweep creates them. Mirrors the Go reconciler passing the whole
    /// custom resource as `Reify`'s template value; since Rust has no runtime
    /// reflection, each kind opts its own spec fields in explicitly instead.
    fn template_values(&self) -> std::collections::BTreeMap<String, serde_json::Value> {
        std::collections::BTreeMap::new()
    }

    /// The state name used to mark a resource as failed to reconcile.
    fn error_state() -> &'static str;

    /// True if `spec_state()` names a state with no further valid transitions.
    fn is_spec_terminal(&self) -> bool {
        false
    }

    /// True if `status_state()` names a state with no further valid transitions.
    fn is_status_terminal(&self) -> bool;
}

/// Installs (or updates) a `CustomResourceDefinition` for `R` and waits for
/// the API server to report it `Established`, mirroring `WriteDefinition` in
/// the Go reconciler. If establishment doesn't happen in time, the CRD is
/// deleted again before returning, mirroring `WriteDefinition`'s
/// cleanup-on-failure via `DeleteDefinition`.
pub async fn install<R>(client: Client) -> Result<()>
where
    R: CustomResourceExt,
{
    let crd = R::crd();
    let name = crd.name_any();
    let api: Api<CustomResourceDefinition> = Api::all(client);

    api.patch(
        &name,
        &PatchParams::apply("kaniop").force(),
        &Patch::Apply(&crd),
    )
    .await?;

    let establish = await_condition(api.clone(), &name, conditions::is_crd_established());
    let established = tokio::time::timeout(ESTABLISH_TIMEOUT, establish).await;

    match established {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(source)) => {
            let _ = api.delete(&name, &Default::default()).await;
            Err(Error::KubeError { source })
        }
        Err(_) => {
            let _ = api.delete(&name, &Default::default()).await;
            Err(Error::CrdNotEstablished(name))
        }
    }
}

/// Like [`install`] but polls manually instead of relying on `watch` support,
/// useful against API servers that don't support it for CRDs (e.g. some test
/// harnesses). Kept close to the polling loop in the Go `WriteDefinition`.
pub async fn install_polling<R>(client: Client) -> Result<()>
where
    R: CustomResourceExt,
{
    let crd = R::crd();
    let name = crd.name_any();
    let api: Api<CustomResourceDefinition> = Api::all(client);

    api.patch(
        &name,
        &PatchParams::apply("kaniop").force(),
        &Patch::Apply(&crd),
    )
    .await?;

    let deadline = tokio::time::Instant::now() + ESTABLISH_TIMEOUT;
    loop {
        let current = api.get(&name).await?;
        let established = current
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Established" && c.status == "True")
            })
            .unwrap_or(false);
        if established {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::CrdNotEstablished(name));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Validates `spec` against a compiled JSON schema, aggregating every
/// violation into a single error the way the Go client's `Validate` collects
/// `gojsonschema` results.
pub fn validate_against_schema<S>(spec: &S, schema: &serde_json::Value) -> Result<()>
where
    S: Serialize,
{
    let compiled = JSONSchema::compile(schema)
        .map_err(|e| Error::ValidationError(format!("invalid schema: {e}")))?;
    let instance = serde_json::to_value(spec)
        .map_err(|e| Error::ValidationError(format!("could not serialize spec: {e}")))?;

    if let Err(errors) = compiled.validate(&instance) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(Error::ValidationError(messages.join("\n")));
    }
    Ok(())
}

/// Typed CRUD access to a custom resource kind, generalizing the calls
/// `reconcile.rs` needs without binding it to any one kind. An optional JSON
/// schema, when configured, gates `create`/`update` the way the Go client's
/// `Create`/`Update` call `Validate` whenever `Handle.SchemaURL != ""`.
pub struct CrdClient<R> {
    api: Api<R>,
    schema: Option<serde_json::Value>,
}

impl<R> CrdClient<R>
where
    R: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            schema: None,
        }
    }

    /// Configures the JSON schema `create`/`update`/`validate` check against.
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub async fn get(&self, name: &str) -> Result<R> {
        Ok(self.api.get(name).await?)
    }

    pub async fn list_all(&self) -> Result<Vec<R>> {
        Ok(self.api.list(&Default::default()).await?.items)
    }

    pub async fn create(&self, obj: &R) -> Result<R> {
        if let Some(schema) = &self.schema {
            validate_against_schema(obj, schema)?;
        }
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    pub async fn update(&self, name: &str, obj: &R) -> Result<R> {
        if let Some(schema) = &self.schema {
            validate_against_schema(obj, schema)?;
        }
        Ok(self
            .api
            .patch(
                name,
                &PatchParams::apply("kaniop").force(),
                &Patch::Apply(obj),
            )
            .await?)
    }

    /// Validates `obj` against the configured schema. Fails with a
    /// descriptive error if no schema is configured, mirroring the Go
    /// client's `Validate` called without `SchemaURL` set.
    pub fn validate(&self, obj: &R) -> Result<()> {
        match &self.schema {
            Some(schema) => validate_against_schema(obj, schema),
            None => Err(Error::ValidationError(
                "validate called without a schema configured".to_string(),
            )),
        }
    }

    /// Deletes the named object, ignoring a 404 (already gone) so
    /// delete-then-delete stays idempotent.
    pub async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(source) => Err(source.into()),
        }
    }
}
