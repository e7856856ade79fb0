//! Generic, event-driven per-kind controller scaffolding.
//!
//! Generalizes the teacher operator's `Context`/`State`/`Diagnostics` trio
//! (originally hard-coded to the `Echo` kind) over any custom resource kind
//! `R`, so each concrete controller (`echo::controller`, and any future kind)
//! only has to supply a [`Hooks<R>`] implementation and wire up its own
//! watches. Finalizer handling is delegated to `kube::runtime::finalizer`,
//! the same combinator the upstream `kube-rs` controller example uses.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::events::Reporter;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::Resource;
use prometheus_client::registry::Registry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{field, instrument, Span};

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::telemetry;

/// Stable identifier for a controller, used as a metrics/diagnostics key.
pub type ControllerId = &'static str;

/// The two high-level actions every kind's [`Hooks`] must implement: bring
/// sub-resources in line with spec, or tear them down before the finalizer is
/// released. Mirrors `StreamPredictionHooks.Add`/`.Delete` in the Go
/// reconciler's hooks package, adapted to `kube-rs`'s finalizer combinator.
#[async_trait]
pub trait Hooks<R>: Send + Sync
where
    R: Resource + Send + Sync,
{
    /// Called on create/update while no deletion timestamp is set.
    async fn apply(&self, cr: Arc<R>, ctx: Arc<Context<R>>) -> Result<Action>;

    /// Called once, after a deletion timestamp appears, before the finalizer
    /// is removed.
    async fn cleanup(&self, cr: Arc<R>, ctx: Arc<Context<R>>) -> Result<Action>;
}

/// Context injected into every `reconcile` invocation for kind `R`.
pub struct Context<R> {
    pub client: Client,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub metrics: Arc<Metrics>,
    pub hooks: Arc<dyn Hooks<R>>,
    pub finalizer_name: String,
}

/// Diagnostics exposed by the web server for a single controller.
#[derive(Clone, serde::Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Diagnostics {
    pub fn new(controller_id: ControllerId) -> Self {
        Self {
            last_event: Utc::now(),
            reporter: controller_id.into(),
        }
    }
}

/// State shared between every controller and the web server.
#[derive(Clone)]
pub struct State {
    diagnostics: HashMap<ControllerId, Arc<RwLock<Diagnostics>>>,
    metrics: Arc<Metrics>,
    registry: Arc<Registry>,
}

impl State {
    pub fn new(mut registry: Registry, controllers: &[ControllerId]) -> Self {
        let metrics = Arc::new(Metrics::new(&mut registry));
        let diagnostics = controllers
            .iter()
            .map(|id| (*id, Arc::new(RwLock::new(Diagnostics::new(id)))))
            .collect();
        Self {
            diagnostics,
            metrics,
            registry: Arc::new(registry),
        }
    }

    pub fn metrics(&self) -> std::result::Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    pub async fn diagnostics(&self, controller_id: ControllerId) -> Option<Diagnostics> {
        match self.diagnostics.get(controller_id) {
            Some(d) => Some(d.read().await.clone()),
            None => None,
        }
    }

    /// Builds a `Context<R>` for `controller_id`, wiring `hooks` in and
    /// sharing this `State`'s metrics and diagnostics slot, so the web
    /// server sees live updates written by `reconcile`.
    pub fn to_context<R>(
        &self,
        client: Client,
        controller_id: ControllerId,
        hooks: Arc<dyn Hooks<R>>,
        finalizer_name: impl Into<String>,
    ) -> Arc<Context<R>> {
        let diagnostics = self
            .diagnostics
            .get(controller_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(RwLock::new(Diagnostics::new(controller_id))));
        Arc::new(Context {
            client,
            diagnostics,
            metrics: self.metrics.clone(),
            hooks,
            finalizer_name: finalizer_name.into(),
        })
    }

    pub fn metrics_handle(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }
}

/// Generic `reconcile` function every concrete controller's
/// `Controller::new(...).run(reconcile::<R>, error_policy::<R>, ctx)` uses.
/// Applies the finalizer, then dispatches to the kind's [`Hooks`].
#[instrument(skip(cr, ctx), fields(trace_id))]
pub async fn reconcile<R>(cr: Arc<R>, ctx: Arc<Context<R>>) -> Result<Action>
where
    R: Resource<DynamicType = ()>
        + Clone
        + ResourceExt
        + DeserializeOwned
        + Serialize
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));

    let _timer = ctx.metrics.reconcile.count_and_measure(&trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = cr.namespace().ok_or_else(|| {
        Error::UserInputError(
            "expected namespaced custom resource, got cluster-scoped object".to_string(),
        )
    })?;
    let api: Api<R> = Api::namespaced(ctx.client.clone(), &namespace);

    let hooks = ctx.hooks.clone();
    let inner_ctx = ctx.clone();
    finalizer(&api, &ctx.finalizer_name, cr, |event| async move {
        match event {
            FinalizerEvent::Apply(cr) => hooks.apply(cr, inner_ctx).await,
            FinalizerEvent::Cleanup(cr) => hooks.cleanup(cr, inner_ctx).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

/// Generic `error_policy` every concrete controller's `.run(...)` uses.
pub fn error_policy<R>(cr: Arc<R>, error: &Error, ctx: Arc<Context<R>>) -> Action
where
    R: ResourceExt,
{
    tracing::warn!(
        namespace = ?cr.namespace(),
        name = %cr.name_any(),
        %error,
        "reconcile failed"
    );
    ctx.metrics.reconcile.set_failure(&cr, error);
    Action::requeue(std::time::Duration::from_secs(5 * 60))
}
