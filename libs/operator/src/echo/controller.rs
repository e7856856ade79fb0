use crate::controller::{error_policy, reconcile, Context, ControllerId, Hooks, State};
use crate::crd::echo::Echo;
use crate::echo::reconcile::{EchoHooks, ECHO_FINALIZER};
use crate::metrics::WatchAction;

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::{self, ReflectHandle};
use kube::runtime::{watcher, WatchStreamExt};
use tokio::time::Duration;
use tracing::{debug, error, info};

pub const CONTROLLER_ID: ControllerId = "echo";

const SUBSCRIBE_BUFFER_SIZE: usize = 256;
const RELOAD_BUFFER_SIZE: usize = 16;

/// Initializes the `Echo` controller and its shared state (the CRD must
/// already be installed, see [`crate::crd::install`]).
pub async fn run(state: State, client: Client, templates_dir: PathBuf) {
    let echo = Api::<Echo>::all(client.clone());
    if let Err(e) = echo.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let (_deployment_store, writer) = reflector::store_shared(SUBSCRIBE_BUFFER_SIZE);
    let subscriber: ReflectHandle<Deployment> = writer
        .subscribe()
        // safe unwrap: writer is created from a shared store.
        .expect("subscribers can only be created from shared stores");

    let (reload_tx, reload_rx) = futures::channel::mpsc::channel(RELOAD_BUFFER_SIZE);
    let deployment = Api::<Deployment>::all(client.clone());

    let hooks: Arc<dyn Hooks<Echo>> = Arc::new(EchoHooks::new(templates_dir));
    let ctx = state.to_context(client, CONTROLLER_ID, hooks, ECHO_FINALIZER);

    let deployment_watch = watcher(
        deployment,
        watcher::Config::default().labels("app.kubernetes.io/managed-by=kaniop"),
    )
    .default_backoff()
    .reflect_shared(writer)
    .for_each(|res| {
        let mut reload_tx_clone = reload_tx.clone();
        let ctx = ctx.clone();
        async move {
            match res {
                Ok(event) => match event {
                    watcher::Event::Delete(d) => {
                        debug!(
                            msg = "deleted deployment",
                            namespace = ?d.namespace(),
                            name = d.name_any()
                        );
                        let _ignore_errors = reload_tx_clone
                            .try_send(())
                            .map_err(|e| error!(msg = "failed to trigger reconcile on delete", %e));
                        ctx.metrics.triggered_inc(WatchAction::Delete, "Deployment");
                    }
                    watcher::Event::Apply(d) => {
                        debug!(
                            msg = "applied deployment",
                            namespace = ?d.namespace(),
                            name = d.name_any()
                        );
                        ctx.metrics.triggered_inc(WatchAction::Apply, "Deployment");
                    }
                    _ => {}
                },
                Err(e) => {
                    error!(msg = "unexpected error when watching resource", %e);
                    ctx.metrics.watch_operations_failed_inc();
                }
            }
        }
    });

    info!(msg = "starting echo controller");
    let echo_controller = Controller::new(echo, watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .owns_shared_stream(subscriber)
        .reconcile_all_on(reload_rx.map(|_| ()))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(1);
    tokio::select! {
        _ = echo_controller => {},
        _ = deployment_watch => {}
    }
}
