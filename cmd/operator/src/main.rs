use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use kaniop_k8s_util::client::new_client_with_metrics;
use kaniop_operator::controller::State;
use kaniop_operator::crd::echo::Echo;
use kaniop_operator::reconcile::{Reconciler, ReconcilerConfig};
use kaniop_operator::resource::{
    AutoscalerClient, DeploymentClient, IngressClient, JobClient, ResourceClient, ServiceClient,
};
use kaniop_operator::telemetry;
use kaniop_operator::{crd, echo};

use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::Config;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    match c.metrics() {
        Ok(metrics) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(metrics),
        Err(e) => {
            tracing::error!("Failed to get metrics: {:?}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[derive(Parser, Debug)]
#[command(
    name="kaniop-operator",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Namespace the periodic reconciliation sweep lists sub-resources in.
    #[arg(short, long, default_value = "default", env)]
    namespace: String,

    /// Interval, in seconds, between periodic reconciliation sweeps.
    #[arg(long, default_value_t = 30, env)]
    reconcile_interval_secs: u64,

    /// Directory containing the `.hbs` manifest templates for owned sub-resources.
    #[arg(long, default_value = "templates", env)]
    templates_dir: PathBuf,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,kaniop_operator=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    ///
    /// Specifies the ratio of traces to sample. A value of `1.0` will sample all traces,
    /// while a lower value will sample fewer traces. The default is `0.1`, meaning 10%
    /// of traces are sampled.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let mut registry = Registry::with_prefix("kaniop_operator");
    let config = Config::infer().await?;
    let client = new_client_with_metrics(config, &mut registry).await?;

    crd::install::<Echo>(client.clone()).await?;

    let controllers = [echo::controller::CONTROLLER_ID];
    let state = State::new(registry, &controllers);

    let event_driven = echo::controller::run(state.clone(), client.clone(), args.templates_dir.clone());

    let mut resource_clients: std::collections::HashMap<&'static str, Arc<dyn ResourceClient>> =
        std::collections::HashMap::new();
    resource_clients.insert(
        "deployments",
        Arc::new(DeploymentClient::new(
            client.clone(),
            args.templates_dir.join("deployment.hbs"),
        )),
    );
    resource_clients.insert(
        "services",
        Arc::new(ServiceClient::new(
            client.clone(),
            args.templates_dir.join("service.hbs"),
        )),
    );
    resource_clients.insert(
        "ingresses",
        Arc::new(IngressClient::new(
            client.clone(),
            args.templates_dir.join("ingress.hbs"),
        )),
    );
    resource_clients.insert(
        "horizontalpodautoscalers",
        Arc::new(AutoscalerClient::new(
            client.clone(),
            args.templates_dir.join("autoscaler.hbs"),
        )),
    );
    resource_clients.insert(
        "jobs",
        Arc::new(JobClient::new(client.clone(), args.templates_dir.join("job.hbs"))),
    );

    let reconciler = Reconciler::<Echo>::new(
        client.clone(),
        ReconcilerConfig {
            namespace: args.namespace,
            owner_kind: "Echo",
            ephemeral_kinds: vec!["ingresses", "horizontalpodautoscalers"],
            non_ephemeral_kinds: vec!["deployments"],
            resource_clients,
            interval: Duration::from_secs(args.reconcile_interval_secs),
        },
    );
    let sweep_cancel = CancellationToken::new();
    let sweep_cancel_child = sweep_cancel.clone();
    let sweep = tokio::spawn(async move { reconciler.run(sweep_cancel_child).await });

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics)
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5);

    // Every runtime implements graceful shutdown, so poll until all are done.
    let server_result = tokio::select! {
        result = server.run() => result,
        _ = event_driven => Ok(()),
    };
    sweep_cancel.cancel();
    sweep.await?;
    server_result?;
    Ok(())
}
