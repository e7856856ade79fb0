pub mod controller;
pub mod reconcile;

#[cfg(test)]
mod test {
    use crate::controller::{Context, Diagnostics};
    use crate::crd::echo::{Echo, EchoSpec, EchoStatus};
    use crate::echo::reconcile::{EchoHooks, ECHO_FINALIZER};
    use crate::error::Result;
    use crate::metrics::Metrics;

    use std::sync::Arc;

    use assert_json_diff::assert_json_include;
    use http::{Request, Response};
    use k8s_openapi::api::apps::v1::Deployment;
    use kube::{client::Body, Client, Resource, ResourceExt};
    use prometheus_client::registry::Registry;
    use serde_json::json;
    use tokio::sync::RwLock;

    impl Echo {
        /// A non-reconciled normal test echo.
        pub fn test() -> Self {
            let mut e = Echo::new("test", EchoSpec { replicas: 1 });
            e.meta_mut().namespace = Some("default".into());
            e
        }

        /// An echo that has already been reconciled once.
        pub fn test_with_status() -> Self {
            let mut e = Echo::new("test", EchoSpec { replicas: 1 });
            e.status = Some(EchoStatus {
                replicas: Some(1),
                ..EchoStatus::default()
            });
            e.meta_mut().namespace = Some("default".into());
            e
        }

        /// Changes the desired replica count.
        pub fn change_replicas(mut self, replicas: i32) -> Self {
            self.spec.replicas = replicas;
            self
        }

        /// Sets a deletion timestamp, as if `kubectl delete` had just run.
        pub fn needs_delete(mut self) -> Self {
            use chrono::prelude::{DateTime, TimeZone, Utc};
            let now: DateTime<Utc> = Utc.with_ymd_and_hms(2017, 4, 2, 12, 50, 32).unwrap();
            use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
            self.meta_mut().deletion_timestamp = Some(Time(now));
            self
        }

        /// Attaches the expected finalizer.
        pub fn finalized(mut self) -> Self {
            self.finalizers_mut().push(ECHO_FINALIZER.to_string());
            self
        }

        /// Attaches an expected status.
        pub fn with_status(mut self, status: EchoStatus) -> Self {
            self.status = Some(status);
            self
        }
    }

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
    pub struct ApiServerVerifier(ApiServerHandle);

    /// Scenarios exercised against the mocked API server.
    pub enum Scenario {
        /// objects without finalizers get a finalizer applied (and the apply loop isn't called)
        FinalizerCreation(Echo),
        /// objects not yet reconciled cause a create
        NonReconciledEchoCreate(Echo),
        /// object that is already reconciled
        NoOp(),
        /// a replica-count change causes a deployment patch then a status patch
        ChangeReplicasThenStatusPatch(Echo),
        /// object with a deletion timestamp runs the cleanup loop, then the finalizer is removed
        Cleanup(Echo),
    }

    pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    impl ApiServerVerifier {
        pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                match scenario {
                    Scenario::FinalizerCreation(echo) => self.handle_finalizer_creation(echo).await,
                    Scenario::NonReconciledEchoCreate(echo) => {
                        self.handle_echo_create(echo.clone())
                            .await
                            .unwrap()
                            .handle_status_patch(echo)
                            .await
                    }
                    Scenario::NoOp() => self.handle_do_nothing().await,
                    Scenario::ChangeReplicasThenStatusPatch(echo) => {
                        self.handle_echo_patch(echo.clone())
                            .await
                            .unwrap()
                            .handle_status_patch(echo)
                            .await
                    }
                    Scenario::Cleanup(echo) => {
                        self.handle_echo_delete(echo.clone())
                            .await
                            .unwrap()
                            .handle_finalizer_removal(echo)
                            .await
                    }
                }
                .expect("scenario completed without errors");
            })
        }

        async fn handle_finalizer_creation(mut self, echo: Echo) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/example.com/v1/namespaces/default/echoes/{}?",
                    echo.name_any()
                )
            );
            let expected_patch = json!([
                { "op": "test", "path": "/metadata/finalizers", "value": null },
                { "op": "add", "path": "/metadata/finalizers", "value": vec![ECHO_FINALIZER] }
            ]);
            let req_body = request.into_body().collect_bytes().await.unwrap();
            let runtime_patch: serde_json::Value =
                serde_json::from_slice(&req_body).expect("valid echo from runtime");
            assert_json_include!(actual: runtime_patch, expected: expected_patch);

            let response = serde_json::to_vec(&echo.finalized()).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn handle_finalizer_removal(mut self, echo: Echo) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/example.com/v1/namespaces/default/echoes/{}?",
                    echo.name_any()
                )
            );
            let expected_patch = json!([
                { "op": "test", "path": "/metadata/finalizers/0", "value": ECHO_FINALIZER },
                { "op": "remove", "path": "/metadata/finalizers/0" }
            ]);
            let req_body = request.into_body().collect_bytes().await.unwrap();
            let runtime_patch: serde_json::Value =
                serde_json::from_slice(&req_body).expect("valid echo from runtime");
            assert_json_include!(actual: runtime_patch, expected: expected_patch);

            let response = serde_json::to_vec(&echo).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn handle_do_nothing(self) -> Result<Self> {
            Ok(self)
        }

        async fn handle_echo_create(mut self, echo: Echo) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/apps/v1/namespaces/default/deployments/{}?&force=true&fieldManager=kaniop",
                    echo.name_any()
                )
            );

            let req_body = request.into_body().collect_bytes().await.unwrap();
            let json: serde_json::Value =
                serde_json::from_slice(&req_body).expect("patch object is json");
            let deployment: Deployment = serde_json::from_value(json).expect("valid deployment");
            assert_eq!(
                deployment.clone().spec.unwrap().replicas.unwrap(),
                echo.spec.replicas,
                "deployment replicas equal to echo spec replicas"
            );
            let response = serde_json::to_vec(&deployment).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn handle_echo_patch(mut self, echo: Echo) -> Result<Self> {
            self.handle_echo_create(echo).await
        }

        async fn handle_echo_delete(mut self, echo: Echo) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::DELETE);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/apps/v1/namespaces/default/deployments/{}?",
                    echo.name_any()
                )
            );
            let req_body = request.into_body().collect_bytes().await.unwrap();
            let json: serde_json::Value =
                serde_json::from_slice(&req_body).expect("delete object is json");
            let expected = json!({});
            assert_eq!(json, expected);
            let response = serde_json::to_vec(&json).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn handle_status_patch(mut self, echo: Echo) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/example.com/v1/namespaces/default/echoes/{}/status?&force=true&fieldManager=kaniop",
                    echo.name_any()
                )
            );
            let req_body = request.into_body().collect_bytes().await.unwrap();
            let json: serde_json::Value =
                serde_json::from_slice(&req_body).expect("patch_status object is json");
            let status_json = json.get("status").expect("status object").clone();
            let status: EchoStatus = serde_json::from_value(status_json).expect("valid status");
            assert_eq!(
                status.replicas.unwrap(),
                echo.spec.replicas,
                "status.replicas equal to echo spec replicas"
            );
            let response = serde_json::to_vec(&echo.with_status(status)).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }
    }

    impl Context<Echo> {
        /// A test context with a mocked kube client, locally registered metrics
        /// and default diagnostics.
        pub fn test() -> (Arc<Self>, ApiServerVerifier) {
            let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let mock_client = Client::new(mock_service, "default");
            let mut registry = Registry::default();
            let ctx = Self {
                client: mock_client,
                diagnostics: Arc::new(RwLock::new(Diagnostics::new("echo"))),
                metrics: Arc::new(Metrics::new(&mut registry)),
                hooks: Arc::new(EchoHooks::default()),
                finalizer_name: ECHO_FINALIZER.to_string(),
            };
            (Arc::new(ctx), ApiServerVerifier(handle))
        }
    }
}
