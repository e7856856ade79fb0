use thiserror::Error;

/// All errors possible to occur during reconciliation, CRD management and
/// sub-resource templating.
#[derive(Error, Debug)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate.
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },

    /// Error in user input or custom resource definition, typically missing fields.
    #[error("Invalid custom resource: {0}")]
    UserInputError(String),

    /// The finalizer helper failed to attach or remove itself.
    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    /// A custom resource attempted a transition the finite-state machine rejects.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A state was referenced that was never registered with the FSM.
    #[error("unknown state: {0}")]
    UnknownState(String),

    /// Sub-resource manifest template failed to render or parse.
    #[error("failed to reify template {template}: {source}")]
    ReifyError {
        template: String,
        #[source]
        source: ReifyError,
    },

    /// Custom resource failed schema validation.
    #[error("schema validation failed: {0}")]
    ValidationError(String),

    /// Custom resource definition never reached the `Established` condition in time.
    #[error("timed out waiting for CRD {0} to become established")]
    CrdNotEstablished(String),

    /// An otherwise-invalid `opentelemetry::trace::TraceId` was used as a metric label.
    #[error("invalid trace id")]
    InvalidTraceId,
}

/// Errors that can occur while rendering a sub-resource manifest template.
#[derive(Error, Debug)]
pub enum ReifyError {
    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),
    #[error("template registration error: {0}")]
    TemplateRegistration(#[from] handlebars::TemplateError),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json conversion error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable, low-cardinality label used to bucket errors in Prometheus metrics.
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError { .. } => "kube".to_string(),
            Error::UserInputError(_) => "user_input".to_string(),
            Error::FinalizerError(_) => "finalizer".to_string(),
            Error::InvalidTransition { .. } => "invalid_transition".to_string(),
            Error::UnknownState(_) => "unknown_state".to_string(),
            Error::ReifyError { .. } => "reify".to_string(),
            Error::ValidationError(_) => "validation".to_string(),
            Error::CrdNotEstablished(_) => "crd_not_established".to_string(),
            Error::InvalidTraceId => "invalid_trace_id".to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
