use crate::crd::CustomResourceState;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of an `Echo`: how many replicas of the echo server should run.
#[derive(CustomResource, Deserialize, Serialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "example.com",
    version = "v1",
    kind = "Echo",
    plural = "echoes",
    singular = "echo",
    shortname = "ec",
    namespaced,
    status = "EchoStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct EchoSpec {
    /// Number of echo-server pods to run.
    pub replicas: i32,
}

/// Observed state of an `Echo`, written back by the reconciler.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EchoStatus {
    /// Replica count last observed on the owned `Deployment`.
    pub replicas: Option<i32>,

    /// Reconciliation state, one of the [`crate::fsm`] states registered for `Echo`.
    pub state: Option<String>,

    /// Human readable detail for the current `state`, set alongside it.
    pub reason: Option<String>,

    /// Standard Kubernetes-style condition history.
    #[serde(default)]
    pub conditions: Vec<EchoCondition>,
}

/// A single status condition, following the conventions of the built-in
/// workload conditions (`type`/`status`/`reason`/`message`).
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EchoCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
}

/// States a reconciled `Echo` can be in, used to initialize the [`crate::fsm::Fsm`]
/// that guards its transitions.
pub const ECHO_STATE_PENDING: &str = "Pending";
pub const ECHO_STATE_RUNNING: &str = "Running";
pub const ECHO_STATE_FAILED: &str = "Failed";
pub const ECHO_STATE_DELETING: &str = "Deleting";

impl CustomResourceState for Echo {
    fn status_state(&self) -> Option<String> {
        self.status.as_ref().and_then(|s| s.state.clone())
    }

    /// `EchoSpec` models no explicit desired-state enum (unlike e.g.
    /// `StreamPredictionSpec.State`): an `Echo` always wants to converge on
    /// `Running` while it isn't being deleted, so that's the one state the
    /// FSM gate in `EchoHooks::apply` ever targets.
    fn spec_state(&self) -> Option<String> {
        Some(ECHO_STATE_RUNNING.to_string())
    }

    fn set_status_state_with_message(&mut self, state: &str, message: &str) {
        let status = self.status.get_or_insert_with(EchoStatus::default);
        status.state = Some(state.to_string());
        status.reason = Some(message.to_string());
    }

    fn error_state() -> &'static str {
        ECHO_STATE_FAILED
    }

    fn template_values(&self) -> std::collections::BTreeMap<String, serde_json::Value> {
        let mut values = std::collections::BTreeMap::new();
        values.insert(
            "replicas".to_string(),
            serde_json::Value::from(self.spec.replicas),
        );
        // No dedicated max-replicas field in EchoSpec: give the autoscaler
        // manifest template a sensible ceiling above the desired replica count.
        values.insert(
            "max_replicas".to_string(),
            serde_json::Value::from((self.spec.replicas * 2).max(1)),
        );
        values
    }

    fn is_status_terminal(&self) -> bool {
        matches!(self.status_state().as_deref(), Some(ECHO_STATE_FAILED))
    }
}

/// Builds the [`crate::fsm::Fsm`] describing valid `Echo` status transitions.
pub fn echo_fsm() -> crate::fsm::Fsm {
    let mut fsm = crate::fsm::Fsm::new([
        ECHO_STATE_PENDING,
        ECHO_STATE_RUNNING,
        ECHO_STATE_FAILED,
        ECHO_STATE_DELETING,
    ]);
    // Unwraps are safe: every state above was just registered.
    fsm.set_adjacent(ECHO_STATE_PENDING, ECHO_STATE_RUNNING).unwrap();
    fsm.set_adjacent(ECHO_STATE_PENDING, ECHO_STATE_FAILED).unwrap();
    fsm.set_adjacent(ECHO_STATE_RUNNING, ECHO_STATE_FAILED).unwrap();
    fsm.set_adjacent(ECHO_STATE_RUNNING, ECHO_STATE_DELETING).unwrap();
    fsm.set_adjacent(ECHO_STATE_FAILED, ECHO_STATE_DELETING).unwrap();
    fsm.set_adjacent(ECHO_STATE_FAILED, ECHO_STATE_RUNNING).unwrap();
    fsm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_fsm_allows_recovery_from_failed() {
        let fsm = echo_fsm();
        assert!(fsm
            .valid_transition(ECHO_STATE_FAILED, ECHO_STATE_RUNNING)
            .unwrap());
    }

    #[test]
    fn echo_fsm_rejects_deleting_to_running() {
        let fsm = echo_fsm();
        assert!(!fsm
            .valid_transition(ECHO_STATE_DELETING, ECHO_STATE_RUNNING)
            .unwrap());
    }

    #[test]
    fn set_status_state_with_message_initializes_status() {
        let mut echo = Echo::new("test", EchoSpec { replicas: 1 });
        echo.set_status_state_with_message(ECHO_STATE_RUNNING, "all sub-resources ready");
        assert_eq!(echo.status_state().as_deref(), Some(ECHO_STATE_RUNNING));
        assert!(echo.is_status_terminal() == false);
    }
}
