//! Periodic, decision-table driven reconciliation sweep.
//!
//! This is the direct counterpart of the Go reconciler's `pkg/reconcile`
//! package: rather than reacting to individual watch events it runs on a
//! fixed interval, lists every sub-resource kind, groups observations by
//! owning custom resource, computes a single [`Action`] per owner via
//! [`plan_action`] (a pure function mirroring `planAction` in
//! `reconcile.go`), and applies it via [`execute_action`]. It runs alongside
//! the event-driven [`crate::controller`] rather than replacing it: the
//! controller reacts fast to the owning resource's own create/update/delete,
//! the sweep catches drift (a sub-resource deleted out of band, stuck in a
//! failed state, or simply missing).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ResourceExt;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crd::{CrdClient, CustomResourceState};
use crate::error::{Error, Result};
use crate::resource::{ResourceClient, TemplateValues};

/// A sub-resource observation gathered during the "gather" phase of a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subresource {
    pub plural: &'static str,
    pub name: String,
    pub is_ephemeral: bool,
    pub is_failed: bool,
    pub has_deletion_timestamp: bool,
}

/// The convergence plan computed for a single owning custom resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Action {
    pub new_cr_state: Option<String>,
    pub new_cr_reason: String,
    pub to_create: Vec<&'static str>,
    pub to_delete: Vec<Subresource>,
}

impl Action {
    fn fail(error_state: &str, reason: String) -> Self {
        Action {
            new_cr_state: Some(error_state.to_string()),
            new_cr_reason: reason,
            ..Default::default()
        }
    }

    /// True if this action does nothing: the healthy, steady-state case.
    pub fn is_noop(&self) -> bool {
        self.new_cr_state.is_none() && self.to_create.is_empty() && self.to_delete.is_empty()
    }
}

/// Computes the single [`Action`] to take for one owning custom resource,
/// given its current sub-resource observations. Pure and synchronous so it
/// can be exhaustively unit tested against the decision table without a
/// cluster.
///
/// `cr` is `None` when the owner could not be found (deleted out of band);
/// `cr_is_deleting` reflects `metadata.deletion_timestamp.is_some()`.
pub fn plan_action<R: CustomResourceState>(
    controller_name: &str,
    cr: Option<&R>,
    cr_is_deleting: bool,
    subs: &[Subresource],
    ephemeral_kinds: &[&'static str],
    non_ephemeral_kinds: &[&'static str],
) -> Action {
    if controller_name.is_empty() {
        return Action::default();
    }

    let cr = match cr {
        None => {
            return Action {
                to_delete: subs.to_vec(),
                ..Default::default()
            };
        }
        Some(cr) => cr,
    };

    if cr.is_spec_terminal() || cr.is_status_terminal() {
        return Action {
            to_delete: subs
                .iter()
                .filter(|s| !s.has_deletion_timestamp)
                .cloned()
                .collect(),
            ..Default::default()
        };
    }

    if cr_is_deleting {
        return Action {
            to_delete: subs.to_vec(),
            ..Default::default()
        };
    }

    for &plural in non_ephemeral_kinds {
        match subs.iter().find(|s| s.plural == plural) {
            Some(sub) if sub.has_deletion_timestamp => {
                return Action::fail(
                    R::error_state(),
                    format!(
                        "non-ephemeral subresource \"{plural}\" for \"{controller_name}\" is deleted"
                    ),
                );
            }
            Some(sub) if sub.is_failed => {
                return Action::fail(
                    R::error_state(),
                    format!(
                        "non-ephemeral subresource \"{plural}\" for \"{controller_name}\" is in a terminal state"
                    ),
                );
            }
            None => {
                return Action::fail(
                    R::error_state(),
                    format!(
                        "non-ephemeral subresource \"{plural}\" for \"{controller_name}\" does not exist"
                    ),
                );
            }
            _ => {}
        }
    }

    let to_delete: Vec<Subresource> = subs
        .iter()
        .filter(|s| s.is_ephemeral && s.is_failed && !s.has_deletion_timestamp)
        .cloned()
        .collect();
    if !to_delete.is_empty() {
        return Action {
            to_delete,
            ..Default::default()
        };
    }

    let to_create: Vec<&'static str> = ephemeral_kinds
        .iter()
        .filter(|plural| !subs.iter().any(|s| &s.plural == *plural))
        .copied()
        .collect();
    if !to_create.is_empty() {
        return Action {
            to_create,
            ..Default::default()
        };
    }

    Action::default()
}

/// Applies `action`, accumulating rather than aborting on individual
/// sub-resource errors, the way the Go reconciler's `executeAction` does.
pub async fn execute_action<R>(
    crd_client: &CrdClient<R>,
    resource_clients: &HashMap<&'static str, Arc<dyn ResourceClient>>,
    namespace: &str,
    controller_name: &str,
    mut cr: R,
    action: Action,
    owner: OwnerReference,
    template_values: TemplateValues,
) -> Vec<Error>
where
    R: Resource<DynamicType = ()> + CustomResourceState + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
{
    let mut errors = Vec::new();

    if let Some(state) = &action.new_cr_state {
        cr.set_status_state_with_message(state, &action.new_cr_reason);
        if let Err(e) = crd_client.update(controller_name, &cr).await {
            errors.push(e);
        }
    }

    for plural in &action.to_create {
        let Some(client) = resource_clients.get(plural) else {
            continue;
        };
        match client.reify(&template_values).await {
            Ok(object) => {
                if let Err(e) = client.create(namespace, object, owner.clone()).await {
                    errors.push(e);
                }
            }
            Err(e) => errors.push(e),
        }
    }

    for sub in &action.to_delete {
        let Some(client) = resource_clients.get(sub.plural) else {
            continue;
        };
        if let Err(e) = client.delete(namespace, &sub.name).await {
            errors.push(e);
        }
    }

    errors
}

/// Lists every sub-resource kind in `namespace` and groups the ones
/// controlled by a `kind`-typed owner by that owner's name, mirroring
/// `groupSubresourcesByController`. Objects with no matching controller
/// reference are dropped.
pub async fn group_subresources_by_controller(
    resource_clients: &HashMap<&'static str, Arc<dyn ResourceClient>>,
    namespace: &str,
    owner_kind: &str,
) -> Result<HashMap<String, Vec<Subresource>>> {
    let mut grouped: HashMap<String, Vec<Subresource>> = HashMap::new();

    for (plural, client) in resource_clients {
        let api = client.api(namespace);
        let list = api.list(&Default::default()).await?;
        for object in list.items {
            let controller_name = object
                .metadata
                .owner_references
                .as_ref()
                .and_then(|refs| {
                    refs.iter()
                        .find(|r| r.controller == Some(true) && r.kind == owner_kind)
                })
                .map(|r| r.name.clone());

            let Some(controller_name) = controller_name else {
                continue;
            };

            let is_failed = client.is_failed(&object).await?;
            grouped.entry(controller_name).or_default().push(Subresource {
                plural,
                name: object.name_any(),
                is_ephemeral: client.is_ephemeral(),
                is_failed,
                has_deletion_timestamp: object.metadata.deletion_timestamp.is_some(),
            });
        }
    }

    Ok(grouped)
}

/// Kinds a given custom resource kind owns, split by ephemerality, plus its
/// client map for `execute_action`.
pub struct ReconcilerConfig {
    pub namespace: String,
    pub owner_kind: &'static str,
    pub ephemeral_kinds: Vec<&'static str>,
    pub non_ephemeral_kinds: Vec<&'static str>,
    pub resource_clients: HashMap<&'static str, Arc<dyn ResourceClient>>,
    pub interval: Duration,
}

/// Runs the periodic sweep for one custom resource kind until cancelled.
pub struct Reconciler<R> {
    config: ReconcilerConfig,
    crd_client: CrdClient<R>,
}

impl<R> Reconciler<R>
where
    R: Resource<DynamicType = ()>
        + CustomResourceState
        + Clone
        + Serialize
        + DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    pub fn new(client: Client, config: ReconcilerConfig) -> Self {
        let crd_client = CrdClient::new(client, &config.namespace);
        Self { config, crd_client }
    }

    /// Runs sweeps on `config.interval` until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("reconciler sweep loop shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "reconciliation sweep failed");
                    }
                }
            }
        }
    }

    /// Runs a single gather/plan/execute sweep.
    pub async fn run_once(&self) -> Result<()> {
        let grouped = group_subresources_by_controller(
            &self.config.resource_clients,
            &self.config.namespace,
            self.config.owner_kind,
        )
        .await?;

        for (controller_name, subs) in grouped {
            let cr = match self.crd_client.get(&controller_name).await {
                Ok(cr) => Some(cr),
                Err(Error::KubeError {
                    source: kube::Error::Api(e),
                }) if e.code == 404 => None,
                Err(e) => {
                    warn!(error = %e, name = %controller_name, "failed to fetch owning resource");
                    continue;
                }
            };

            let cr_is_deleting = cr
                .as_ref()
                .map(|cr| cr.meta().deletion_timestamp.is_some())
                .unwrap_or(false);

            let action = plan_action(
                &controller_name,
                cr.as_ref(),
                cr_is_deleting,
                &subs,
                &self.config.ephemeral_kinds,
                &self.config.non_ephemeral_kinds,
            );

            if action.is_noop() {
                debug!(name = %controller_name, "no action required");
                continue;
            }

            let Some(cr) = cr else {
                // CR is gone: to_delete was already populated with every
                // observed sub, nothing else to apply.
                for sub in &action.to_delete {
                    if let Some(client) = self.config.resource_clients.get(sub.plural) {
                        if let Err(e) = client.delete(&self.config.namespace, &sub.name).await {
                            warn!(error = %e, name = %sub.name, "failed to delete orphaned subresource");
                        }
                    }
                }
                continue;
            };

            let owner = OwnerReference {
                api_version: format!("{}/{}", R::group(&()), R::version(&())),
                kind: self.config.owner_kind.to_string(),
                name: controller_name.clone(),
                uid: cr.meta().uid.clone().unwrap_or_default(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            };
            let mut template_values = TemplateValues::new(&controller_name, &self.config.namespace);
            template_values.values.extend(cr.template_values());

            let errors = execute_action(
                &self.crd_client,
                &self.config.resource_clients,
                &self.config.namespace,
                &controller_name,
                cr,
                action,
                owner,
                template_values,
            )
            .await;

            for e in errors {
                warn!(error = %e, name = %controller_name, "error applying reconcile action");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::echo::{Echo, EchoSpec};

    fn sub(plural: &'static str, ephemeral: bool, failed: bool, deleting: bool) -> Subresource {
        Subresource {
            plural,
            name: "test".to_string(),
            is_ephemeral: ephemeral,
            is_failed: failed,
            has_deletion_timestamp: deleting,
        }
    }

    const EPHEMERAL: &[&str] = &["ingresses", "horizontalpodautoscalers"];
    const NON_EPHEMERAL: &[&str] = &["deployments"];

    #[test]
    fn empty_controller_name_is_noop() {
        let action = plan_action::<Echo>("", None, false, &[], EPHEMERAL, NON_EPHEMERAL);
        assert!(action.is_noop());
    }

    #[test]
    fn missing_owner_deletes_all_subs() {
        let subs = vec![sub("deployments", false, false, false)];
        let action = plan_action::<Echo>("test", None, false, &subs, EPHEMERAL, NON_EPHEMERAL);
        assert_eq!(action.to_delete, subs);
    }

    #[test]
    fn terminal_cr_deletes_live_subs_only() {
        let cr = Echo::new("test", EchoSpec { replicas: 1 });
        let subs = vec![
            sub("deployments", false, false, false),
            sub("ingresses", true, false, true),
        ];
        let action = plan_action::<Echo>("test", Some(&cr), false, &subs, EPHEMERAL, NON_EPHEMERAL);
        assert_eq!(action.to_delete, vec![subs[0].clone()]);
    }

    #[test]
    fn deleting_cr_deletes_all_subs() {
        let cr = Echo::new("test", EchoSpec { replicas: 1 });
        let subs = vec![sub("deployments", false, false, false)];
        let action = plan_action::<Echo>("test", Some(&cr), true, &subs, EPHEMERAL, NON_EPHEMERAL);
        assert_eq!(action.to_delete, subs);
    }

    #[test]
    fn non_ephemeral_missing_fails_cr() {
        let cr = Echo::new("test", EchoSpec { replicas: 1 });
        let action = plan_action::<Echo>("test", Some(&cr), false, &[], EPHEMERAL, NON_EPHEMERAL);
        assert_eq!(action.new_cr_state.as_deref(), Some(Echo::error_state()));
        assert!(action.new_cr_reason.contains("does not exist"));
    }

    #[test]
    fn non_ephemeral_failed_fails_cr() {
        let cr = Echo::new("test", EchoSpec { replicas: 1 });
        let subs = vec![sub("deployments", false, true, false)];
        let action = plan_action::<Echo>("test", Some(&cr), false, &subs, EPHEMERAL, NON_EPHEMERAL);
        assert_eq!(action.new_cr_state.as_deref(), Some(Echo::error_state()));
        assert!(action.new_cr_reason.contains("terminal state"));
    }

    #[test]
    fn ephemeral_failed_alive_is_scheduled_for_delete() {
        let cr = Echo::new("test", EchoSpec { replicas: 1 });
        let subs = vec![
            sub("deployments", false, false, false),
            sub("ingresses", true, true, false),
            sub("horizontalpodautoscalers", true, false, false),
        ];
        let action = plan_action::<Echo>("test", Some(&cr), false, &subs, EPHEMERAL, NON_EPHEMERAL);
        assert_eq!(action.to_delete, vec![subs[1].clone()]);
    }

    #[test]
    fn ephemeral_missing_is_scheduled_for_create() {
        let cr = Echo::new("test", EchoSpec { replicas: 1 });
        let subs = vec![sub("deployments", false, false, false)];
        let action = plan_action::<Echo>("test", Some(&cr), false, &subs, EPHEMERAL, NON_EPHEMERAL);
        assert_eq!(action.to_create.len(), 2);
        assert!(action.to_create.contains(&"ingresses"));
        assert!(action.to_create.contains(&"horizontalpodautoscalers"));
    }

    #[test]
    fn healthy_is_noop() {
        let cr = Echo::new("test", EchoSpec { replicas: 1 });
        let subs = vec![
            sub("deployments", false, false, false),
            sub("ingresses", true, false, false),
            sub("horizontalpodautoscalers", true, false, false),
        ];
        let action = plan_action::<Echo>("test", Some(&cr), false, &subs, EPHEMERAL, NON_EPHEMERAL);
        assert!(action.is_noop());
    }
}
