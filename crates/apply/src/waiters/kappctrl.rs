//! kapp-controller `App` custom resources (reconciliation and deletion).

use kapsule_core::{DoneApplyState, Resource};

use super::{conditions, deleting, is_kind, unobserved_generation};

pub(super) fn matches(res: &Resource) -> bool { is_kind(res, "kappctrl.k14s.io", "App") }

pub(super) fn check(res: &Resource, associated: &[Resource]) -> DoneApplyState {
    if let Some(pending) = unobserved_generation(res) {
        return pending;
    }

    for cond in conditions(res) {
        if !cond.is_true() {
            continue;
        }
        match cond.type_ {
            "Reconciling" => return DoneApplyState::pending("Reconciling"),
            "ReconcileFailed" => {
                return DoneApplyState::failed(format!(
                    "Reconcile failed: {} (message: {})",
                    cond.message,
                    useful_error(res)
                ))
            }
            "DeleteFailed" => {
                return DoneApplyState::failed(format!("Delete failed: {} (message: {})", cond.message, useful_error(res)))
            }
            _ => {}
        }
    }

    if deleting::matches(res) {
        return deleting::check(res, associated);
    }

    DoneApplyState::ok()
}

fn useful_error(res: &Resource) -> &str {
    res.pointer("/status/usefulErrorMessage").and_then(|v| v.as_str()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn app(status: serde_json::Value) -> Resource {
        Resource::new(json!({
            "apiVersion": "kappctrl.k14s.io/v1alpha1", "kind": "App",
            "metadata": { "name": "a", "namespace": "ns", "generation": 2 },
            "status": status
        }))
    }

    #[test]
    fn waits_for_observed_generation() {
        let s = check(&app(json!({ "observedGeneration": 1 })), &[]);
        assert_eq!(s, DoneApplyState::pending("Waiting for generation 2 to be observed"));
    }

    #[test]
    fn reconcile_states() {
        let reconciling = app(json!({
            "observedGeneration": 2,
            "conditions": [ { "type": "Reconciling", "status": "True" } ]
        }));
        assert_eq!(check(&reconciling, &[]), DoneApplyState::pending("Reconciling"));

        let failed = app(json!({
            "observedGeneration": 2,
            "usefulErrorMessage": "fetch failed",
            "conditions": [ { "type": "ReconcileFailed", "status": "True", "message": "exit 1" } ]
        }));
        assert_eq!(check(&failed, &[]), DoneApplyState::failed("Reconcile failed: exit 1 (message: fetch failed)"));

        let ok = app(json!({
            "observedGeneration": 2,
            "conditions": [ { "type": "ReconcileSucceeded", "status": "True" } ]
        }));
        assert_eq!(check(&ok, &[]), DoneApplyState::ok());
    }
}
