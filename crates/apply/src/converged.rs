//! Convergence of one applied resource together with the resources it produced.

use anyhow::{anyhow, Result};
use kapsule_core::{DoneApplyState, Resource};

use crate::waiters;

/// Opts a resource out of waiting on its associated resources; the only valid value is `""`.
/// Useful on CronJobs, whose failed Pods from earlier runs would otherwise fail the deploy.
pub const DISABLE_ASSOCIATED_RESOURCES_WAIT_ANN: &str = "kapsule.dev/disable-associated-resources-wait";

const UI_WAIT_CHILD_PREFIX: &str = " L ";
const UI_WAIT_MSG_PREFIX: &str = " ^ ";
const UI_WAIT_CHILD_MSG_PREFIX: &str = "    ^ ";

/// Short state label shown next to a waited-on resource.
pub fn state_label(state: &DoneApplyState) -> &'static str {
    match (state.done, state.successful) {
        (true, true) => "ok",
        (true, false) => "fail",
        (false, _) => "ongoing",
    }
}

pub struct ConvergedResource {
    res: Resource,
    associated: Vec<Resource>,
}

impl ConvergedResource {
    pub fn new(res: Resource, associated: Vec<Resource>) -> Self { Self { res, associated } }

    /// Overall state plus progress lines. Pending states are data; the only error is a
    /// malformed opt-out annotation on the primary resource.
    pub fn is_done_applying(self) -> Result<(DoneApplyState, Vec<String>)> {
        let mut msgs = Vec::new();
        let (res, associated) = self.split_parent_and_associated();

        let res_state = waiters::classify(&res, &associated);
        if let Some(state) = &res_state {
            if state.done {
                return Ok((state.clone(), msgs));
            }
            if !state.successful && !associated.is_empty() {
                msgs.extend(parent_msgs(state));
            }
        }

        if let Some(val) = res.annotations().get(DISABLE_ASSOCIATED_RESOURCES_WAIT_ANN) {
            if !val.is_empty() {
                return Err(anyhow!(
                    "Expected annotation '{}' on resource '{}' to have value ''",
                    DISABLE_ASSOCIATED_RESOURCES_WAIT_ANN,
                    res.description()
                ));
            }
            return Ok((res_state.unwrap_or_else(DoneApplyState::ok), msgs));
        }

        // Children are listed even while the parent decides; they explain what it waits for.
        let mut states = Vec::with_capacity(associated.len());
        for child in &associated {
            let state = waiters::classify(child, &associated).unwrap_or_else(DoneApplyState::ok);
            msgs.extend(child_msgs(child, &state));
            states.push(state);
        }

        if let Some(state) = res_state {
            return Ok((state, msgs));
        }

        if let Some(failed) = states.iter().find(|s| s.terminally_failed()) {
            return Ok((failed.clone(), msgs));
        }
        if let Some(pending) = states.iter().find(|s| !s.done) {
            return Ok((pending.clone(), msgs));
        }
        Ok((DoneApplyState::ok(), msgs))
    }

    fn split_parent_and_associated(self) -> (Resource, Vec<Resource>) {
        let Self { res, mut associated } = self;
        let key = res.key();
        if let Some(idx) = associated.iter().position(|r| r.key() == key) {
            associated.remove(idx);
        }
        // Stable output between polls
        associated.sort_by(|a, b| b.description().cmp(&a.description()));
        (res, associated)
    }
}

fn parent_msgs(state: &DoneApplyState) -> Vec<String> {
    if state.message.is_empty() {
        return Vec::new();
    }
    vec![format!("{}{}", UI_WAIT_MSG_PREFIX, state.message)]
}

fn child_msgs(res: &Resource, state: &DoneApplyState) -> Vec<String> {
    let mut msgs = vec![format!("{}{}: waiting on {}", UI_WAIT_CHILD_PREFIX, state_label(state), res.description())];
    if !state.message.is_empty() {
        msgs.push(format!("{}{}", UI_WAIT_CHILD_MSG_PREFIX, state.message));
    }
    msgs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as Json};

    fn pod(name: &str, phase: &str) -> Resource {
        Resource::new(json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": { "name": name, "namespace": "ns" },
            "status": { "phase": phase }
        }))
    }

    fn config_map(name: &str, annotations: Json) -> Resource {
        Resource::new(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "ns", "annotations": annotations }
        }))
    }

    fn pending_job(annotations: Json) -> Resource {
        Resource::new(json!({
            "apiVersion": "batch/v1", "kind": "Job",
            "metadata": { "name": "migrate", "namespace": "ns", "annotations": annotations },
            "status": { "active": 1 }
        }))
    }

    #[test]
    fn done_parent_short_circuits() {
        let parent = pod("web", "Succeeded");
        let (state, msgs) = ConvergedResource::new(parent, vec![pod("other", "Failed")]).is_done_applying().unwrap();
        assert_eq!(state, DoneApplyState::ok());
        assert!(msgs.is_empty());
    }

    #[test]
    fn pending_parent_wins_over_children_but_lists_them() {
        let parent = pending_job(json!({}));
        let (state, msgs) =
            ConvergedResource::new(parent, vec![pod("migrate-a", "Failed"), pod("migrate-b", "Running")])
                .is_done_applying()
                .unwrap();
        assert!(!state.done);
        assert_eq!(msgs[0], " ^ Waiting to complete (1 active, 0 failed, 0 succeeded)");
        assert_eq!(msgs[1], " L ongoing: waiting on pod/migrate-b (v1) namespace: ns");
        assert_eq!(msgs[2], "    ^ Condition Ready is not 'True'");
        assert_eq!(msgs[3], " L fail: waiting on pod/migrate-a (v1) namespace: ns");
        assert_eq!(msgs[4], "    ^ Phase: Failed");
    }

    #[test]
    fn parent_is_removed_from_associated() {
        let parent = pending_job(json!({}));
        let (_, msgs) = ConvergedResource::new(parent.clone(), vec![parent]).is_done_applying().unwrap();
        assert!(msgs.is_empty());
    }

    #[test]
    fn opt_out_returns_parent_state_or_success() {
        let ann = json!({ DISABLE_ASSOCIATED_RESOURCES_WAIT_ANN: "" });
        let (state, msgs) =
            ConvergedResource::new(pending_job(ann.clone()), vec![pod("p", "Failed")]).is_done_applying().unwrap();
        assert!(!state.done);
        assert_eq!(msgs.len(), 1);

        let (state, _) = ConvergedResource::new(config_map("cfg", ann), vec![pod("p", "Failed")])
            .is_done_applying()
            .unwrap();
        assert_eq!(state, DoneApplyState::ok());
    }

    #[test]
    fn opt_out_with_value_is_an_error() {
        let ann = json!({ DISABLE_ASSOCIATED_RESOURCES_WAIT_ANN: "true" });
        let err = ConvergedResource::new(config_map("cfg", ann), vec![pod("p", "Succeeded")])
            .is_done_applying()
            .unwrap_err()
            .to_string();
        assert!(err.contains(DISABLE_ASSOCIATED_RESOURCES_WAIT_ANN), "err={}", err);
        assert!(err.contains("configmap/cfg (v1) namespace: ns"), "err={}", err);
    }

    #[test]
    fn unclassified_children_count_as_done() {
        let (state, msgs) = ConvergedResource::new(config_map("cfg", json!({})), vec![config_map("child", json!({}))])
            .is_done_applying()
            .unwrap();
        assert_eq!(state, DoneApplyState::ok());
        assert_eq!(msgs, vec![" L ok: waiting on configmap/child (v1) namespace: ns".to_string()]);
    }

    #[test]
    fn state_labels() {
        assert_eq!(state_label(&DoneApplyState::ok()), "ok");
        assert_eq!(state_label(&DoneApplyState::failed("x")), "fail");
        assert_eq!(state_label(&DoneApplyState::pending("x")), "ongoing");
    }
}
