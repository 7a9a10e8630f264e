//! apps group: Deployments and DaemonSets.

use kapsule_core::{DoneApplyState, Resource};

use super::{condition, conditions, int_at, is_kind, is_owned_by, reason_suffix, unobserved_generation};

const REVISION_ANN: &str = "deployment.kubernetes.io/revision";

pub(super) fn is_deployment(res: &Resource) -> bool { is_kind(res, "apps", "Deployment") }
pub(super) fn is_daemonset(res: &Resource) -> bool { is_kind(res, "apps", "DaemonSet") }

pub(super) fn check_deployment(res: &Resource, associated: &[Resource]) -> DoneApplyState {
    if let Some(pending) = unobserved_generation(res) {
        return pending;
    }

    let conds = conditions(res);
    if let Some(c) = condition(&conds, "Progressing").filter(|c| c.is_false()) {
        return DoneApplyState::failed(format!("Deployment is not progressing{}", reason_suffix(c.reason, c.message)));
    }

    let desired = res.pointer("/spec/replicas").and_then(|v| v.as_i64()).unwrap_or(1);
    let updated = int_at(res, "/status/updatedReplicas");
    if updated < desired {
        return DoneApplyState::pending(format!("Waiting for {} replicas to be updated", desired - updated));
    }

    let unavailable = int_at(res, "/status/unavailableReplicas");
    if unavailable > 0 {
        return DoneApplyState::pending(format!("Waiting for {} unavailable replicas", unavailable));
    }

    if let Some(rs) = current_replica_set(res, associated) {
        let want = rs.pointer("/spec/replicas").and_then(|v| v.as_i64()).unwrap_or(0);
        let available = int_at(rs, "/status/availableReplicas");
        if available < want {
            return DoneApplyState::pending(format!(
                "Waiting for {} unavailable replicas in {}",
                want - available,
                rs.description()
            ));
        }
    }

    DoneApplyState::ok()
}

/// ReplicaSet owned by `dep` carrying the deployment's current revision.
fn current_replica_set<'a>(dep: &Resource, associated: &'a [Resource]) -> Option<&'a Resource> {
    let revision = dep.annotations().get(REVISION_ANN).cloned()?;
    associated.iter().find(|r| {
        is_kind(r, "apps", "ReplicaSet")
            && is_owned_by(r, dep)
            && r.annotations().get(REVISION_ANN) == Some(&revision)
    })
}

pub(super) fn check_daemonset(res: &Resource, _associated: &[Resource]) -> DoneApplyState {
    if let Some(pending) = unobserved_generation(res) {
        return pending;
    }

    let desired = int_at(res, "/status/desiredNumberScheduled");
    let updated = int_at(res, "/status/updatedNumberScheduled");
    if updated < desired {
        return DoneApplyState::pending(format!("Waiting for {} pods to be updated", desired - updated));
    }

    let unavailable = int_at(res, "/status/numberUnavailable");
    if unavailable > 0 {
        return DoneApplyState::pending(format!("Waiting for {} unavailable pods", unavailable));
    }

    DoneApplyState::ok()
}
