use kapsule_core::{DoneApplyState, Resource};

use super::{condition, conditions, is_kind, reason_suffix};

pub(super) fn matches(res: &Resource) -> bool {
    is_kind(res, "apiextensions.k8s.io", "CustomResourceDefinition")
}

pub(super) fn check(res: &Resource, _associated: &[Resource]) -> DoneApplyState {
    let conds = conditions(res);

    if let Some(c) = condition(&conds, "NamesAccepted").filter(|c| c.is_false()) {
        return DoneApplyState::failed(format!("Names not accepted{}", reason_suffix(c.reason, c.message)));
    }

    let missing: Vec<&str> = ["Established", "NamesAccepted"]
        .into_iter()
        .filter(|t| !condition(&conds, t).map_or(false, |c| c.is_true()))
        .collect();
    if missing.is_empty() {
        DoneApplyState::ok()
    } else {
        DoneApplyState::pending(format!("Waiting on condition(s): {}", missing.join(", ")))
    }
}
