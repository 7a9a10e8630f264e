//! Per-kind readiness policies.
//!
//! Policies are evaluated in a fixed order and the first matching predicate wins. The order
//! encodes precedence: the kapp-controller App handles its own deletion, so it sits before the
//! generic deleting check, which in turn overrides every kind-specific policy below it.

use kapsule_core::{DoneApplyState, Resource};
use serde_json::Value as Json;
use tracing::trace;

mod batch;
mod core_v1;
mod crd;
mod deleting;
mod kappctrl;
mod workloads;

struct Waiter {
    name: &'static str,
    matches: fn(&Resource) -> bool,
    check: fn(&Resource, &[Resource]) -> DoneApplyState,
}

const WAITERS: &[Waiter] = &[
    Waiter { name: "kappctrl-app", matches: kappctrl::matches, check: kappctrl::check },
    Waiter { name: "deleting", matches: deleting::matches, check: deleting::check },
    Waiter { name: "crd", matches: crd::matches, check: crd::check },
    Waiter { name: "pod", matches: core_v1::is_pod, check: core_v1::check_pod },
    Waiter { name: "service", matches: core_v1::is_service, check: core_v1::check_service },
    Waiter { name: "deployment", matches: workloads::is_deployment, check: workloads::check_deployment },
    Waiter { name: "daemonset", matches: workloads::is_daemonset, check: workloads::check_daemonset },
    Waiter { name: "job", matches: batch::is_job, check: batch::check_job },
    Waiter { name: "cronjob", matches: batch::is_cronjob, check: batch::check_cronjob },
];

/// Classify `res`; `None` when no policy covers its kind.
/// `associated` is consulted by policies that judge rollout through owned resources.
pub fn classify(res: &Resource, associated: &[Resource]) -> Option<DoneApplyState> {
    let waiter = WAITERS.iter().find(|w| (w.matches)(res))?;
    let state = (waiter.check)(res, associated);
    trace!(waiter = waiter.name, res = %res.description(), done = state.done, ok = state.successful, "classified");
    Some(state)
}

/// Name of the policy that would classify `res`.
pub fn policy_name(res: &Resource) -> Option<&'static str> {
    WAITERS.iter().find(|w| (w.matches)(res)).map(|w| w.name)
}

pub(crate) fn is_kind(res: &Resource, group: &str, kind: &str) -> bool {
    res.api_group() == group && res.kind() == kind
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Condition<'a> {
    pub type_: &'a str,
    pub status: &'a str,
    pub reason: &'a str,
    pub message: &'a str,
}

impl Condition<'_> {
    pub fn is_true(&self) -> bool { self.status == "True" }
    pub fn is_false(&self) -> bool { self.status == "False" }
}

pub(crate) fn conditions<'a>(res: &'a Resource) -> Vec<Condition<'a>> {
    let text = |c: &'a Json, k: &str| -> &'a str { c.get(k).and_then(|v| v.as_str()).unwrap_or("") };
    res.pointer("/status/conditions")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|c| Condition {
                    type_: text(c, "type"),
                    status: text(c, "status"),
                    reason: text(c, "reason"),
                    message: text(c, "message"),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn condition<'a>(conds: &[Condition<'a>], type_: &str) -> Option<Condition<'a>> {
    conds.iter().find(|c| c.type_ == type_).copied()
}

pub(crate) fn int_at(res: &Resource, pointer: &str) -> i64 {
    res.pointer(pointer).and_then(|v| v.as_i64()).unwrap_or(0)
}

/// Pending state while the controller has not caught up with the latest spec.
pub(crate) fn unobserved_generation(res: &Resource) -> Option<DoneApplyState> {
    let generation = res.generation();
    if generation != int_at(res, "/status/observedGeneration") {
        return Some(DoneApplyState::pending(format!("Waiting for generation {} to be observed", generation)));
    }
    None
}

/// True when `child` lists `parent` in its owner references.
pub(crate) fn is_owned_by(child: &Resource, parent: &Resource) -> bool {
    let refs = match child.pointer("/metadata/ownerReferences").and_then(|v| v.as_array()) {
        Some(refs) => refs,
        None => return false,
    };
    refs.iter().any(|r| {
        let uid = r.get("uid").and_then(|v| v.as_str());
        match (uid, parent.uid()) {
            (Some(u), Some(p)) => u == p,
            _ => {
                r.get("kind").and_then(|v| v.as_str()) == Some(parent.kind())
                    && r.get("name").and_then(|v| v.as_str()) == Some(parent.name())
            }
        }
    })
}

/// `: <reason> (message: <message>)` suffix, empty parts omitted.
pub(crate) fn reason_suffix(reason: &str, message: &str) -> String {
    match (reason.is_empty(), message.is_empty()) {
        (true, true) => String::new(),
        (false, true) => format!(": {}", reason),
        (true, false) => format!(": {}", message),
        (false, false) => format!(": {} (message: {})", reason, message),
    }
}
