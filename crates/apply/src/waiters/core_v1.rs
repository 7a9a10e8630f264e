//! Core group: Pods and Services.

use kapsule_core::{DoneApplyState, Resource};
use serde_json::Value as Json;

use super::{condition, conditions, is_kind, reason_suffix};

pub(super) fn is_pod(res: &Resource) -> bool { is_kind(res, "", "Pod") }
pub(super) fn is_service(res: &Resource) -> bool { is_kind(res, "", "Service") }

pub(super) fn check_pod(res: &Resource, _associated: &[Resource]) -> DoneApplyState {
    let phase = res.pointer("/status/phase").and_then(|v| v.as_str()).unwrap_or("");
    match phase {
        "Succeeded" => DoneApplyState::ok(),
        "Failed" => {
            let reason = res.pointer("/status/reason").and_then(|v| v.as_str()).unwrap_or("");
            let message = res.pointer("/status/message").and_then(|v| v.as_str()).unwrap_or("");
            DoneApplyState::failed(format!("Phase: Failed{}", reason_suffix(reason, message)))
        }
        "Running" => {
            let conds = conditions(res);
            if condition(&conds, "Ready").map_or(false, |c| c.is_true()) {
                DoneApplyState::ok()
            } else {
                DoneApplyState::pending(format!("Condition Ready is not 'True'{}", waiting_details(res)))
            }
        }
        "Pending" | "" => {
            let conds = conditions(res);
            if let Some(c) = condition(&conds, "PodScheduled").filter(|c| c.is_false()) {
                return DoneApplyState::pending(format!("Pending{}", reason_suffix(c.reason, c.message)));
            }
            DoneApplyState::pending(format!("Pending{}", waiting_details(res)))
        }
        other => DoneApplyState::pending(format!("Unknown phase: {}", other)),
    }
}

/// First waiting container (init containers first) rendered as a reason suffix.
fn waiting_details(res: &Resource) -> String {
    for pointer in ["/status/initContainerStatuses", "/status/containerStatuses"] {
        let statuses = match res.pointer(pointer).and_then(|v| v.as_array()) {
            Some(s) => s,
            None => continue,
        };
        for st in statuses {
            if let Some(waiting) = st.pointer("/state/waiting") {
                let reason = text(waiting, "reason");
                let message = text(waiting, "message");
                if reason.is_empty() && message.is_empty() {
                    continue;
                }
                return reason_suffix(reason, message);
            }
        }
    }
    String::new()
}

fn text<'a>(v: &'a Json, key: &str) -> &'a str { v.get(key).and_then(|v| v.as_str()).unwrap_or("") }

pub(super) fn check_service(res: &Resource, _associated: &[Resource]) -> DoneApplyState {
    let spec = res.pointer("/spec").cloned().unwrap_or(Json::Null);
    let type_ = match text(&spec, "type") {
        "" => "ClusterIP",
        t => t,
    };
    if type_ == "ExternalName" {
        return DoneApplyState::ok();
    }

    match text(&spec, "clusterIP") {
        "None" => return DoneApplyState::ok(),
        "" => return DoneApplyState::pending("ClusterIP is empty"),
        _ => {}
    }

    if type_ == "LoadBalancer" {
        let has_ingress = res
            .pointer("/status/loadBalancer/ingress")
            .and_then(|v| v.as_array())
            .map_or(false, |a| !a.is_empty());
        if !has_ingress {
            return DoneApplyState::pending("Load balancer ingress is empty");
        }
    }

    DoneApplyState::ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(status: Json) -> Resource {
        Resource::new(json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": "p", "namespace": "ns" }, "status": status }))
    }

    fn svc(spec: Json, status: Json) -> Resource {
        Resource::new(json!({ "apiVersion": "v1", "kind": "Service", "metadata": { "name": "s", "namespace": "ns" }, "spec": spec, "status": status }))
    }

    #[test]
    fn pod_phases() {
        assert_eq!(check_pod(&pod(json!({ "phase": "Succeeded" })), &[]), DoneApplyState::ok());
        assert_eq!(
            check_pod(&pod(json!({ "phase": "Failed", "reason": "Evicted" })), &[]),
            DoneApplyState::failed("Phase: Failed: Evicted")
        );
        assert_eq!(check_pod(&pod(json!({ "phase": "Weird" })), &[]), DoneApplyState::pending("Unknown phase: Weird"));
    }

    #[test]
    fn running_pod_needs_ready_condition() {
        let ready = pod(json!({ "phase": "Running", "conditions": [ { "type": "Ready", "status": "True" } ] }));
        assert_eq!(check_pod(&ready, &[]), DoneApplyState::ok());

        let crashing = pod(json!({
            "phase": "Running",
            "conditions": [ { "type": "Ready", "status": "False" } ],
            "containerStatuses": [ { "name": "app", "state": { "waiting": { "reason": "CrashLoopBackOff", "message": "back-off 10s" } } } ]
        }));
        assert_eq!(
            check_pod(&crashing, &[]),
            DoneApplyState::pending("Condition Ready is not 'True': CrashLoopBackOff (message: back-off 10s)")
        );
    }

    #[test]
    fn pending_pod_reports_scheduling() {
        let unscheduled = pod(json!({
            "phase": "Pending",
            "conditions": [ { "type": "PodScheduled", "status": "False", "reason": "Unschedulable", "message": "0/3 nodes" } ]
        }));
        assert_eq!(check_pod(&unscheduled, &[]), DoneApplyState::pending("Pending: Unschedulable (message: 0/3 nodes)"));

        let pulling = pod(json!({
            "phase": "Pending",
            "containerStatuses": [ { "name": "app", "state": { "waiting": { "reason": "ErrImagePull" } } } ]
        }));
        assert_eq!(check_pod(&pulling, &[]), DoneApplyState::pending("Pending: ErrImagePull"));
    }

    #[test]
    fn service_readiness() {
        assert_eq!(check_service(&svc(json!({ "type": "ExternalName" }), json!({})), &[]), DoneApplyState::ok());
        assert_eq!(check_service(&svc(json!({ "clusterIP": "None" }), json!({})), &[]), DoneApplyState::ok());
        assert_eq!(check_service(&svc(json!({}), json!({})), &[]), DoneApplyState::pending("ClusterIP is empty"));
        assert_eq!(check_service(&svc(json!({ "clusterIP": "10.0.0.1" }), json!({})), &[]), DoneApplyState::ok());

        let lb = svc(json!({ "type": "LoadBalancer", "clusterIP": "10.0.0.2" }), json!({ "loadBalancer": {} }));
        assert!(!check_service(&lb, &[]).done);
        let lb_ready = svc(
            json!({ "type": "LoadBalancer", "clusterIP": "10.0.0.2" }),
            json!({ "loadBalancer": { "ingress": [ { "ip": "1.2.3.4" } ] } }),
        );
        assert_eq!(check_service(&lb_ready, &[]), DoneApplyState::ok());
    }
}
