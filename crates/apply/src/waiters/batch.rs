//! batch group: Jobs and CronJobs.

use kapsule_core::{DoneApplyState, Resource};

use super::{conditions, int_at, is_kind, reason_suffix};

pub(super) fn is_job(res: &Resource) -> bool { is_kind(res, "batch", "Job") }
pub(super) fn is_cronjob(res: &Resource) -> bool { is_kind(res, "batch", "CronJob") }

pub(super) fn check_job(res: &Resource, _associated: &[Resource]) -> DoneApplyState {
    for c in conditions(res).iter().filter(|c| c.is_true()) {
        match c.type_ {
            "Failed" => return DoneApplyState::failed(format!("Failed{}", reason_suffix(c.reason, c.message))),
            "Complete" => {
                return DoneApplyState { done: true, successful: true, message: "Completed".to_string() }
            }
            _ => {}
        }
    }

    DoneApplyState::pending(format!(
        "Waiting to complete ({} active, {} failed, {} succeeded)",
        int_at(res, "/status/active"),
        int_at(res, "/status/failed"),
        int_at(res, "/status/succeeded"),
    ))
}

/// CronJobs have nothing to converge on at apply time.
pub(super) fn check_cronjob(_res: &Resource, _associated: &[Resource]) -> DoneApplyState { DoneApplyState::ok() }

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(status: serde_json::Value) -> Resource {
        Resource::new(json!({ "apiVersion": "batch/v1", "kind": "Job", "metadata": { "name": "j", "namespace": "ns" }, "status": status }))
    }

    #[test]
    fn job_outcomes() {
        let running = job(json!({ "active": 1 }));
        assert_eq!(check_job(&running, &[]), DoneApplyState::pending("Waiting to complete (1 active, 0 failed, 0 succeeded)"));

        let done = job(json!({ "succeeded": 1, "conditions": [ { "type": "Complete", "status": "True" } ] }));
        let s = check_job(&done, &[]);
        assert!(s.done && s.successful);
        assert_eq!(s.message, "Completed");

        let failed = job(json!({ "failed": 6, "conditions": [ { "type": "Failed", "status": "True", "reason": "BackoffLimitExceeded", "message": "Job has reached the specified backoff limit" } ] }));
        assert_eq!(
            check_job(&failed, &[]),
            DoneApplyState::failed("Failed: BackoffLimitExceeded (message: Job has reached the specified backoff limit)")
        );
    }

    #[test]
    fn cronjob_any_version_is_done() {
        for v in ["batch/v1", "batch/v1beta1"] {
            let cj = Resource::new(json!({ "apiVersion": v, "kind": "CronJob", "metadata": { "name": "c" } }));
            assert!(is_cronjob(&cj));
            assert_eq!(check_cronjob(&cj, &[]), DoneApplyState::ok());
        }
    }
}
