use kapsule_core::{DoneApplyState, Resource};

pub(super) fn matches(res: &Resource) -> bool { res.is_deleting() }

/// A resource with a deletion timestamp is still held by finalizers; it converges once gone.
pub(super) fn check(_res: &Resource, _associated: &[Resource]) -> DoneApplyState {
    DoneApplyState::pending("Deleting")
}
