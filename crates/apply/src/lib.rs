//! Kapsule apply: per-kind readiness policies, convergence of applied resources,
//! and the server-side apply and poll helpers a deploy is built from.

#![forbid(unsafe_code)]

mod converged;
pub mod documents;
pub mod ssa;
pub mod wait;
pub mod waiters;

pub use converged::{state_label, ConvergedResource, DISABLE_ASSOCIATED_RESOURCES_WAIT_ANN};
pub use kapsule_core::DoneApplyState;
