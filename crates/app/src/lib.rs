//! Kapsule apps: the durable app record, its change history, and label-scoped views
//! of the cluster resources an app owns.
//!
//! Records live in an `ObjectStore` (ConfigMaps in a cluster, RAM in tests). The store offers
//! per-object optimistic concurrency only, so multi-step operations here are ordered
//! sequences without rollback.

#![forbid(unsafe_code)]

mod apps;
mod changes;
mod labeled;
mod meta;
mod recorded;

pub use apps::RecordedApps;
pub use changes::{Change, RecordedAppChanges, RecordedChange};
pub use labeled::LabeledApp;
pub use meta::{AppMeta, ChangeMeta, ChangeStatus, META_DATA_KEY};
pub use recorded::{RecordedApp, TrackedChange};

/// Marks a stored object as an app record.
pub const IS_APP_LABEL_KEY: &str = "kapsule.dev/is-app";
/// Identity label stamped on every resource of an app.
pub const APP_LABEL_KEY: &str = "kapsule.dev/app";
/// Marks a stored object as an app change.
pub const IS_CHANGE_LABEL_KEY: &str = "kapsule.dev/is-app-change";
/// Names the app a change belongs to.
pub const CHANGE_APP_LABEL_KEY: &str = "kapsule.dev/app-change-app";
