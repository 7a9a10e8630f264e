//! Poll driver: re-reads the cluster and re-runs convergence until a terminal state.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use kapsule_core::{DoneApplyState, IdentifiedResources, LabelSelector, Resource};
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::ConvergedResource;

#[derive(Debug, Clone)]
pub struct WaitOpts {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for WaitOpts {
    fn default() -> Self {
        let timeout_secs = std::env::var("KAPSULE_WAIT_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(900);
        let interval_ms = std::env::var("KAPSULE_WAIT_INTERVAL_MS").ok().and_then(|s| s.parse().ok()).unwrap_or(1000);
        Self { timeout: Duration::from_secs(timeout_secs), interval: Duration::from_millis(interval_ms) }
    }
}

/// Resources in `all` whose owner-reference chain leads to `primary`.
pub fn associated_with(primary: &Resource, all: &[Resource]) -> Vec<Resource> {
    let mut owners: HashSet<String> = primary.uid().map(|u| u.to_string()).into_iter().collect();
    if owners.is_empty() {
        return Vec::new();
    }
    let mut picked = vec![false; all.len()];
    loop {
        let mut grew = false;
        for (i, res) in all.iter().enumerate() {
            if picked[i] || res.uid() == primary.uid() {
                continue;
            }
            if res.owner_uids().iter().any(|u| owners.contains(*u)) {
                picked[i] = true;
                grew = true;
                if let Some(uid) = res.uid() {
                    owners.insert(uid.to_string());
                }
            }
        }
        if !grew {
            break;
        }
    }
    all.iter().zip(picked).filter(|(_, p)| *p).map(|(r, _)| r.clone()).collect()
}

/// Wait until `primary` (as last applied) converges. `selector` scopes candidate associated resources.
/// `progress` sees every non-terminal poll's state and messages.
pub async fn wait_for<F>(
    resources: &dyn IdentifiedResources,
    primary: &Resource,
    selector: &LabelSelector,
    opts: &WaitOpts,
    mut progress: F,
) -> Result<DoneApplyState>
where
    F: FnMut(&DoneApplyState, &[String]),
{
    let t0 = Instant::now();
    let desc = primary.description();
    loop {
        counter!("converge_polls_total", 1u64);
        let state = match resources.refresh(primary).await? {
            Some(res) => {
                let all = resources.list(selector).await?;
                let associated = associated_with(&res, &all);
                let (state, msgs) = ConvergedResource::new(res, associated).is_done_applying()?;
                if !state.done {
                    progress(&state, &msgs);
                }
                state
            }
            None => {
                let state = DoneApplyState::pending("Waiting for resource to appear");
                progress(&state, &[]);
                state
            }
        };

        if state.done {
            histogram!("converge_wait_ms", t0.elapsed().as_secs_f64() * 1000.0);
            info!(res = %desc, ok = state.successful, took_ms = %t0.elapsed().as_millis(), "converged");
            return Ok(state);
        }
        if t0.elapsed() >= opts.timeout {
            counter!("converge_timeouts_total", 1u64);
            return Err(anyhow!(
                "Timed out waiting after {}s for resource '{}' ({})",
                opts.timeout.as_secs(),
                desc,
                state.message
            ));
        }
        debug!(res = %desc, msg = %state.message, "still converging");
        tokio::time::sleep(opts.interval).await;
    }
}
