//! Boot reconciliation: restore chute state after a power cycle.
//!
//! Runs once at startup, before any externally submitted update.
//! Chutes recorded as running get their stale network leases
//! reclaimed, then the network daemon's post-boot report decides
//! which of them are restarted this cycle.

use std::collections::HashSet;

use log::{info, warn};

use crate::confd::{ConfdClient, ConfigSectionStatus};
use crate::config::Config;
use crate::errors::ChuteError;
use crate::executor::ExecutorHandle;
use crate::network::NetworkResourceManager;
use crate::store::ChuteStore;
use crate::types::{ChuteState, Update, UpdateClass, UpdateType};

/// Warning recorded on a chute that is held back this cycle.
const HELD_WARNING: &str = "network configuration for this chute failed to load after \
reboot; the chute was left untouched and will be retried on the next boot";

/// Build the restart plan for chutes that were running before the
/// power cycle.  Returns the updates for the caller to submit; empty
/// when the feature is disabled by configuration.
pub async fn reload_chutes(
    cfg: &Config,
    store: &ChuteStore,
    net: &NetworkResourceManager,
    confd: &ConfdClient,
    handle: &ExecutorHandle,
) -> Result<Vec<Update>, ChuteError> {
    if !cfg.reconcile_enabled {
        info!("boot reconciliation disabled by configuration");
        return Ok(Vec::new());
    }

    // Reclaim leases unconditionally, before the daemon is confirmed
    // healthy.  A stale lease must never block fresh allocation.
    let mut candidates = HashSet::new();
    for mut chute in store.list().await {
        if chute.state != ChuteState::Running {
            continue;
        }
        net.reclaim(&mut chute).await;
        store.put(&chute).await?;
        candidates.insert(chute.name);
    }
    info!("{} chute(s) were running before restart", candidates.len());

    let report = confd.wait_system_up().await;
    let (ok, held) = partition_report(candidates, &report, &cfg.reserved_section);

    // Held chutes keep their running state on purpose: a transient
    // daemon failure should not keep a chute down across every
    // reboot.  The failure is recorded on the chute itself.
    for name in &held {
        warn!("holding chute {} this cycle", name);
        if let Some(mut chute) = store.get(name).await {
            chute.warnings.push(HELD_WARNING.to_string());
            store.put(&chute).await?;
        }
    }

    let mut names: Vec<String> = ok.into_iter().collect();
    names.sort();
    let updates = names
        .into_iter()
        .map(|name| {
            Update::new(
                UpdateClass::Chute,
                UpdateType::Restart,
                name,
                handle.next_token(),
                None,
            )
        })
        .collect();
    Ok(updates)
}

/// Partition the restart candidates against the daemon's report.
///
/// A failed section naming the reserved system target is logged and
/// affects no chute; one naming a candidate moves it to the held set;
/// anything else is an orphaned config reference we can only log,
/// since no stored chute corresponds to it.
fn partition_report(
    mut ok: HashSet<String>,
    report: &[ConfigSectionStatus],
    reserved: &str,
) -> (HashSet<String>, HashSet<String>) {
    let mut held = HashSet::new();
    for section in report {
        if section.success {
            continue;
        }
        if section.target == reserved {
            warn!(
                "network daemon failed to load a system config section: {}",
                section.comment
            );
        } else if ok.remove(&section.target) {
            held.insert(section.target.clone());
        } else if !held.contains(&section.target) {
            warn!(
                "failed config section for unrecognized chute: {}",
                section.target
            );
        }
    }
    (ok, held)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(target: &str, success: bool) -> ConfigSectionStatus {
        ConfigSectionStatus {
            target: target.to_string(),
            success,
            comment: String::new(),
        }
    }

    fn names(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn partitions_candidates_by_report() {
        let candidates = names(&["A", "B", "C"]);
        let report = vec![record("A", false), record("B", true), record("Z", false)];
        let (ok, held) = partition_report(candidates, &report, "__system__");

        // A held due to an explicit failure, C untouched since absent
        // from the report, Z unknown and only logged.
        assert_eq!(ok, names(&["B", "C"]));
        assert_eq!(held, names(&["A"]));
    }

    #[test]
    fn reserved_section_failures_affect_no_chute() {
        let candidates = names(&["A"]);
        let report = vec![record("__system__", false)];
        let (ok, held) = partition_report(candidates, &report, "__system__");
        assert_eq!(ok, names(&["A"]));
        assert!(held.is_empty());
    }

    #[test]
    fn repeated_failures_for_one_chute_hold_it_once() {
        let candidates = names(&["A"]);
        let report = vec![record("A", false), record("A", false)];
        let (ok, held) = partition_report(candidates, &report, "__system__");
        assert!(ok.is_empty());
        assert_eq!(held, names(&["A"]));
    }

    #[test]
    fn empty_report_restarts_everything() {
        let candidates = names(&["A", "B"]);
        let (ok, held) = partition_report(candidates, &[], "__system__");
        assert_eq!(ok, names(&["A", "B"]));
        assert!(held.is_empty());
    }
}
