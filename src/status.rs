//! State-sync probe: reconciles a persisted lifecycle status against the
//! live container state before a record is returned to any caller.

use crate::db::Status;
use crate::runtime::ContainerDetails;

/// Outcome of resolving live container state against a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub status: Status,
    /// The backing container is gone; the record's handle must be cleared
    pub clear_handle: bool,
}

/// Map a live container snapshot to the corrected lifecycle status.
///
/// Priority order, first match wins: missing container, running,
/// restarting, dead or OOM-killed, anything else (exited, paused,
/// created-but-not-started).
pub fn resolve(details: Option<&ContainerDetails>) -> Resolution {
    match details {
        None => Resolution {
            status: Status::Stopped,
            clear_handle: true,
        },
        Some(d) if d.running => Resolution {
            status: Status::Running,
            clear_handle: false,
        },
        Some(d) if d.restarting => Resolution {
            status: Status::Provisioning,
            clear_handle: false,
        },
        Some(d) if d.dead || d.oom_killed => Resolution {
            status: Status::Failed,
            clear_handle: false,
        },
        Some(_) => Resolution {
            status: Status::Stopped,
            clear_handle: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(running: bool, restarting: bool, dead: bool, oom_killed: bool) -> ContainerDetails {
        ContainerDetails {
            running,
            restarting,
            dead,
            oom_killed,
            networks: Default::default(),
        }
    }

    #[test]
    fn test_missing_container_stops_and_clears_handle() {
        let r = resolve(None);
        assert_eq!(r.status, Status::Stopped);
        assert!(r.clear_handle);
    }

    #[test]
    fn test_running() {
        let r = resolve(Some(&details(true, false, false, false)));
        assert_eq!(r.status, Status::Running);
        assert!(!r.clear_handle);
    }

    #[test]
    fn test_restarting_maps_to_provisioning() {
        let r = resolve(Some(&details(false, true, false, false)));
        assert_eq!(r.status, Status::Provisioning);
    }

    #[test]
    fn test_dead_and_oom_map_to_failed() {
        assert_eq!(
            resolve(Some(&details(false, false, true, false))).status,
            Status::Failed
        );
        assert_eq!(
            resolve(Some(&details(false, false, false, true))).status,
            Status::Failed
        );
    }

    #[test]
    fn test_running_takes_priority_over_flags() {
        // a running container that was once OOM-killed is still running
        let r = resolve(Some(&details(true, false, false, true)));
        assert_eq!(r.status, Status::Running);
    }

    #[test]
    fn test_exited_maps_to_stopped() {
        let r = resolve(Some(&details(false, false, false, false)));
        assert_eq!(r.status, Status::Stopped);
        assert!(!r.clear_handle);
    }
}
