//! Offline session handling.
//!
//! When the pre-sync probe reports no connectivity, the session runs against
//! local state only: no fetch, no pull, no push. Commits pile up locally and
//! are reconciled by the next online pre-sync, which routes through the
//! Stage-1 resolver if the remote advanced in the meantime.

use std::path::Path;

use log::info;

use crate::inspect;
use crate::network;
use crate::progress::UiSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Online,
    Offline,
}

/// Probes connectivity and announces the resulting session mode.
pub fn detect(remote_url: &str, ui: &dyn UiSink) -> SessionMode {
    if remote_url.is_empty() {
        ui.log("No remote configured; running in offline mode", None);
        return SessionMode::Offline;
    }
    if network::online(remote_url) {
        SessionMode::Online
    } else {
        ui.log("Network unavailable; running in offline mode", None);
        SessionMode::Offline
    }
}

/// Pending work carried by an offline session.
#[derive(Debug, Default)]
pub struct OfflineLedger {
    pub pending_at_start: usize,
}

impl OfflineLedger {
    /// Counts commits not yet on the last-known remote head. No fetch is
    /// attempted; the tracking ref may be stale, which is fine for reporting.
    pub fn begin(vault: &Path, ui: &dyn UiSink) -> Self {
        let pending_at_start = inspect::unpushed_commits(vault)
            .map(|commits| commits.len())
            .unwrap_or(0);
        if pending_at_start > 0 {
            ui.log(
                &format!("{pending_at_start} unpushed commit(s) waiting for the next online sync"),
                None,
            );
        }
        OfflineLedger { pending_at_start }
    }

    pub fn finish(&self, vault: &Path, ui: &dyn UiSink) {
        let pending = inspect::unpushed_commits(vault)
            .map(|commits| commits.len())
            .unwrap_or(self.pending_at_start);
        info!("offline session finished with {pending} pending commit(s)");
        ui.log(
            &format!(
                "Offline session complete; {pending} commit(s) will be pushed on the next online start"
            ),
            None,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::progress::NullSink;

    #[test]
    fn test_detect_without_remote_is_offline() {
        assert_eq!(detect("", &NullSink), SessionMode::Offline);
    }

    #[test]
    fn test_detect_unreachable_remote_is_offline() {
        assert_eq!(
            detect("ssh://127.0.0.1:1/vault.git", &NullSink),
            SessionMode::Offline
        );
    }

    #[test]
    fn test_detect_local_path_is_online() {
        assert_eq!(detect("/srv/git/vault.git", &NullSink), SessionMode::Online);
    }
}
