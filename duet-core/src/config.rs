//! Timing configuration for the reconciliation and presence machinery.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Grace windows and timers used by the bindings and the awareness channel.
///
/// The reconciler's guard order is fixed in code; these values only tune
/// how long each window lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTimings {
    /// Outbound scene propagation debounce. Default: 100ms.
    pub debounce_ms: u64,
    /// Window after an inbound scene replace during which scene-changed
    /// callbacks are treated as the widget's own re-render. Default: 150ms.
    pub echo_suppression_ms: u64,
    /// Soft timeout for the initial snapshot. Default: 1.5s.
    pub sync_grace_ms: u64,
    /// Window after entering `Bound` during which an empty local scene is an
    /// initialization race rather than a clear. Default: 2s.
    pub anti_wipe_window_ms: u64,
    /// Silence after which a peer's presence is dropped. Default: 30s.
    pub presence_timeout_ms: u64,
    /// Local presence heartbeat interval. Default: 15s.
    pub presence_renew_ms: u64,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            echo_suppression_ms: 150,
            sync_grace_ms: 1500,
            anti_wipe_window_ms: 2000,
            presence_timeout_ms: 30_000,
            presence_renew_ms: 15_000,
        }
    }
}

impl SyncTimings {
    /// Short windows for tests that drive real timers.
    pub fn for_testing() -> Self {
        Self {
            debounce_ms: 20,
            echo_suppression_ms: 30,
            sync_grace_ms: 200,
            anti_wipe_window_ms: 300,
            presence_timeout_ms: 500,
            presence_renew_ms: 200,
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn echo_suppression(&self) -> Duration {
        Duration::from_millis(self.echo_suppression_ms)
    }

    pub fn sync_grace(&self) -> Duration {
        Duration::from_millis(self.sync_grace_ms)
    }

    pub fn anti_wipe_window(&self) -> Duration {
        Duration::from_millis(self.anti_wipe_window_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    pub fn presence_renew(&self) -> Duration {
        Duration::from_millis(self.presence_renew_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let t = SyncTimings::default();
        assert_eq!(t.debounce(), Duration::from_millis(100));
        assert_eq!(t.presence_timeout(), Duration::from_secs(30));
        assert!(t.presence_renew() < t.presence_timeout());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let t: SyncTimings = serde_json::from_str(r#"{ "debounce_ms": 250 }"#).unwrap();
        assert_eq!(t.debounce_ms, 250);
        assert_eq!(t.sync_grace_ms, SyncTimings::default().sync_grace_ms);
    }
}
