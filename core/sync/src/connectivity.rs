//! Connectivity detection: passive link signal plus an active probe.
//!
//! The passive signal is authoritative for negative state (no link means
//! offline, full stop). The probe is authoritative for disproving
//! false-positive claims: a radio link with no real internet path behind it
//! reports up while nothing can actually be reached, so a failed probe
//! forces OFFLINE even when the link claims otherwise. A successful probe
//! never forces ONLINE while the link is down.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use medipost_remote::RemoteApi;

use crate::subscription::{SubscriberHandle, Subscribers};

/// One-shot reachability check with a bounded timeout.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Whether the server answered within the probe's timeout.
    async fn check(&self) -> bool;
}

/// Probe backed by the remote API's health endpoint.
pub struct RemoteProbe {
    api: Arc<dyn RemoteApi>,
    timeout: Duration,
}

impl RemoteProbe {
    pub fn new(api: Arc<dyn RemoteApi>, timeout: Duration) -> Self {
        Self { api, timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for RemoteProbe {
    async fn check(&self) -> bool {
        // The outer timeout guards implementations that forget their own.
        match tokio::time::timeout(self.timeout, self.api.health()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Probe timed out after {:?}", self.timeout);
                false
            }
        }
    }
}

struct MonitorInner {
    link_up: AtomicBool,
    probe_ok: AtomicBool,
    online: AtomicBool,
    /// Last state subscribers were told about; a flap that settles back on
    /// this state produces no notification.
    notified: AtomicBool,
    generation: AtomicU64,
    window: Duration,
    probe: Arc<dyn ReachabilityProbe>,
    subscribers: Subscribers<bool>,
}

/// Process-wide ONLINE/OFFLINE state machine.
///
/// Cheap to clone; all clones observe the same state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    /// Create a monitor. ONLINE is initial when the platform link signal
    /// reports connected.
    ///
    /// `window` is the hysteresis applied before subscribers are notified of
    /// a state change; flaps shorter than the window are invisible to them.
    /// Pass `Duration::ZERO` for synchronous notification (tests).
    pub fn new(
        probe: Arc<dyn ReachabilityProbe>,
        link_initially_up: bool,
        window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                link_up: AtomicBool::new(link_initially_up),
                probe_ok: AtomicBool::new(true),
                online: AtomicBool::new(link_initially_up),
                notified: AtomicBool::new(link_initially_up),
                generation: AtomicU64::new(0),
                window,
                probe,
                subscribers: Subscribers::new(),
            }),
        }
    }

    /// Instantaneous snapshot of the effective state.
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Feed the platform's passive network signal.
    ///
    /// A link-up transition optimistically resets the probe verdict; the
    /// next probe gets to disprove it.
    pub fn set_link_state(&self, up: bool) {
        self.inner.link_up.store(up, Ordering::SeqCst);
        if up {
            self.inner.probe_ok.store(true, Ordering::SeqCst);
        }
        self.recompute();
    }

    /// Run the active probe and fold its verdict into the state.
    ///
    /// Returns the effective online state afterwards. Used by the engine
    /// before starting a cycle.
    pub async fn probe(&self) -> bool {
        let ok = self.inner.probe.check().await;
        self.inner.probe_ok.store(ok, Ordering::SeqCst);
        self.recompute();
        self.is_online()
    }

    /// Subscribe to debounced ONLINE/OFFLINE transitions.
    pub fn subscribe(&self, callback: impl Fn(&bool) + Send + Sync + 'static) -> SubscriberHandle {
        self.inner.subscribers.subscribe(callback)
    }

    fn recompute(&self) {
        let effective =
            self.inner.link_up.load(Ordering::SeqCst) && self.inner.probe_ok.load(Ordering::SeqCst);
        let previous = self.inner.online.swap(effective, Ordering::SeqCst);
        if previous == effective {
            return;
        }

        info!(
            "Connectivity: {}",
            if effective { "ONLINE" } else { "OFFLINE" }
        );
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if self.inner.window.is_zero() {
            if self.inner.notified.swap(effective, Ordering::SeqCst) != effective {
                self.inner.subscribers.notify(&effective);
            }
            return;
        }

        // Notify only if the state survives the hysteresis window and
        // actually differs from what subscribers last saw.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            let stable = inner.generation.load(Ordering::SeqCst) == generation
                && inner.online.load(Ordering::SeqCst) == effective;
            if stable && inner.notified.swap(effective, Ordering::SeqCst) != effective {
                inner.subscribers.notify(&effective);
            } else if !stable {
                debug!("Connectivity flap suppressed by hysteresis");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FixedProbe(AtomicBool);

    #[async_trait]
    impl ReachabilityProbe for FixedProbe {
        async fn check(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn monitor(probe_answers: bool, link_up: bool) -> (ConnectivityMonitor, Arc<FixedProbe>) {
        let probe = Arc::new(FixedProbe(AtomicBool::new(probe_answers)));
        let monitor = ConnectivityMonitor::new(probe.clone(), link_up, Duration::ZERO);
        (monitor, probe)
    }

    #[tokio::test]
    async fn test_initial_state_follows_link_signal() {
        let (online, _) = monitor(true, true);
        assert!(online.is_online());

        let (offline, _) = monitor(true, false);
        assert!(!offline.is_online());
    }

    #[tokio::test]
    async fn test_failed_probe_forces_offline_despite_link() {
        let (m, probe) = monitor(true, true);
        assert!(m.is_online());

        probe.0.store(false, Ordering::SeqCst);
        assert!(!m.probe().await);
        assert!(!m.is_online());
    }

    #[tokio::test]
    async fn test_successful_probe_does_not_force_online_when_link_down() {
        let (m, _) = monitor(true, false);
        assert!(!m.probe().await);
        assert!(!m.is_online());
    }

    #[tokio::test]
    async fn test_link_recovery_resets_probe_verdict() {
        let (m, probe) = monitor(false, true);
        assert!(!m.probe().await);

        // Link bounces; the stale probe verdict must not pin us offline.
        probe.0.store(true, Ordering::SeqCst);
        m.set_link_state(false);
        m.set_link_state(true);
        assert!(m.is_online());
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let (m, _) = monitor(true, true);
        let transitions = Arc::new(AtomicU32::new(0));

        let seen = transitions.clone();
        let _handle = m.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        m.set_link_state(false);
        m.set_link_state(true);
        // same-state updates are not transitions
        m.set_link_state(true);

        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hysteresis_suppresses_flaps() {
        let probe = Arc::new(FixedProbe(AtomicBool::new(true)));
        let m = ConnectivityMonitor::new(probe, true, Duration::from_millis(50));

        let transitions = Arc::new(AtomicU32::new(0));
        let seen = transitions.clone();
        let _handle = m.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        // Flap faster than the window: down and straight back up.
        m.set_link_state(false);
        m.set_link_state(true);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(transitions.load(Ordering::SeqCst), 0);
    }
}
