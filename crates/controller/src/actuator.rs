//! Pump actuator state machine with a bounded burst.
//!
//! ```text
//! Idle ──activate(reason)──▶ Active ──deactivate(reason)──────────▶ Idle
//!  ▲                           │
//!  └──[burst elapsed]── deactivate("<reason>_timeout") ◀──┘
//!
//! any ──shutdown──▶ Shutdown   (terminal, drivers released)
//! ```
//!
//! Every activation arms exactly one auto-off timer.  Re-activating while
//! active leaves the running burst untouched, so the relay is never held on
//! for longer than one burst no matter how often it is re-triggered.
//!
//! The timer fires on its own task and takes the same lock as the main-loop
//! handlers.  It carries the id of the burst it was armed for; if that burst
//! has already ended (the abort lost the race) the firing is a no-op.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::indicator::{self, Indicator, Rgb};
use crate::relay::RelayDriver;

// ---------------------------------------------------------------------------
// Published view of the actuator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    On,
    Off,
}

/// Actuator context stamped on every telemetry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelaySnapshot {
    pub relay_state: RelayState,
    pub relay_reason: String,
    /// Start of the most recent burst (ms epoch), `0` if there was none.
    pub last_relay_start_ts: i64,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct OffTimer {
    burst: u64,
    handle: JoinHandle<()>,
}

impl OffTimer {
    /// Best-effort; aborting a finished or already-aborted task is a no-op.
    fn cancel(self) {
        self.handle.abort();
    }
}

enum Phase {
    Idle,
    Active { since_ms: i64, off_timer: OffTimer },
    Shutdown,
}

struct Drivers {
    relay: Box<dyn RelayDriver>,
    indicator: Box<dyn Indicator>,
}

struct Inner {
    phase: Phase,
    reason: String,
    last_start_ms: i64,
    bursts: u64,
    drivers: Option<Drivers>,
}

impl Inner {
    fn write_outputs(&mut self, energized: bool) {
        if let Some(d) = self.drivers.as_mut() {
            d.relay.set_energized(energized);
            d.indicator.set_color(indicator::color_for(energized));
        }
    }

    /// Active → Idle.  Hands back the pending timer so the caller decides
    /// whether it must be aborted.
    fn stop(&mut self, reason: &str) -> Option<OffTimer> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Active { off_timer, .. } => {
                self.reason = reason.to_string();
                self.write_outputs(false);
                info!(reason, "pump stop");
                Some(off_timer)
            }
            other => {
                self.phase = other;
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Actuator handle
// ---------------------------------------------------------------------------

/// Cheap to clone; all clones drive the same relay.
#[derive(Clone)]
pub struct Actuator {
    inner: Arc<Mutex<Inner>>,
    burst: Duration,
}

impl Actuator {
    /// Take ownership of the drivers, force the relay off and show the idle
    /// colour.
    pub fn new(relay: Box<dyn RelayDriver>, indicator: Box<dyn Indicator>, burst: Duration) -> Self {
        let mut inner = Inner {
            phase: Phase::Idle,
            reason: "boot".into(),
            last_start_ms: 0,
            bursts: 0,
            drivers: Some(Drivers { relay, indicator }),
        };
        inner.write_outputs(false);

        Self {
            inner: Arc::new(Mutex::new(inner)),
            burst,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Energize the relay for one burst.  Returns `false` when nothing
    /// changed (already active, or shut down).
    ///
    /// Must be called from within a tokio runtime (the auto-off timer is a
    /// spawned task).
    pub fn activate(&self, reason: &str) -> bool {
        let mut inner = self.lock();
        match inner.phase {
            Phase::Idle => {}
            Phase::Active { .. } => {
                debug!(reason, current = %inner.reason, "pump already running — burst unchanged");
                return false;
            }
            Phase::Shutdown => {
                warn!(reason, "activate after shutdown ignored");
                return false;
            }
        }

        inner.bursts += 1;
        let burst = inner.bursts;
        let now = crate::now_ms();
        let off_timer = self.arm_off_timer(burst, format!("{reason}_timeout"));

        inner.phase = Phase::Active {
            since_ms: now,
            off_timer,
        };
        inner.reason = reason.to_string();
        inner.last_start_ms = now;
        inner.write_outputs(true);

        info!(
            reason,
            burst_ms = self.burst.as_millis() as u64,
            ts = now,
            "pump start"
        );
        true
    }

    /// De-energize the relay and cancel the pending auto-off.  Returns `false`
    /// when the relay was not running.
    pub fn deactivate(&self, reason: &str) -> bool {
        let mut inner = self.lock();
        if matches!(inner.phase, Phase::Shutdown) {
            warn!(reason, "deactivate after shutdown ignored");
            return false;
        }
        match inner.stop(reason) {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }

    /// Terminal transition: stop the pump, darken the LED and release the
    /// drivers.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if matches!(inner.phase, Phase::Shutdown) {
            return;
        }
        if let Some(timer) = inner.stop("shutdown") {
            timer.cancel();
        }
        inner.reason = "shutdown".into();
        inner.phase = Phase::Shutdown;

        if let Some(mut d) = inner.drivers.take() {
            d.relay.set_energized(false);
            d.indicator.set_color(Rgb::OFF);
        }
        info!("actuator shut down — drivers released");
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        let inner = self.lock();
        RelaySnapshot {
            relay_state: match inner.phase {
                Phase::Active { .. } => RelayState::On,
                _ => RelayState::Off,
            },
            relay_reason: inner.reason.clone(),
            last_relay_start_ts: inner.last_start_ms,
        }
    }

    pub fn is_energized(&self) -> bool {
        matches!(self.lock().phase, Phase::Active { .. })
    }

    /// Start of the current burst; `None` while idle.
    pub fn activation_ts(&self) -> Option<i64> {
        match self.lock().phase {
            Phase::Active { since_ms, .. } => Some(since_ms),
            _ => None,
        }
    }

    fn arm_off_timer(&self, burst: u64, reason: String) -> OffTimer {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.burst).await;
            this.expire(burst, &reason);
        });
        OffTimer { burst, handle }
    }

    /// Auto-off for `burst`.  Ignored unless that burst is still running.
    fn expire(&self, burst: u64, reason: &str) {
        let mut inner = self.lock();
        match &inner.phase {
            Phase::Active { off_timer, .. } if off_timer.burst == burst => {}
            _ => {
                debug!(burst, "stale auto-off ignored");
                return;
            }
        }
        // Running on the timer's own task: dropping the handle detaches it.
        drop(inner.stop(reason));
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    const BURST: Duration = Duration::from_millis(5000);

    /// Shared log of every driver write, for assertions after the drivers
    /// have been moved into the actuator.
    #[derive(Clone, Default)]
    struct Recorder {
        relay: Arc<Mutex<Vec<bool>>>,
        colors: Arc<Mutex<Vec<Rgb>>>,
    }

    struct RecordingRelay(Arc<Mutex<Vec<bool>>>);
    struct RecordingLed(Arc<Mutex<Vec<Rgb>>>);

    impl RelayDriver for RecordingRelay {
        fn set_energized(&mut self, on: bool) {
            self.0.lock().unwrap().push(on);
        }
    }

    impl Indicator for RecordingLed {
        fn set_color(&mut self, color: Rgb) {
            self.0.lock().unwrap().push(color);
        }
    }

    impl Recorder {
        fn relay_writes(&self) -> Vec<bool> {
            self.relay.lock().unwrap().clone()
        }

        fn last_color(&self) -> Option<Rgb> {
            self.colors.lock().unwrap().last().copied()
        }
    }

    fn actuator() -> (Actuator, Recorder) {
        let rec = Recorder::default();
        let act = Actuator::new(
            Box::new(RecordingRelay(Arc::clone(&rec.relay))),
            Box::new(RecordingLed(Arc::clone(&rec.colors))),
            BURST,
        );
        (act, rec)
    }

    fn has_pending_off(act: &Actuator) -> bool {
        matches!(act.lock().phase, Phase::Active { .. })
    }

    fn assert_invariants(act: &Actuator) {
        let energized = act.is_energized();
        assert_eq!(act.activation_ts().is_some(), energized);
        assert_eq!(has_pending_off(act), energized);
    }

    // -- Construction -------------------------------------------------------

    #[tokio::test]
    async fn starts_idle_with_boot_reason() {
        let (act, rec) = actuator();
        let snap = act.snapshot();
        assert_eq!(snap.relay_state, RelayState::Off);
        assert_eq!(snap.relay_reason, "boot");
        assert_eq!(snap.last_relay_start_ts, 0);
        assert_eq!(rec.relay_writes(), vec![false]);
        assert_eq!(rec.last_color(), Some(Rgb::IDLE));
        assert_invariants(&act);
    }

    // -- Activate -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn activate_idle_energizes() {
        let (act, rec) = actuator();
        assert!(act.activate("manual_burst"));

        assert!(act.is_energized());
        assert!(act.activation_ts().is_some());
        assert_eq!(rec.relay_writes(), vec![false, true]);
        assert_eq!(rec.last_color(), Some(Rgb::ACTIVE));

        let snap = act.snapshot();
        assert_eq!(snap.relay_state, RelayState::On);
        assert_eq!(snap.relay_reason, "manual_burst");
        assert_eq!(Some(snap.last_relay_start_ts), act.activation_ts());
        assert_invariants(&act);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_ends_after_duration() {
        let (act, rec) = actuator();
        act.activate("manual_burst");

        sleep(Duration::from_millis(4999)).await;
        assert!(act.is_energized(), "relay should still run just before the burst ends");

        sleep(Duration::from_millis(2)).await;
        assert!(!act.is_energized());
        assert_eq!(act.snapshot().relay_reason, "manual_burst_timeout");
        assert_eq!(rec.relay_writes(), vec![false, true, false]);
        assert_eq!(rec.last_color(), Some(Rgb::IDLE));
        assert_invariants(&act);
    }

    #[tokio::test(start_paused = true)]
    async fn retrigger_does_not_extend_burst() {
        let (act, rec) = actuator();
        act.activate("manual_burst");

        sleep(Duration::from_millis(2000)).await;
        assert!(!act.activate("auto_soil_high"), "retrigger must be a no-op");
        assert_eq!(act.snapshot().relay_reason, "manual_burst");

        // One burst from the *first* activation.
        sleep(Duration::from_millis(3001)).await;
        assert!(!act.is_energized());
        assert_eq!(act.snapshot().relay_reason, "manual_burst_timeout");

        // No second timer fires later.
        sleep(BURST * 2).await;
        assert_eq!(rec.relay_writes(), vec![false, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn retrigger_keeps_start_timestamp() {
        let (act, _rec) = actuator();
        act.activate("auto_soil_high");
        let first = act.activation_ts();

        sleep(Duration::from_millis(1000)).await;
        act.activate("manual_burst");
        assert_eq!(act.activation_ts(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn new_burst_after_timeout() {
        let (act, rec) = actuator();
        act.activate("auto_soil_high");
        sleep(BURST + Duration::from_millis(1)).await;
        assert!(!act.is_energized());

        assert!(act.activate("manual_burst"));
        assert!(act.is_energized());
        sleep(BURST + Duration::from_millis(1)).await;
        assert!(!act.is_energized());
        assert_eq!(rec.relay_writes(), vec![false, true, false, true, false]);
    }

    // -- Deactivate ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn deactivate_is_idempotent() {
        let (act, _rec) = actuator();
        act.activate("manual_burst");

        assert!(act.deactivate("manual_stop"));
        assert!(!act.deactivate("manual_stop"));
        assert!(!act.is_energized());
        assert_eq!(act.snapshot().relay_reason, "manual_stop");
        assert_invariants(&act);
    }

    #[tokio::test]
    async fn deactivate_idle_is_noop() {
        let (act, rec) = actuator();
        assert!(!act.deactivate("whatever"));
        assert_eq!(act.snapshot().relay_reason, "boot");
        assert_eq!(rec.relay_writes(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_cancels_pending_timer() {
        let (act, rec) = actuator();
        act.activate("manual_burst");
        sleep(Duration::from_millis(1000)).await;
        act.deactivate("manual_stop");

        // Second burst starts at t=2000 and must survive past t=5000, when the
        // first burst's timer would have fired.
        sleep(Duration::from_millis(1000)).await;
        act.activate("auto_soil_high");
        sleep(Duration::from_millis(3500)).await;
        assert!(act.is_energized());
        assert_eq!(act.snapshot().relay_reason, "auto_soil_high");

        sleep(Duration::from_millis(1501)).await;
        assert!(!act.is_energized());
        assert_eq!(act.snapshot().relay_reason, "auto_soil_high_timeout");
        assert_eq!(rec.relay_writes(), vec![false, true, false, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_expiry_is_ignored() {
        let (act, _rec) = actuator();
        act.activate("manual_burst"); // burst 1
        act.deactivate("manual_stop");
        act.activate("auto_soil_high"); // burst 2

        act.expire(1, "manual_burst_timeout");
        assert!(act.is_energized());
        assert_eq!(act.snapshot().relay_reason, "auto_soil_high");
    }

    // -- Shutdown -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn shutdown_forces_off_and_releases_drivers() {
        let (act, rec) = actuator();
        act.activate("manual_burst");
        act.shutdown();

        assert!(!act.is_energized());
        assert_eq!(act.snapshot().relay_reason, "shutdown");
        assert_eq!(rec.relay_writes().last(), Some(&false));
        assert_eq!(rec.last_color(), Some(Rgb::OFF));
        assert!(act.lock().drivers.is_none());

        // Nothing fires after shutdown.
        let writes = rec.relay_writes().len();
        sleep(BURST * 2).await;
        assert_eq!(rec.relay_writes().len(), writes);
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let (act, rec) = actuator();
        act.shutdown();
        act.shutdown();

        assert!(!act.activate("manual_burst"));
        assert!(!act.deactivate("manual_stop"));
        assert!(!act.is_energized());
        assert_eq!(rec.last_color(), Some(Rgb::OFF));
    }

    // -- Concurrency --------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_keep_invariants() {
        let rec = Recorder::default();
        let act = Actuator::new(
            Box::new(RecordingRelay(Arc::clone(&rec.relay))),
            Box::new(RecordingLed(Arc::clone(&rec.colors))),
            Duration::from_millis(2),
        );

        let mut tasks = Vec::new();
        for i in 0..8 {
            let act = act.clone();
            tasks.push(tokio::spawn(async move {
                for j in 0..50 {
                    if (i + j) % 3 == 0 {
                        act.deactivate("manual_stop");
                    } else {
                        act.activate("manual_burst");
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        act.deactivate("test_end");
        assert_invariants(&act);

        // Relay writes strictly alternate after the initial OFF.
        let writes = rec.relay_writes();
        for pair in writes[1..].windows(2) {
            assert_ne!(pair[0], pair[1], "relay written twice in the same state: {writes:?}");
        }
    }
}
