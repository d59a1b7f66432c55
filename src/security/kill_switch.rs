//! Kill switch state tracking.
//!
//! The manager publishes whether the tunnel is healthy so that whoever owns
//! the network path (a client-side firewall hook, a supervising process) can
//! block traffic the moment the tunnel goes down. Health is derived from
//! heartbeats: every successfully deobfuscated payload counts as one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Current state of the kill switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchState {
    /// The tunnel is up and healthy
    Active,
    /// The tunnel is down or compromised; network access should be blocked
    Triggered,
    /// Kill switch disabled, or no tunnel activity seen yet
    Disabled,
}

/// Manages the kill switch state and its health monitor
#[derive(Clone)]
pub struct KillSwitchManager {
    state_sender: Arc<watch::Sender<KillSwitchState>>,
    state_receiver: watch::Receiver<KillSwitchState>,
    is_enabled: Arc<AtomicBool>,
    last_heartbeat: Arc<Mutex<Option<Instant>>>,
}

impl KillSwitchManager {
    pub fn new(enabled_by_config: bool) -> Self {
        let (state_sender, state_receiver) = watch::channel(KillSwitchState::Disabled);

        if enabled_by_config {
            info!("Kill switch enabled, waiting for tunnel activation");
        } else {
            info!("Kill switch disabled by configuration");
        }

        Self {
            state_sender: Arc::new(state_sender),
            state_receiver,
            is_enabled: Arc::new(AtomicBool::new(enabled_by_config)),
            last_heartbeat: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled.load(Ordering::SeqCst)
    }

    /// Receiver for observing state changes
    pub fn subscribe_state(&self) -> watch::Receiver<KillSwitchState> {
        self.state_receiver.clone()
    }

    pub fn state(&self) -> KillSwitchState {
        *self.state_receiver.borrow()
    }

    /// Set the state. Ignored while the kill switch is disabled; subscribers
    /// are only notified on an actual change.
    pub fn set_state(&self, new_state: KillSwitchState) {
        if !self.is_enabled() {
            if new_state != KillSwitchState::Disabled {
                debug!(
                    "Kill switch is disabled, ignoring transition to {:?}",
                    new_state
                );
            }
            return;
        }

        let changed = self.state_sender.send_if_modified(|state| {
            if *state == new_state {
                false
            } else {
                *state = new_state;
                true
            }
        });

        if changed {
            match new_state {
                KillSwitchState::Triggered => warn!("Kill switch triggered"),
                _ => info!("Kill switch state changed to {:?}", new_state),
            }
        }
    }

    /// Record tunnel activity. Activates the kill switch on the first
    /// heartbeat and recovers it after a trigger.
    pub fn record_heartbeat(&self) {
        if let Ok(mut last) = self.last_heartbeat.lock() {
            *last = Some(Instant::now());
        }

        if self.is_enabled() && self.state() != KillSwitchState::Active {
            self.set_state(KillSwitchState::Active);
        }
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat.lock().ok().and_then(|last| *last)
    }

    /// Trigger when the tunnel has been silent for longer than `timeout`
    pub fn check_health(&self, now: Instant, timeout: Duration) -> KillSwitchState {
        if self.state() == KillSwitchState::Active {
            if let Some(last) = self.last_heartbeat() {
                let silent_for = now.saturating_duration_since(last);
                if silent_for > timeout {
                    warn!(
                        "No tunnel heartbeat for {:?} (timeout {:?})",
                        silent_for, timeout
                    );
                    self.set_state(KillSwitchState::Triggered);
                }
            }
        }

        self.state()
    }

    /// Run health checks every `interval` until `shutdown` flips to true
    pub async fn run_health_monitor(
        &self,
        interval: Duration,
        timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if !self.is_enabled() || interval.is_zero() {
            return;
        }

        debug!("Kill switch health monitor running every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_health(Instant::now(), timeout);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Kill switch health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kill_switch_flow() {
        let manager = KillSwitchManager::new(true);
        let mut receiver = manager.subscribe_state();
        let timeout = Duration::from_secs(5);

        assert_eq!(*receiver.borrow(), KillSwitchState::Disabled);

        manager.record_heartbeat();
        receiver.changed().await.unwrap();
        assert_eq!(*receiver.borrow_and_update(), KillSwitchState::Active);

        // Healthy: within the timeout
        assert_eq!(
            manager.check_health(Instant::now(), timeout),
            KillSwitchState::Active
        );

        // Silent for longer than the timeout
        let later = Instant::now() + timeout * 2;
        assert_eq!(manager.check_health(later, timeout), KillSwitchState::Triggered);
        receiver.changed().await.unwrap();
        assert_eq!(*receiver.borrow_and_update(), KillSwitchState::Triggered);

        // Recovery
        manager.record_heartbeat();
        receiver.changed().await.unwrap();
        assert_eq!(*receiver.borrow_and_update(), KillSwitchState::Active);
    }

    #[tokio::test]
    async fn test_kill_switch_disabled() {
        let manager = KillSwitchManager::new(false);
        let receiver = manager.subscribe_state();

        manager.set_state(KillSwitchState::Active);
        assert_eq!(*receiver.borrow(), KillSwitchState::Disabled);

        manager.record_heartbeat();
        manager.set_state(KillSwitchState::Triggered);
        assert_eq!(*receiver.borrow(), KillSwitchState::Disabled);
        assert!(manager.last_heartbeat().is_some());
    }

    #[test]
    fn test_unchanged_state_does_not_notify() {
        let manager = KillSwitchManager::new(true);
        let mut receiver = manager.subscribe_state();

        manager.set_state(KillSwitchState::Active);
        assert!(receiver.has_changed().unwrap());
        receiver.borrow_and_update();

        manager.set_state(KillSwitchState::Active);
        assert!(!receiver.has_changed().unwrap());
    }

    #[test]
    fn test_no_trigger_before_activation() {
        let manager = KillSwitchManager::new(true);
        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(
            manager.check_health(later, Duration::from_secs(1)),
            KillSwitchState::Disabled
        );
    }

    #[tokio::test]
    async fn test_health_monitor_triggers_and_stops() {
        let manager = KillSwitchManager::new(true);
        let mut receiver = manager.subscribe_state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        manager.record_heartbeat();
        receiver.borrow_and_update();

        let monitor = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .run_health_monitor(
                        Duration::from_millis(10),
                        Duration::from_millis(40),
                        shutdown_rx,
                    )
                    .await;
            })
        };

        tokio::time::timeout(Duration::from_secs(2), receiver.changed())
            .await
            .expect("kill switch never triggered")
            .unwrap();
        assert_eq!(manager.state(), KillSwitchState::Triggered);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), monitor)
            .await
            .expect("health monitor did not stop")
            .unwrap();
    }
}
