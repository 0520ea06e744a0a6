//! Controller-wide HA role management.
//!
//! Tracks the controller's current role, propagates changes to every
//! connected channel, and dampens role flapping: a change arriving within
//! the dampening window of the previous one is deferred, and a newer change
//! replaces the scheduled propagation outright. Only the most recent
//! `(role, description)` pair is ever propagated.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::updates::Update;
use super::Role;

/// A switch channel the role manager can push role requests into. The
/// channel handler implements this so the role manager never holds a
/// concrete handler type.
pub trait RoleRecipient: Send + Sync {
    fn channel_id(&self) -> u64;

    /// Send the given controller role to the switch.
    fn send_role_request(&self, role: Role);

    /// Send the role only if no request for it is already in flight.
    fn send_role_request_if_not_pending(&self, role: Role);
}

/// Snapshot of the controller's role for info consumers.
#[derive(Clone, Debug, Serialize)]
pub struct RoleInfo {
    pub role: Role,
    pub change_description: String,
    pub change_date: DateTime<Utc>,
}

impl RoleInfo {
    fn new(role: Role, change_description: String) -> Self {
        RoleInfo {
            role,
            change_description,
            change_date: Utc::now(),
        }
    }
}

struct RoleManagerInner {
    // The role set by set_role; it may not have been notified yet
    role: Role,
    change_description: String,
    last_change: Option<Instant>,
    // Updated when propagation actually runs
    current_role_info: RoleInfo,
    channels: HashMap<u64, Arc<dyn RoleRecipient>>,
}

pub struct RoleManager {
    inner: Mutex<RoleManagerInner>,
    updates_tx: mpsc::Sender<Update>,
    dampen: Duration,
    // Single-shot propagation timer; rescheduling replaces it
    propagation_task: Mutex<Option<JoinHandle<()>>>,
}

impl RoleManager {
    pub fn new(
        role: Role,
        change_description: &str,
        updates_tx: mpsc::Sender<Update>,
        dampen: Duration,
    ) -> Self {
        RoleManager {
            inner: Mutex::new(RoleManagerInner {
                role,
                change_description: change_description.to_string(),
                last_change: None,
                current_role_info: RoleInfo::new(role, change_description.to_string()),
                channels: HashMap::new(),
            }),
            updates_tx,
            dampen,
            propagation_task: Mutex::new(None),
        }
    }

    /// The role most recently set, whether or not it has been notified.
    pub fn current_role(&self) -> Role {
        self.inner.lock().expect("role manager lock poisoned").role
    }

    /// Defensive copy of the current role info.
    pub fn get_role_info(&self) -> RoleInfo {
        self.inner
            .lock()
            .expect("role manager lock poisoned")
            .current_role_info
            .clone()
    }

    /// Register a newly handshaked channel and push the current role to it.
    /// Every later role change reaches the channel as well.
    pub fn add_channel_and_send_initial_role(&self, channel: Arc<dyn RoleRecipient>) {
        let inner = &mut *self.inner.lock().expect("role manager lock poisoned");
        let role = inner.role;
        inner.channels.insert(channel.channel_id(), channel.clone());
        channel.send_role_request(role);
    }

    /// Remove a channel, e.g. on disconnect.
    pub fn remove_channel(&self, channel_id: u64) {
        self.inner
            .lock()
            .expect("role manager lock poisoned")
            .channels
            .remove(&channel_id);
    }

    /// Re-assert a role on one channel to recover from a spurious role
    /// change observed on the switch. No-op unless the controller still
    /// holds that role and no matching request is already in flight.
    pub fn reassert_role(&self, channel: &dyn RoleRecipient, role: Role) {
        let inner = self.inner.lock().expect("role manager lock poisoned");
        if inner.role != role {
            return;
        }
        channel.send_role_request_if_not_pending(role);
    }

    /// Set the controller's role. Idempotent for the current role. A change
    /// schedules propagation to all channels plus an HA update, deferred by
    /// the dampening window when the previous change was recent.
    pub fn set_role(self: &Arc<Self>, role: Role, description: &str) {
        let delay = {
            let mut inner = self.inner.lock().expect("role manager lock poisoned");
            if inner.role == role {
                debug!(
                    "Received role request for {} but controller is already {}; ignoring",
                    role, inner.role
                );
                return;
            }
            inner.role = role;
            inner.change_description = description.to_string();

            let now = Instant::now();
            let delay = match inner.last_change {
                Some(prev) if now.duration_since(prev) < self.dampen => {
                    debug!(
                        "Last role change was {:?} ago; dampening change to {}",
                        now.duration_since(prev),
                        role
                    );
                    self.dampen
                }
                _ => Duration::ZERO,
            };
            inner.last_change = Some(now);
            delay
        };
        self.reschedule_propagation(delay);
    }

    /// Cancel-and-replace the scheduled propagation. At most one
    /// propagation task exists at any time.
    fn reschedule_propagation(self: &Arc<Self>, delay: Duration) {
        let mut pending = self
            .propagation_task
            .lock()
            .expect("propagation lock poisoned");
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        let manager = Arc::clone(self);
        *pending = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            manager.do_set_role();
        }));
    }

    /// Push the current role to every channel and enqueue the HA update.
    /// Runs without suspension points so a replacement cannot split the
    /// channel notifications from the update.
    fn do_set_role(&self) {
        let role = {
            let mut inner = self.inner.lock().expect("role manager lock poisoned");
            inner.current_role_info =
                RoleInfo::new(inner.role, inner.change_description.clone());
            for channel in inner.channels.values() {
                channel.send_role_request(inner.role);
            }
            inner.role
        };
        if let Err(e) = self.updates_tx.try_send(Update::HaRoleChanged(role)) {
            warn!("Failure adding HA role update to queue: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct RecordingChannel {
        id: u64,
        roles: Mutex<Vec<Role>>,
        reasserts: AtomicU64,
    }

    impl RecordingChannel {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(RecordingChannel {
                id,
                roles: Mutex::new(Vec::new()),
                reasserts: AtomicU64::new(0),
            })
        }

        fn seen(&self) -> Vec<Role> {
            self.roles.lock().unwrap().clone()
        }
    }

    impl RoleRecipient for RecordingChannel {
        fn channel_id(&self) -> u64 {
            self.id
        }

        fn send_role_request(&self, role: Role) {
            self.roles.lock().unwrap().push(role);
        }

        fn send_role_request_if_not_pending(&self, role: Role) {
            self.reasserts.fetch_add(1, Ordering::SeqCst);
            self.roles.lock().unwrap().push(role);
        }
    }

    fn manager(dampen_ms: u64) -> (Arc<RoleManager>, mpsc::Receiver<Update>) {
        let (tx, rx) = mpsc::channel(64);
        let manager = Arc::new(RoleManager::new(
            Role::Master,
            "Controller startup.",
            tx,
            Duration::from_millis(dampen_ms),
        ));
        (manager, rx)
    }

    #[tokio::test]
    async fn test_add_channel_sends_initial_role() {
        let (manager, _rx) = manager(2000);
        let channel = RecordingChannel::new(1);
        manager.add_channel_and_send_initial_role(channel.clone());
        assert_eq!(channel.seen(), vec![Role::Master]);
    }

    #[tokio::test]
    async fn test_set_role_is_idempotent() {
        let (manager, mut rx) = manager(2000);
        let channel = RecordingChannel::new(1);
        manager.add_channel_and_send_initial_role(channel.clone());

        manager.set_role(Role::Master, "still master");
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Only the initial role was sent and no update was enqueued
        assert_eq!(channel.seen(), vec![Role::Master]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_role_change_propagates_and_enqueues_update() {
        let (manager, mut rx) = manager(2000);
        let channel = RecordingChannel::new(1);
        manager.add_channel_and_send_initial_role(channel.clone());

        manager.set_role(Role::Slave, "heartbeat lost");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(channel.seen(), vec![Role::Master, Role::Slave]);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Update::HaRoleChanged(Role::Slave)
        ));
        assert_eq!(manager.get_role_info().role, Role::Slave);
        assert_eq!(manager.get_role_info().change_description, "heartbeat lost");
    }

    #[tokio::test]
    async fn test_flap_dampening_collapses_changes() {
        let (manager, mut rx) = manager(300);
        let channel = RecordingChannel::new(1);
        manager.add_channel_and_send_initial_role(channel.clone());

        // First change propagates promptly
        manager.set_role(Role::Slave, "first");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.seen(), vec![Role::Master, Role::Slave]);

        // Two rapid changes inside the window collapse into the last one
        manager.set_role(Role::Equal, "second");
        manager.set_role(Role::Master, "third");
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Still dampened, nothing sent yet
        assert_eq!(channel.seen(), vec![Role::Master, Role::Slave]);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(channel.seen(), vec![Role::Master, Role::Slave, Role::Master]);

        // Updates mirror the propagated sequence
        assert!(matches!(
            rx.try_recv().unwrap(),
            Update::HaRoleChanged(Role::Slave)
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Update::HaRoleChanged(Role::Master)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reassert_role_requires_matching_role() {
        let (manager, _rx) = manager(2000);
        let channel = RecordingChannel::new(1);

        manager.reassert_role(channel.as_ref(), Role::Slave);
        assert_eq!(channel.reasserts.load(Ordering::SeqCst), 0);

        manager.reassert_role(channel.as_ref(), Role::Master);
        assert_eq!(channel.reasserts.load(Ordering::SeqCst), 1);
        assert_eq!(channel.seen(), vec![Role::Master]);
    }

    #[tokio::test]
    async fn test_removed_channel_stops_receiving_roles() {
        let (manager, _rx) = manager(2000);
        let channel = RecordingChannel::new(1);
        manager.add_channel_and_send_initial_role(channel.clone());
        manager.remove_channel(1);

        manager.set_role(Role::Slave, "gone");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.seen(), vec![Role::Master]);
    }
}
