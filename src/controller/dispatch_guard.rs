//! Dispatch guard for message delivery during role transitions.
//!
//! Messages are only dispatched to listeners while the controller acts as
//! MASTER/EQUAL. The guard is a readers-writer latch over a single flag:
//! dispatchers hold it shared, and the role transition holds it exclusive,
//! which blocks until every in-flight dispatch has drained. That is what
//! makes the SLAVE transition atomic from a listener's point of view.
use tokio::sync::{RwLock, RwLockReadGuard};

pub struct MessageDispatchGuard {
    dispatch_enabled: RwLock<bool>,
}

/// Shared hold on the guard. Dispatch is permitted only while this value is
/// alive and `dispatch_enabled` returns true.
pub struct DispatchPermit<'a> {
    enabled: RwLockReadGuard<'a, bool>,
}

impl DispatchPermit<'_> {
    pub fn dispatch_enabled(&self) -> bool {
        *self.enabled
    }
}

impl MessageDispatchGuard {
    pub fn new(dispatch_allowed: bool) -> Self {
        MessageDispatchGuard {
            dispatch_enabled: RwLock::new(dispatch_allowed),
        }
    }

    /// Enable dispatching. Waits for every shared holder to release.
    pub async fn enable_dispatch(&self) {
        *self.dispatch_enabled.write().await = true;
    }

    /// Disable dispatching. Waits for every shared holder to release, so on
    /// return no listener can still observe a pre-transition message.
    pub async fn disable_dispatch(&self) {
        *self.dispatch_enabled.write().await = false;
    }

    /// Acquire the guard in shared mode. Check `dispatch_enabled` before
    /// delivering anything.
    pub async fn acquire(&self) -> DispatchPermit<'_> {
        DispatchPermit {
            enabled: self.dispatch_enabled.read().await,
        }
    }
}
