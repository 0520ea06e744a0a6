//! Lifecycle updates drained by the controller's single dispatch loop.
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use super::{Controller, Role};
use crate::error::Result;
use crate::switch::{Dpid, OfSwitch};

/// Tagged update consumed by [`Controller::run`]. Once dequeued, each update
/// synchronously invokes its registered listeners.
#[derive(Debug)]
pub enum Update {
    SwitchAdded(Arc<OfSwitch>),
    SwitchRemoved(Arc<OfSwitch>),
    SwitchPortChanged(Dpid),
    HaRoleChanged(Role),
    ControllerNodeIpsChanged {
        current: HashMap<String, String>,
        added: HashMap<String, String>,
        removed: HashMap<String, String>,
    },
}

impl Update {
    pub(crate) async fn dispatch(&self, controller: &Controller) -> Result<()> {
        match self {
            Update::SwitchAdded(sw) => {
                trace!("Dispatching switch update {} added", sw);
                for listener in controller.switch_listeners_snapshot().iter() {
                    listener.switch_added(sw)?;
                }
            }
            Update::SwitchRemoved(sw) => {
                trace!("Dispatching switch update {} removed", sw);
                for listener in controller.switch_listeners_snapshot().iter() {
                    listener.switch_removed(sw)?;
                }
            }
            Update::SwitchPortChanged(dpid) => {
                trace!("Dispatching port change for {:#x}", dpid);
                for listener in controller.switch_listeners_snapshot().iter() {
                    listener.switch_port_changed(*dpid)?;
                }
            }
            Update::HaRoleChanged(new_role) => {
                debug!("Dispatching HA role update, new role = {}", new_role);
                // Block message dispatch before anyone learns about SLAVE:
                // once disable_dispatch returns, no in-flight message can
                // still reach a listener.
                if *new_role == Role::Slave {
                    controller.dispatch_guard().disable_dispatch().await;
                    controller.set_notified_role(*new_role);
                }
                for listener in controller.ha_listeners_snapshot().iter() {
                    listener.role_changed(*new_role)?;
                }
                if *new_role != Role::Slave {
                    controller.dispatch_guard().enable_dispatch().await;
                    controller.set_notified_role(*new_role);
                }
            }
            Update::ControllerNodeIpsChanged {
                current,
                added,
                removed,
            } => {
                trace!(
                    "Dispatching controller node IP update: cur={:?} added={:?} removed={:?}",
                    current,
                    added,
                    removed
                );
                for listener in controller.ha_listeners_snapshot().iter() {
                    listener.controller_node_ips_changed(current, added, removed)?;
                }
            }
        }
        Ok(())
    }
}
