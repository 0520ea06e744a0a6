//! Listener contracts and ordered dispatch.
//!
//! Message listeners register per OpenFlow type and may declare ordering
//! constraints against other listeners by name; registration resolves the
//! constraints into one total order so dispatch is a plain iteration.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use super::context::MessageContext;
use super::Role;
use crate::error::Result;
use crate::protocol::{OfMessage, OfType};
use crate::switch::{Dpid, OfSwitch};

/// Verdict returned by a message listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Continue,
    Stop,
}

/// A consumer of dispatched OpenFlow messages.
pub trait OfMessageListener: Send + Sync {
    /// Stable name used for ordering declarations and logging.
    fn name(&self) -> &'static str;

    /// True if the named listener must run before this one for `msg_type`.
    fn is_callback_ordering_prereq(&self, _msg_type: OfType, _name: &str) -> bool {
        false
    }

    /// True if the named listener must run after this one for `msg_type`.
    fn is_callback_ordering_postreq(&self, _msg_type: OfType, _name: &str) -> bool {
        false
    }

    /// Switch filter; returning false skips this listener for the message.
    fn is_interested(&self, _sw: &OfSwitch) -> bool {
        true
    }

    fn receive(
        &self,
        sw: &Arc<OfSwitch>,
        msg: &OfMessage,
        ctx: &mut MessageContext,
    ) -> Result<Command>;
}

/// Observer of switch lifecycle updates.
pub trait SwitchListener: Send + Sync {
    fn name(&self) -> &'static str;
    fn switch_added(&self, sw: &Arc<OfSwitch>) -> Result<()>;
    fn switch_removed(&self, sw: &Arc<OfSwitch>) -> Result<()>;
    fn switch_port_changed(&self, dpid: Dpid) -> Result<()>;
}

/// Observer of controller HA state.
pub trait HaListener: Send + Sync {
    fn name(&self) -> &'static str;

    fn role_changed(&self, new_role: Role) -> Result<()>;

    fn controller_node_ips_changed(
        &self,
        _current: &HashMap<String, String>,
        _added: &HashMap<String, String>,
        _removed: &HashMap<String, String>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Ordered listener list for one OpenFlow message type.
///
/// The ordered vector is replaced wholesale on add/remove so readers can
/// hold a snapshot without blocking registration.
pub struct ListenerDispatcher {
    msg_type: OfType,
    listeners: RwLock<Arc<Vec<Arc<dyn OfMessageListener>>>>,
}

impl ListenerDispatcher {
    pub fn new(msg_type: OfType) -> Self {
        ListenerDispatcher {
            msg_type,
            listeners: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Snapshot of the current dispatch order.
    pub fn ordered_listeners(&self) -> Arc<Vec<Arc<dyn OfMessageListener>>> {
        self.listeners
            .read()
            .expect("listener lock poisoned")
            .clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn OfMessageListener>) {
        let mut guard = self.listeners.write().expect("listener lock poisoned");
        let mut all: Vec<Arc<dyn OfMessageListener>> = guard.as_ref().clone();
        all.retain(|l| l.name() != listener.name());
        all.push(listener);
        *guard = Arc::new(self.order(all));
    }

    pub fn remove_listener(&self, name: &str) {
        let mut guard = self.listeners.write().expect("listener lock poisoned");
        let mut all: Vec<Arc<dyn OfMessageListener>> = guard.as_ref().clone();
        all.retain(|l| l.name() != name);
        *guard = Arc::new(all);
    }

    /// Topologically sort listeners by their declared constraints. Insertion
    /// order breaks ties; a constraint cycle logs a warning and the cyclic
    /// tail keeps insertion order.
    fn order(&self, listeners: Vec<Arc<dyn OfMessageListener>>) -> Vec<Arc<dyn OfMessageListener>> {
        let n = listeners.len();
        // before[i] holds indices that must precede i
        let mut before: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                if listeners[i].is_callback_ordering_prereq(self.msg_type, listeners[j].name()) {
                    before[i].push(j);
                }
                if listeners[i].is_callback_ordering_postreq(self.msg_type, listeners[j].name()) {
                    before[j].push(i);
                }
            }
        }

        let mut placed = vec![false; n];
        let mut ordered = Vec::with_capacity(n);
        loop {
            let mut advanced = false;
            for i in 0..n {
                if placed[i] {
                    continue;
                }
                if before[i].iter().all(|&dep| placed[dep]) {
                    placed[i] = true;
                    ordered.push(listeners[i].clone());
                    advanced = true;
                }
            }
            if ordered.len() == n {
                break;
            }
            if !advanced {
                warn!(
                    "Listener ordering cycle for {}; falling back to insertion order",
                    self.msg_type
                );
                for i in 0..n {
                    if !placed[i] {
                        ordered.push(listeners[i].clone());
                    }
                }
                break;
            }
        }
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedListener {
        name: &'static str,
        prereqs: Vec<&'static str>,
    }

    impl OfMessageListener for NamedListener {
        fn name(&self) -> &'static str {
            self.name
        }

        fn is_callback_ordering_prereq(&self, _msg_type: OfType, name: &str) -> bool {
            self.prereqs.contains(&name)
        }

        fn receive(
            &self,
            _sw: &Arc<OfSwitch>,
            _msg: &OfMessage,
            _ctx: &mut MessageContext,
        ) -> Result<Command> {
            Ok(Command::Continue)
        }
    }

    fn names(dispatcher: &ListenerDispatcher) -> Vec<&'static str> {
        dispatcher
            .ordered_listeners()
            .iter()
            .map(|l| l.name())
            .collect()
    }

    #[test]
    fn test_prereq_ordering() {
        let dispatcher = ListenerDispatcher::new(OfType::PacketIn);
        dispatcher.add_listener(Arc::new(NamedListener {
            name: "forwarding",
            prereqs: vec!["topology", "devicemanager"],
        }));
        dispatcher.add_listener(Arc::new(NamedListener {
            name: "devicemanager",
            prereqs: vec!["topology"],
        }));
        dispatcher.add_listener(Arc::new(NamedListener {
            name: "topology",
            prereqs: vec![],
        }));

        assert_eq!(names(&dispatcher), vec!["topology", "devicemanager", "forwarding"]);
    }

    #[test]
    fn test_insertion_order_without_constraints() {
        let dispatcher = ListenerDispatcher::new(OfType::PacketIn);
        for name in ["a", "b", "c"] {
            dispatcher.add_listener(Arc::new(NamedListener {
                name,
                prereqs: vec![],
            }));
        }
        assert_eq!(names(&dispatcher), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_listener() {
        let dispatcher = ListenerDispatcher::new(OfType::PacketIn);
        for name in ["a", "b"] {
            dispatcher.add_listener(Arc::new(NamedListener {
                name,
                prereqs: vec![],
            }));
        }
        dispatcher.remove_listener("a");
        assert_eq!(names(&dispatcher), vec!["b"]);
    }

    #[test]
    fn test_reregistration_replaces() {
        let dispatcher = ListenerDispatcher::new(OfType::PacketIn);
        dispatcher.add_listener(Arc::new(NamedListener {
            name: "a",
            prereqs: vec![],
        }));
        dispatcher.add_listener(Arc::new(NamedListener {
            name: "a",
            prereqs: vec![],
        }));
        assert_eq!(names(&dispatcher).len(), 1);
    }

    #[test]
    fn test_cycle_falls_back_to_insertion_order() {
        let dispatcher = ListenerDispatcher::new(OfType::PacketIn);
        dispatcher.add_listener(Arc::new(NamedListener {
            name: "x",
            prereqs: vec!["y"],
        }));
        dispatcher.add_listener(Arc::new(NamedListener {
            name: "y",
            prereqs: vec!["x"],
        }));
        assert_eq!(names(&dispatcher), vec!["x", "y"]);
    }
}
