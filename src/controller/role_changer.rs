//! Per-switch role-request protocol.
//!
//! Role changes are pushed to switches as Nicira vendor role requests. Each
//! `submit_request` batch gets a cookie, a SEND task that emits the requests
//! and a TIMEOUT task that disconnects any switch still holding a pending
//! entry for that cookie. Replies and "not supported" errors are matched
//! against the FIRST pending entry per switch; anything else is a protocol
//! violation that closes the channel.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use super::Role;
use crate::error::Result;
use crate::protocol::OfMessage;
use crate::switch::OfSwitch;

/// One in-flight role request on a switch.
#[derive(Clone, Debug)]
pub struct PendingRoleRequestEntry {
    pub xid: u32,
    pub role: Role,
    pub cookie: u64,
    pub deadline: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskType {
    Send,
    Timeout,
}

/// A scheduled unit of role-change work.
///
/// SEND and TIMEOUT tasks from one `submit_request` share the switches
/// snapshot: the SEND prunes it down to the switches with a request in
/// flight, which is exactly the set the TIMEOUT must verify.
pub struct RoleChangeTask {
    pub(crate) switches: Arc<Mutex<Vec<Arc<OfSwitch>>>>,
    pub(crate) role: Option<Role>,
    pub(crate) cookie: u64,
    pub(crate) deadline: Instant,
    pub(crate) task_type: TaskType,
}

impl RoleChangeTask {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }
}

// Tasks order by deadline alone; ties may pop in any order.
impl PartialEq for RoleChangeTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for RoleChangeTask {}

impl PartialOrd for RoleChangeTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RoleChangeTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// Drives the vendor role-request protocol for every connected switch.
pub struct RoleChanger {
    // Pending entries keyed by connection id, drained in issue order
    pending_request_map: DashMap<u64, VecDeque<PendingRoleRequestEntry>>,
    // Min-heap of scheduled SEND/TIMEOUT tasks
    pending_tasks: Mutex<BinaryHeap<Reverse<RoleChangeTask>>>,
    task_added: Notify,
    timeout: Mutex<Duration>,
    next_cookie: AtomicU64,
    worker_started: AtomicBool,
}

impl RoleChanger {
    pub fn new(timeout: Duration) -> Self {
        RoleChanger {
            pending_request_map: DashMap::new(),
            pending_tasks: Mutex::new(BinaryHeap::new()),
            task_added: Notify::new(),
            timeout: Mutex::new(timeout),
            next_cookie: AtomicU64::new(rand::random()),
            worker_started: AtomicBool::new(false),
        }
    }

    /// Override the role-request timeout. Visible for tests and settings.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().expect("timeout lock poisoned") = timeout;
    }

    fn timeout(&self) -> Duration {
        *self.timeout.lock().expect("timeout lock poisoned")
    }

    /// Spawn the single worker that sleeps until the earliest deadline and
    /// executes due tasks. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.worker_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let changer = Arc::clone(self);
        tokio::spawn(async move {
            changer.worker_loop().await;
        });
    }

    async fn worker_loop(&self) {
        loop {
            let next_deadline = {
                let heap = self.pending_tasks.lock().expect("task heap poisoned");
                heap.peek().map(|Reverse(task)| task.deadline)
            };
            match next_deadline {
                None => self.task_added.notified().await,
                Some(deadline) => {
                    let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
                    tokio::select! {
                        _ = sleep => self.run_due_tasks(),
                        // A new task may now carry an earlier deadline
                        _ = self.task_added.notified() => {}
                    }
                }
            }
        }
    }

    fn run_due_tasks(&self) {
        loop {
            let task = {
                let mut heap = self.pending_tasks.lock().expect("task heap poisoned");
                let due = heap
                    .peek()
                    .map(|Reverse(task)| task.deadline <= Instant::now())
                    .unwrap_or(false);
                if due {
                    heap.pop().map(|Reverse(task)| task)
                } else {
                    None
                }
            };
            let Some(task) = task else { break };
            self.run_task(task);
        }
    }

    fn run_task(&self, task: RoleChangeTask) {
        match task.task_type {
            TaskType::Send => {
                let Some(role) = task.role else {
                    error!("SEND role task without a role; dropping");
                    return;
                };
                let mut switches = task.switches.lock().expect("task switches poisoned");
                self.send_role_request(&mut switches, role, task.cookie);
            }
            TaskType::Timeout => {
                let switches = task.switches.lock().expect("task switches poisoned").clone();
                self.verify_role_reply_received(&switches, task.cookie);
            }
        }
    }

    /// Enqueue a role-change batch: one SEND task due now and one TIMEOUT
    /// task due after the configured timeout. The caller's collection is
    /// copied, never retained.
    pub fn submit_request(&self, switches: &[Arc<OfSwitch>], role: Role) {
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        let snapshot = Arc::new(Mutex::new(switches.to_vec()));
        let now = Instant::now();
        let timeout = self.timeout();

        let mut heap = self.pending_tasks.lock().expect("task heap poisoned");
        heap.push(Reverse(RoleChangeTask {
            switches: Arc::clone(&snapshot),
            role: Some(role),
            cookie,
            deadline: now,
            task_type: TaskType::Send,
        }));
        heap.push(Reverse(RoleChangeTask {
            switches: snapshot,
            role: Some(role),
            cookie,
            deadline: now + timeout,
            task_type: TaskType::Timeout,
        }));
        drop(heap);
        self.task_added.notify_one();
    }

    /// Send a role request to every switch in the collection, mutating the
    /// collection in place: switches that cannot take the role or whose
    /// write fails are disconnected and removed. On return the collection
    /// holds only switches whose request is in flight or trivially satisfied
    /// by non-support.
    pub fn send_role_request(&self, switches: &mut Vec<Arc<OfSwitch>>, role: Role, cookie: u64) {
        let deadline = Instant::now() + self.timeout();
        switches.retain(|sw| match sw.supports_nx_role() {
            Some(false) => {
                if role == Role::Slave {
                    // A slave role cannot be enforced on a switch that does
                    // not honor it; sever the connection.
                    warn!(
                        "{} does not support role requests; cannot enforce SLAVE, disconnecting",
                        sw
                    );
                    sw.disconnect_output_stream();
                    false
                } else {
                    // The switch simply keeps acting as always-master.
                    true
                }
            }
            _ => match self.send_ha_role_request(sw, role, cookie) {
                Ok(xid) => {
                    self.pending_request_map
                        .entry(sw.connection_id())
                        .or_default()
                        .push_back(PendingRoleRequestEntry {
                            xid,
                            role,
                            cookie,
                            deadline,
                        });
                    true
                }
                Err(e) => {
                    warn!("Failed to send role request to {}: {}; disconnecting", sw, e);
                    sw.disconnect_output_stream();
                    false
                }
            },
        });
    }

    /// Write a single Nicira role request and return the xid used.
    pub fn send_ha_role_request(&self, sw: &OfSwitch, role: Role, cookie: u64) -> Result<u32> {
        let xid = sw.next_transaction_id();
        debug!(
            "Sending role request {} (xid={}, cookie={}) to {}",
            role, xid, cookie, sw
        );
        sw.write(vec![OfMessage::nicira_role_request(xid, role.to_nx_role())])?;
        Ok(xid)
    }

    /// Handle a role reply from the switch.
    pub fn deliver_role_reply(&self, sw: &Arc<OfSwitch>, xid: u32, role: Role) {
        let mut pending = self
            .pending_request_map
            .entry(sw.connection_id())
            .or_default();
        match pending.front() {
            None => {
                warn!(
                    "{} sent unsolicited role reply (xid={}); closing channel",
                    sw, xid
                );
                sw.close_channel();
            }
            Some(head) if head.xid != xid => {
                warn!(
                    "{} sent role reply with xid {} but {} was expected; closing channel",
                    sw, xid, head.xid
                );
                pending.clear();
                sw.close_channel();
            }
            Some(head) if head.role != role => {
                warn!(
                    "{} answered role {} but {} was requested; closing channel",
                    sw, role, head.role
                );
                pending.clear();
                sw.close_channel();
            }
            Some(_) => {
                pending.pop_front();
                sw.set_supports_nx_role(Some(true));
                sw.set_ha_role(Some(role), true);
            }
        }
    }

    /// Handle an OpenFlow error telling us the switch does not understand
    /// the vendor role request. The switch keeps operating in the requested
    /// role implicitly, which matches Open vSwitch behavior.
    pub fn deliver_role_request_not_supported(&self, sw: &Arc<OfSwitch>, xid: u32) {
        let mut pending = self
            .pending_request_map
            .entry(sw.connection_id())
            .or_default();
        match pending.front() {
            None => {
                warn!(
                    "{} sent unsolicited error for a role request (xid={}); closing channel",
                    sw, xid
                );
                sw.close_channel();
            }
            Some(head) if head.xid != xid => {
                warn!(
                    "{} sent role-request error with xid {} but {} was expected; closing channel",
                    sw, xid, head.xid
                );
                pending.clear();
                sw.close_channel();
            }
            Some(head) => {
                let requested = head.role;
                pending.pop_front();
                sw.set_supports_nx_role(Some(false));
                sw.set_ha_role(Some(requested), false);
            }
        }
    }

    /// TIMEOUT task body: any switch whose first pending entry still matches
    /// the batch cookie never answered in time. Clear its role (as if a null
    /// reply had arrived), keep support unknown, and disconnect.
    pub fn verify_role_reply_received(&self, switches: &[Arc<OfSwitch>], cookie: u64) {
        for sw in switches {
            if self.check_first_pending_role_request_cookie(sw, cookie) {
                warn!(
                    "{} did not answer role request (cookie={}) in time; disconnecting",
                    sw, cookie
                );
                if let Some(mut pending) = self.pending_request_map.get_mut(&sw.connection_id()) {
                    pending.clear();
                }
                sw.set_supports_nx_role(None);
                sw.set_ha_role(None, false);
            }
        }
    }

    /// True iff the switch's first pending entry carries this xid. Lets the
    /// channel handler decide whether a reply belongs to the role subsystem.
    pub fn check_first_pending_role_request_xid(&self, sw: &OfSwitch, xid: u32) -> bool {
        self.pending_request_map
            .get(&sw.connection_id())
            .and_then(|pending| pending.front().map(|entry| entry.xid == xid))
            .unwrap_or(false)
    }

    /// True iff the switch's first pending entry carries this cookie.
    pub fn check_first_pending_role_request_cookie(&self, sw: &OfSwitch, cookie: u64) -> bool {
        self.pending_request_map
            .get(&sw.connection_id())
            .and_then(|pending| pending.front().map(|entry| entry.cookie == cookie))
            .unwrap_or(false)
    }

    /// True if any pending entry on the switch requests this role. Used to
    /// suppress redundant reassertions.
    pub fn has_pending_request_for(&self, sw: &OfSwitch, role: Role) -> bool {
        self.pending_request_map
            .get(&sw.connection_id())
            .map(|pending| pending.iter().any(|entry| entry.role == role))
            .unwrap_or(false)
    }

    /// Drop all pending bookkeeping for a disconnected switch.
    pub fn remove_switch(&self, sw: &OfSwitch) {
        self.pending_request_map.remove(&sw.connection_id());
    }

    /// Number of scheduled SEND/TIMEOUT tasks.
    pub fn pending_task_count(&self) -> usize {
        self.pending_tasks.lock().expect("task heap poisoned").len()
    }

    /// Type of the earliest scheduled task, if any.
    pub fn next_pending_task_type(&self) -> Option<TaskType> {
        self.pending_tasks
            .lock()
            .expect("task heap poisoned")
            .peek()
            .map(|Reverse(task)| task.task_type)
    }

    #[cfg(test)]
    fn pending_list_len(&self, sw: &OfSwitch) -> usize {
        self.pending_request_map
            .get(&sw.connection_id())
            .map(|pending| pending.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn setup_pending_role_request(&self, sw: &OfSwitch, xid: u32, role: Role, cookie: u64) {
        self.pending_request_map
            .entry(sw.connection_id())
            .or_default()
            .push_back(PendingRoleRequestEntry {
                xid,
                role,
                cookie,
                deadline: Instant::now() + Duration::from_secs(5),
            });
    }
}
