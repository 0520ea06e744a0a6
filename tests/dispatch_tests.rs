//! Dispatcher and HA-gating integration tests against the public API.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use kestrel::controller::{
    Command, Controller, HaListener, MessageContext, OfMessageListener, Role,
};
use kestrel::error::Result;
use kestrel::protocol::{
    DescriptionStats, FeaturesReply, OfMessage, OfPayload, OfType, PacketIn,
};
use kestrel::settings::Settings;
use kestrel::switch::OfSwitch;

fn make_switch(connection_id: u64, dpid: u64) -> Arc<OfSwitch> {
    let (outbox_tx, _outbox_rx) = mpsc::unbounded_channel();
    let (closed_tx, _closed_rx) = watch::channel(false);
    Arc::new(OfSwitch::new(
        connection_id,
        FeaturesReply {
            datapath_id: dpid,
            n_buffers: 256,
            n_tables: 1,
            capabilities: 0,
            actions: 0,
            ports: vec![],
        },
        DescriptionStats::default(),
        "127.0.0.1:6633".parse().unwrap(),
        outbox_tx,
        closed_tx,
    ))
}

fn packet_in(xid: u32) -> OfMessage {
    let mut frame = vec![
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55,
    ];
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.extend_from_slice(&[0u8; 26]);
    OfMessage {
        xid,
        body: OfPayload::PacketIn(PacketIn {
            buffer_id: u32::MAX,
            total_len: frame.len() as u16,
            in_port: 3,
            reason: 0,
            data: Bytes::from(frame),
        }),
    }
}

fn test_settings() -> Settings {
    Settings {
        role_flap_dampen_ms: 50,
        ..Settings::default()
    }
}

struct CountingListener {
    name: &'static str,
    prereq: Option<&'static str>,
    interested: bool,
    calls: AtomicUsize,
    fail: bool,
    delay: Option<Duration>,
}

impl CountingListener {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(CountingListener {
            name,
            prereq: None,
            interested: true,
            calls: AtomicUsize::new(0),
            fail: false,
            delay: None,
        })
    }
}

impl OfMessageListener for CountingListener {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_callback_ordering_prereq(&self, _msg_type: OfType, name: &str) -> bool {
        self.prereq == Some(name)
    }

    fn is_interested(&self, _sw: &OfSwitch) -> bool {
        self.interested
    }

    fn receive(
        &self,
        _sw: &Arc<OfSwitch>,
        _msg: &OfMessage,
        _ctx: &mut MessageContext,
    ) -> Result<Command> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(kestrel::KestrelError::Protocol(
                "listener blew up".to_string(),
            ));
        }
        Ok(Command::Continue)
    }
}

struct RecordingHaListener {
    roles: Mutex<Vec<Role>>,
    ip_updates: Mutex<Vec<(usize, usize, usize)>>,
}

impl RecordingHaListener {
    fn new() -> Arc<Self> {
        Arc::new(RecordingHaListener {
            roles: Mutex::new(Vec::new()),
            ip_updates: Mutex::new(Vec::new()),
        })
    }
}

impl HaListener for RecordingHaListener {
    fn name(&self) -> &'static str {
        "recording-ha"
    }

    fn role_changed(&self, new_role: Role) -> Result<()> {
        self.roles.lock().unwrap().push(new_role);
        Ok(())
    }

    fn controller_node_ips_changed(
        &self,
        current: &HashMap<String, String>,
        added: &HashMap<String, String>,
        removed: &HashMap<String, String>,
    ) -> Result<()> {
        self.ip_updates
            .lock()
            .unwrap()
            .push((current.len(), added.len(), removed.len()));
        Ok(())
    }
}

#[tokio::test]
async fn test_set_role_notifies_ha_listeners_and_gates_dispatch() {
    let controller = Controller::new(test_settings());
    let ha = RecordingHaListener::new();
    controller.add_ha_listener(ha.clone());
    let listener = CountingListener::new("counter");
    controller.add_of_message_listener(OfType::PacketIn, listener.clone());
    let sw = make_switch(1, 0x2a);

    controller.handle_message(&sw, &packet_in(1), None).await.unwrap();
    assert_eq!(listener.calls.load(Ordering::SeqCst), 1);

    controller.set_role(Role::Slave, "peer took over");
    sleep(Duration::from_millis(100)).await;
    controller.process_update_queue_for_testing().await;

    assert_eq!(ha.roles.lock().unwrap().clone(), vec![Role::Slave]);
    assert_eq!(controller.get_role(), Role::Slave);
    assert_eq!(
        controller.get_role_info().change_description,
        "peer took over"
    );

    // Dispatch is now gated off
    controller.handle_message(&sw, &packet_in(2), None).await.unwrap();
    assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_listener_failure_does_not_stop_the_chain() {
    let controller = Controller::new(test_settings());
    let failing = Arc::new(CountingListener {
        name: "failing",
        prereq: None,
        interested: true,
        calls: AtomicUsize::new(0),
        fail: true,
        delay: None,
    });
    let after = Arc::new(CountingListener {
        name: "after",
        prereq: Some("failing"),
        interested: true,
        calls: AtomicUsize::new(0),
        fail: false,
        delay: None,
    });
    controller.add_of_message_listener(OfType::PacketIn, failing.clone());
    controller.add_of_message_listener(OfType::PacketIn, after.clone());

    let sw = make_switch(1, 0x2a);
    controller.handle_message(&sw, &packet_in(1), None).await.unwrap();

    assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    assert_eq!(after.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_switch_filter_skips_uninterested_listener() {
    let controller = Controller::new(test_settings());
    let bored = Arc::new(CountingListener {
        name: "bored",
        prereq: None,
        interested: false,
        calls: AtomicUsize::new(0),
        fail: false,
        delay: None,
    });
    controller.add_of_message_listener(OfType::PacketIn, bored.clone());

    let sw = make_switch(1, 0x2a);
    controller.handle_message(&sw, &packet_in(1), None).await.unwrap();
    assert_eq!(bored.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_node_ip_update_reaches_ha_listeners() {
    let controller = Controller::new(test_settings());
    let ha = RecordingHaListener::new();
    controller.add_ha_listener(ha.clone());

    let mut ips = HashMap::new();
    ips.insert("c1".to_string(), "10.0.0.1".to_string());
    ips.insert("c2".to_string(), "10.0.0.2".to_string());
    controller.notify_controller_node_ips(ips).await;
    controller.process_update_queue_for_testing().await;

    assert_eq!(ha.ip_updates.lock().unwrap().clone(), vec![(2, 2, 0)]);
}

#[tokio::test]
async fn test_inject_requires_active_switch() {
    let controller = Controller::new(test_settings());
    let listener = CountingListener::new("counter");
    controller.add_of_message_listener(OfType::PacketIn, listener.clone());

    let sw = make_switch(1, 0x2a);
    assert!(!controller.inject_of_message(&sw, &packet_in(1)).await);
    assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
}

/// Messages received before a SLAVE transition are either fully delivered
/// to the listener chain or not delivered at all; after the transition no
/// listener runs.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_partial_delivery_across_slave_transition() {
    let controller = Controller::new(test_settings());
    let first = Arc::new(CountingListener {
        name: "first",
        prereq: None,
        interested: true,
        calls: AtomicUsize::new(0),
        fail: false,
        delay: Some(Duration::from_millis(2)),
    });
    let second = Arc::new(CountingListener {
        name: "second",
        prereq: Some("first"),
        interested: true,
        calls: AtomicUsize::new(0),
        fail: false,
        delay: None,
    });
    controller.add_of_message_listener(OfType::PacketIn, first.clone());
    controller.add_of_message_listener(OfType::PacketIn, second.clone());

    let sw = make_switch(1, 0x2a);
    let stop = Arc::new(AtomicBool::new(false));

    let dispatcher = {
        let controller = controller.clone();
        let sw = sw.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut xid = 0;
            while !stop.load(Ordering::SeqCst) {
                xid += 1;
                controller
                    .handle_message(&sw, &packet_in(xid), None)
                    .await
                    .unwrap();
            }
        })
    };

    sleep(Duration::from_millis(50)).await;
    controller.set_role(Role::Slave, "transition");
    sleep(Duration::from_millis(100)).await;
    // Dispatching the HA update blocks until in-flight listener chains drain
    controller.process_update_queue_for_testing().await;

    let first_calls = first.calls.load(Ordering::SeqCst);
    let second_calls = second.calls.load(Ordering::SeqCst);
    assert_eq!(
        first_calls, second_calls,
        "a message was delivered to only part of the chain"
    );

    // No listener may run after the SLAVE notification
    sleep(Duration::from_millis(50)).await;
    assert_eq!(first.calls.load(Ordering::SeqCst), first_calls);

    stop.store(true, Ordering::SeqCst);
    dispatcher.await.unwrap();
}
