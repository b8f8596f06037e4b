//! End-to-end tests over the in-memory radio
//!
//! Two state machines, each with its own queue, run the profile exchange
//! against each other the way two phones would over a real link.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshlink_ble::{
    luid_service_data, operation, ConnectionStateMachine, LinkEvent, LocalProfile, MemoryRadio,
    NamedMutex, OperationQueue, ProfileExchange, RadioCommand, Schedulers,
};
use meshlink_core::protocol::IdentityPacket;
use meshlink_core::{Luid, MeshConfig, Priority};

fn node(radio: MemoryRadio, config: MeshConfig) -> Arc<ConnectionStateMachine<MemoryRadio>> {
    let schedulers = Schedulers::current().expect("runtime");
    let queue = OperationQueue::start(&schedulers, &config);
    Arc::new(ConnectionStateMachine::new(
        Arc::new(radio),
        queue,
        schedulers,
        config,
    ))
}

fn identity(name: &str) -> IdentityPacket {
    IdentityPacket {
        name: name.to_string(),
        public_key: vec![7; 32],
        signature: vec![9; 64],
        end: false,
    }
}

#[tokio::test]
async fn test_two_nodes_exchange_profiles() {
    let (a, b) = MemoryRadio::pair();
    let (a_luid, b_luid) = (Luid::random(), Luid::random());
    let a_device = a.device();
    let b_device = b.device();
    let node_a = node(a.clone(), MeshConfig::default());
    let node_b = node(b.clone(), MeshConfig::default());

    let responder = {
        let node_b = node_b.clone();
        let b = b.clone();
        tokio::spawn(async move {
            let initiator = b.accept().await.expect("inbound link");
            assert_eq!(initiator, a_device);
            let mut handler = ProfileExchange::new(
                LocalProfile::new(b_luid)
                    .with_provides(vec![2, 4])
                    .with_identity(identity("bob"))
                    .with_hashes(vec![vec![1; 32]]),
            );
            node_b
                .run_transaction(&initiator, a_luid, true, &mut handler)
                .await
        })
    };

    let mut handler = ProfileExchange::new(
        LocalProfile::new(a_luid)
            .with_identity(identity("alice"))
            .with_identity(identity("alice-work")),
    );
    let from_a = node_a
        .run_transaction(&b_device, b_luid, false, &mut handler)
        .await
        .expect("initiator handshake")
        .into_item()
        .expect("profile learned by initiator");
    let from_b = responder
        .await
        .expect("responder task")
        .expect("responder handshake")
        .into_item()
        .expect("profile learned by responder");

    assert_eq!(from_a.luid, Some(b_luid));
    assert_eq!(from_a.provides, vec![2, 4]);
    assert_eq!(from_a.identities, vec![identity("bob")]);
    assert_eq!(from_a.hashes, vec![vec![1; 32]]);

    assert_eq!(from_b.luid, Some(a_luid));
    assert_eq!(from_b.provides, vec![0]);
    assert_eq!(from_b.identities.len(), 2);
    assert!(from_b.hashes.is_empty());

    assert_ne!(from_a.leader, from_b.leader);
    assert_eq!(from_a.leader, a_luid > b_luid);

    assert!(!node_a.is_locked(b_luid));
    assert!(!node_b.is_locked(a_luid));
    assert_eq!(node_a.transactions(), 0);
    assert!(node_a.is_active(b_luid));
    assert!(node_b.is_active(a_luid));
}

#[tokio::test]
async fn test_cached_link_carries_consecutive_transactions() {
    let (a, b) = MemoryRadio::pair();
    let (a_luid, b_luid) = (Luid::random(), Luid::random());
    let radio_a = a.clone();
    let b_device = b.device();
    let node_a = node(a, MeshConfig::default());
    let node_b = node(b.clone(), MeshConfig::default());

    let responder = {
        let node_b = node_b.clone();
        tokio::spawn(async move {
            let initiator = b.accept().await.expect("inbound link");
            let mut learned = Vec::new();
            for round in 0..2u32 {
                let mut handler =
                    ProfileExchange::new(LocalProfile::new(b_luid).with_provides(vec![round]));
                let outcome = node_b
                    .run_transaction(&initiator, a_luid, true, &mut handler)
                    .await
                    .expect("responder handshake");
                learned.push(outcome.into_item().expect("profile learned by responder"));
            }
            learned
        })
    };

    for round in 0..2u32 {
        let mut handler = ProfileExchange::new(LocalProfile::new(a_luid));
        let profile = node_a
            .run_transaction(&b_device, b_luid, false, &mut handler)
            .await
            .expect("initiator handshake")
            .into_item()
            .expect("profile learned by initiator");
        assert_eq!(profile.luid, Some(b_luid));
        assert_eq!(profile.provides, vec![round]);
        assert!(node_a.is_active(b_luid));
    }
    let learned = responder.await.expect("responder task");
    assert_eq!(learned.len(), 2);
    assert!(learned.iter().all(|profile| profile.luid == Some(a_luid)));

    let commands = radio_a.commands();
    let connects = commands
        .iter()
        .filter(|c| matches!(c, RadioCommand::Connect { .. }))
        .count();
    let subscribes = commands
        .iter()
        .filter(|c| matches!(c, RadioCommand::Subscribe { .. }))
        .count();
    assert_eq!(connects, 1);
    assert_eq!(subscribes, 1);
    assert!(!commands
        .iter()
        .any(|c| matches!(c, RadioCommand::Disconnect { .. })));
}

#[tokio::test]
async fn test_writes_never_exceed_fragment_size() {
    let (a, b) = MemoryRadio::pair();
    let (a_luid, b_luid) = (Luid::random(), Luid::random());
    let radio_a = a.clone();
    let b_device = b.device();
    let node_a = node(a, MeshConfig::default());
    let node_b = node(b.clone(), MeshConfig::default());

    let responder = tokio::spawn(async move {
        let initiator = b.accept().await.expect("inbound link");
        let mut handler = ProfileExchange::new(LocalProfile::new(b_luid));
        node_b
            .run_transaction(&initiator, a_luid, true, &mut handler)
            .await
    });

    let mut handler =
        ProfileExchange::new(LocalProfile::new(a_luid).with_identity(identity("a-long-name")));
    node_a
        .run_transaction(&b_device, b_luid, false, &mut handler)
        .await
        .expect("handshake");
    responder.await.expect("task").expect("responder");

    let writes: Vec<usize> = radio_a
        .commands()
        .into_iter()
        .filter_map(|c| match c {
            RadioCommand::Write { len, .. } => Some(len),
            _ => None,
        })
        .collect();
    assert!(writes.len() > 7);
    assert!(writes.iter().all(|&len| len <= 20));
    assert!(writes.iter().any(|&len| len == 20));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_handshake_times_out_and_tears_down() {
    let (a, b) = MemoryRadio::pair();
    let luid = Luid::random();
    let radio = a.clone();
    let config = MeshConfig::default().with_transaction_timeout(Duration::from_secs(1));
    let node_a = node(a, config);
    let device = b.device();
    let mut events = node_a.events();

    let first = {
        let node_a = node_a.clone();
        let device = device.clone();
        tokio::spawn(async move {
            let mut handler = ProfileExchange::new(LocalProfile::new(Luid::random()));
            node_a
                .run_transaction(&device, luid, false, &mut handler)
                .await
        })
    };
    while !node_a.is_locked(luid) {
        tokio::task::yield_now().await;
    }

    let mut handler = ProfileExchange::new(LocalProfile::new(Luid::random()));
    let second = node_a
        .run_transaction(&device, luid, false, &mut handler)
        .await
        .expect("busy is not an error");
    assert!(second.is_busy());

    let err = first.await.expect("task").expect_err("peer never answers");
    assert!(err.is_timeout());
    assert!(!node_a.is_locked(luid));
    assert!(!node_a.is_active(luid));
    assert!(node_a.connected().is_empty());
    assert_eq!(node_a.transactions(), 0);

    let commands = radio.commands();
    let disconnect = commands
        .iter()
        .position(|c| matches!(c, RadioCommand::Disconnect { .. }))
        .expect("link torn down");
    let reset = commands
        .iter()
        .position(|c| matches!(c, RadioCommand::ResetLinkParameters))
        .expect("parameters reset");
    assert!(disconnect < reset);

    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        if let LinkEvent::TransactionFinished { success, .. } = event {
            finished = Some(success);
        }
    }
    assert_eq!(finished, Some(false));
}

#[tokio::test]
async fn test_scanned_advertisement_drives_connect_decision() {
    let (a, b) = MemoryRadio::pair();
    let b_luid = Luid::random();
    b.advertise(luid_service_data(b_luid));
    let node_a = node(a.clone(), MeshConfig::default());

    let found = a.scan();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].luid(), Some(b_luid));
    assert!(node_a.should_connect(&found[0]));

    node_a
        .establish_connection_cached(&found[0].device, b_luid, false)
        .await
        .expect("connect");
    assert!(!node_a.should_connect(&found[0]));
}

#[tokio::test]
async fn test_queue_runs_one_operation_at_a_time_in_order() {
    let schedulers = Schedulers::current().expect("runtime");
    let queue = OperationQueue::start(&schedulers, &MeshConfig::default());
    let order = Arc::new(Mutex::new(Vec::new()));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let order = order.clone();
            let running = running.clone();
            let peak = peak.clone();
            let priority = if i == 5 { Priority::High } else { Priority::Normal };
            queue.submit(
                operation("step", move |_ctx| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    order.lock().unwrap().push(i);
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
                .with_priority(priority),
            )
        })
        .collect();
    for handle in handles {
        handle.result().await.expect("operation");
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let order = order.lock().unwrap().clone();
    assert_eq!(order.len(), 6);
    let normals: Vec<_> = order.iter().copied().filter(|&i| i != 5).collect();
    assert_eq!(normals, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_named_mutex_excludes_same_name_only() {
    let mutex = NamedMutex::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let mutex = mutex.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                let _guard = mutex.lock("link:shared").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1 + i % 2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();

    let _other = mutex.lock("link:other").await;
    for task in tasks {
        task.await.expect("task");
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(!mutex.is_locked("link:shared"));
    assert!(mutex.is_locked("link:other"));
}
