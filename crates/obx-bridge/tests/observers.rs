use obx_bridge::{
    Bridge, BridgeConfig, BridgeError, HandleKind, LocalPorts, MemoryStore, Payload, PortId,
    StoreEngine,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

fn bridge_with_ports() -> (Bridge, LocalPorts) {
    let ports = LocalPorts::new(0);
    let bridge = Bridge::new(BridgeConfig::default());
    bridge
        .init(Arc::new(ports.clone()))
        .expect("init should succeed");
    (bridge, ports)
}

#[test]
fn change_is_posted_until_observer_closes() {
    let (bridge, ports) = bridge_with_ports();
    let rx = ports.open_with_id(PortId(42));
    let store = Arc::new(MemoryStore::new());
    let engine: Arc<dyn StoreEngine> = store.clone();

    let handle = bridge
        .observe(&engine, PortId(42))
        .expect("observe should succeed");
    store.commit(&[3]);
    assert_eq!(rx.drain(), vec![Payload::ints([3])]);

    bridge
        .close_observer(Some(handle))
        .expect("close should succeed");
    store.commit(&[3]);
    assert!(rx.drain().is_empty());
    assert_eq!(store.observer_count(), 0);
}

#[test]
fn observers_on_one_store_each_get_their_own_port() {
    let (bridge, ports) = bridge_with_ports();
    let all_rx = ports.open();
    let single_rx = ports.open();
    let store = Arc::new(MemoryStore::new());
    let engine: Arc<dyn StoreEngine> = store.clone();

    let all = bridge
        .observe(&engine, all_rx.id())
        .expect("observe should succeed");
    let single = bridge
        .observe_single_type(&engine, 7, single_rx.id())
        .expect("observe should succeed");

    store.commit(&[1, 7]);
    store.commit(&[2]);

    assert_eq!(
        all_rx.drain(),
        vec![Payload::ints([1, 7]), Payload::ints([2])]
    );
    assert_eq!(single_rx.drain(), vec![Payload::ints([7])]);
    assert_eq!(
        bridge.observer_info(single).expect("live observer").delivered,
        1
    );

    bridge.close_observer(Some(all)).expect("close");
    bridge.close_observer(Some(single)).expect("close");
}

#[test]
fn observing_a_closed_store_is_invalid_handle() {
    let (bridge, ports) = bridge_with_ports();
    let rx = ports.open();
    let store = Arc::new(MemoryStore::new());
    store.close();
    let engine: Arc<dyn StoreEngine> = store;

    let err = bridge
        .observe(&engine, rx.id())
        .expect_err("closed store should be rejected");
    assert_eq!(err, BridgeError::invalid_handle(HandleKind::Store));
    assert_eq!(err.code(), 2);
}

#[test]
fn nothing_is_posted_after_close_returns_under_concurrent_commits() {
    let (bridge, ports) = bridge_with_ports();
    let rx = ports.open();
    let store = Arc::new(MemoryStore::new());
    let engine: Arc<dyn StoreEngine> = store.clone();
    let handle = bridge
        .observe(&engine, rx.id())
        .expect("observe should succeed");

    let stop = Arc::new(AtomicBool::new(false));
    let committers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    store.commit(&[1]);
                }
            })
        })
        .collect();

    while rx.pending() < 100 {
        thread::yield_now();
    }
    bridge
        .close_observer(Some(handle))
        .expect("close should succeed");
    let before = rx.drain().len();
    assert!(before >= 100);

    thread::sleep(Duration::from_millis(20));
    stop.store(true, Ordering::Relaxed);
    for committer in committers {
        committer.join().expect("committer thread");
    }
    assert!(rx.drain().is_empty(), "event posted after close returned");
}
