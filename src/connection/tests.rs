// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Barrier,
};

use super::*;

#[derive(Debug)]
struct TestDevice {
    id: EndpointId,
    hub: Hub,
}

impl SharedDevice for TestDevice {
    fn endpoint_id(&self) -> &EndpointId {
        &self.id
    }

    fn hub(&self) -> &Hub {
        &self.hub
    }

    fn send(&self, _words: &[u32]) -> bool {
        false
    }
}

fn worker() -> WorkerHandle {
    WorkerHandle::spawn("test-worker").unwrap()
}

fn open_counted(
    cache: &ConnectionCache<TestDevice>,
    worker: &WorkerHandle,
    id: &EndpointId,
    open_count: &AtomicUsize,
) -> Option<Arc<TestDevice>> {
    cache.open(id, |id| {
        open_count.fetch_add(1, Ordering::SeqCst);
        // Widen the window for races
        std::thread::sleep(std::time::Duration::from_millis(10));
        Some(Arc::new(TestDevice {
            id: id.clone(),
            hub: Hub::new(worker.clone()),
        }))
    })
}

#[test]
fn concurrent_opens_share_a_single_device() {
    const THREADS: usize = 8;
    let cache = ConnectionCache::default();
    let worker = worker();
    let id = EndpointId::bidirectional("usb-1");
    let open_count = AtomicUsize::new(0);
    let barrier = Barrier::new(THREADS);
    let devices = std::thread::scope(|scope| {
        let handles = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    open_counted(&cache, &worker, &id, &open_count).unwrap()
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });
    assert_eq!(1, open_count.load(Ordering::SeqCst));
    assert!(devices
        .iter()
        .all(|device| Arc::ptr_eq(device, &devices[0])));
    assert_eq!(THREADS, Arc::strong_count(&devices[0]));

    drop(devices);
    assert!(cache.live().is_empty());
    let reopened = open_counted(&cache, &worker, &id, &open_count).unwrap();
    assert_eq!(2, open_count.load(Ordering::SeqCst));
    assert_eq!(&id, reopened.endpoint_id());
}

#[test]
fn distinct_ids_get_distinct_devices() {
    let cache = ConnectionCache::default();
    let worker = worker();
    let open_count = AtomicUsize::new(0);
    let first = open_counted(&cache, &worker, &EndpointId::bidirectional("a"), &open_count);
    let second = open_counted(&cache, &worker, &EndpointId::bidirectional("b"), &open_count);
    assert!(!Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
    assert_eq!(2, open_count.load(Ordering::SeqCst));
}

#[test]
fn failed_opens_are_not_cached() {
    let cache = ConnectionCache::<TestDevice>::default();
    let id = EndpointId::bidirectional("gone");
    assert!(cache.open(&id, |_| None).is_none());
    assert!(cache.live().is_empty());
}

#[test]
fn disconnected_devices_are_reopened_after_release() {
    let cache = ConnectionCache::default();
    let worker = worker();
    let id = EndpointId::bidirectional("usb-1");
    let open_count = AtomicUsize::new(0);
    let first = open_counted(&cache, &worker, &id, &open_count).unwrap();
    first.hub().notify_disconnected();

    // The native handle is still open
    let same = open_counted(&cache, &worker, &id, &open_count).unwrap();
    assert!(Arc::ptr_eq(&first, &same));
    assert!(same.hub().is_disconnected());
    assert_eq!(1, open_count.load(Ordering::SeqCst));
    assert_eq!(1, cache.live().len());

    drop(first);
    drop(same);
    let reopened = open_counted(&cache, &worker, &id, &open_count).unwrap();
    assert!(!reopened.hub().is_disconnected());
    assert_eq!(2, open_count.load(Ordering::SeqCst));
}

#[derive(Debug, Default)]
struct CountingListener {
    count: AtomicUsize,
}

impl DisconnectionListener for CountingListener {
    fn disconnected(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn disconnection_is_delivered_once() {
    let worker = worker();
    let hub = Hub::new(worker.clone());
    let first = Arc::new(CountingListener::default());
    let second = Arc::new(CountingListener::default());
    let first_dyn: Arc<dyn DisconnectionListener> = Arc::clone(&first) as _;
    let second_dyn: Arc<dyn DisconnectionListener> = Arc::clone(&second) as _;
    hub.add_disconnection_listener(&first_dyn);
    hub.add_disconnection_listener(&second_dyn);

    hub.notify_disconnected();
    hub.notify_disconnected();
    assert!(worker.flush());

    assert!(hub.is_disconnected());
    assert_eq!(1, first.count.load(Ordering::SeqCst));
    assert_eq!(1, second.count.load(Ordering::SeqCst));
}

#[test]
fn removed_listeners_are_not_notified() {
    let worker = worker();
    let hub = Hub::new(worker.clone());
    let listener = Arc::new(CountingListener::default());
    let listener_dyn: Arc<dyn DisconnectionListener> = Arc::clone(&listener) as _;
    hub.add_disconnection_listener(&listener_dyn);
    hub.remove_disconnection_listener(&listener_dyn);
    hub.remove_disconnection_listener(&listener_dyn);
    hub.notify_disconnected();
    assert!(worker.flush());
    assert_eq!(0, listener.count.load(Ordering::SeqCst));
}

#[test]
fn delivery_stops_after_disconnection() {
    let hub = Hub::new(worker());
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let consumer: Arc<dyn Consumer> = Arc::new(move |packet: View<'_>, _timestamp: f64| {
        sink.lock().push(packet.first_word());
    });
    hub.add_consumer(&consumer);
    hub.deliver_words(&[0x2090_3c64, 0x2080_3c00], 0.0);
    hub.notify_disconnected();
    hub.deliver_words(&[0x20b0_0100], 0.0);
    assert_eq!(vec![0x2090_3c64, 0x2080_3c00], *received.lock());

    hub.remove_consumer(&consumer);
    hub.remove_consumer(&consumer);
}
